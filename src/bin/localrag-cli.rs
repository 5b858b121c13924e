//! LocalRAG CLI - Command-line access to the offline RAG pipeline
//!
//! Usage:
//!   localrag-cli runtime init [--foreground]
//!   localrag-cli runtime status
//!   localrag-cli runtime shutdown
//!   localrag-cli ingest <FILE> --kb <KB_ID> [--file-id <ID>]
//!   localrag-cli note <NOTE_ID> --title <TITLE> (--file <PATH> | --text <TEXT>)
//!   localrag-cli search <QUERY> -c <COLLECTION>... [-n <LIMIT>] [--json] [--context]
//!   localrag-cli drop kb <KB_ID> | note <NOTE_ID> | file <KB_ID> <FILE_ID>
//!   localrag-cli models list | delete <NAME>

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use localrag_lib::config::RagConfig;
use localrag_lib::kb::ingest::{DocumentUpload, NoteInput, PipelineEvent, ProgressCallback};
use localrag_lib::kb::embeddings::EmbeddingClient;
use localrag_lib::runtime::ProbeOutcome;
use localrag_lib::RagServices;

/// LocalRAG command-line interface.
///
/// Ingests documents and notes into per-collection vector stores using a
/// locally provisioned embedding runtime, and searches them offline.
#[derive(Parser)]
#[command(name = "localrag-cli", version, about)]
struct Cli {
    /// YAML config file (LOCALRAG_* environment variables still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the local inference runtime
    #[command(subcommand)]
    Runtime(RuntimeCommand),

    /// Ingest a document into a knowledge base
    Ingest {
        file: PathBuf,
        #[arg(long)]
        kb: String,
        #[arg(long)]
        file_id: Option<String>,
    },

    /// Embed a note into its own collection, replacing previous vectors
    Note {
        note_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        #[arg(long)]
        text: Option<String>,
    },

    /// Search one or more collections
    Search {
        query: String,
        /// Knowledge base or note ids to search
        #[arg(short = 'c', long = "collection", required = true)]
        collections: Vec<String>,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Output results as JSON
        #[arg(long)]
        json: bool,
        /// Print the formatted prompt context instead of a result table
        #[arg(long)]
        context: bool,
    },

    /// Delete a knowledge base, note or single file
    #[command(subcommand)]
    Drop(DropCommand),

    /// Inspect models installed in the runtime
    #[command(subcommand)]
    Models(ModelsCommand),
}

#[derive(Subcommand)]
enum RuntimeCommand {
    /// Detect or launch the runtime
    Init {
        /// Keep running and stop a self-managed runtime on Ctrl-C
        #[arg(long)]
        foreground: bool,
    },
    /// Probe the runtime endpoint
    Status,
    /// Stop runtime processes started from the provisioned binary
    Shutdown,
}

#[derive(Subcommand)]
enum DropCommand {
    Kb { kb_id: String },
    Note { note_id: String },
    File { kb_id: String, file_id: String },
}

#[derive(Subcommand)]
enum ModelsCommand {
    List,
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("localrag=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = RagConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Command::Models(cmd) => run_models_command(&config, cmd).await,
        command => {
            let services = RagServices::new(config).await?;
            run_command(&services, command).await
        }
    }
}

async fn run_command(services: &RagServices, command: Command) -> Result<()> {
    match command {
        Command::Runtime(cmd) => run_runtime_command(services, cmd).await,
        Command::Ingest { file, kb, file_id } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Input path has no file name")?;

            let upload = DocumentUpload {
                kb_id: kb.clone(),
                file_id,
                file_name,
                bytes,
            };
            let outcome = services
                .with_runtime(services.ingest_document(upload, print_events()))
                .await?;
            println!(
                "Ingested {} into {} ({} chunks, stored at {:?})",
                outcome.file_id, kb, outcome.chunk_count, outcome.storage_path
            );
            Ok(())
        }
        Command::Note {
            note_id,
            title,
            file,
            text,
        } => {
            let content = match (file, text) {
                (Some(path), None) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {:?}", path))?,
                (None, Some(text)) => text,
                _ => bail!("Provide the note content with --file or --text"),
            };

            let note = NoteInput {
                note_id,
                title,
                content,
            };
            let outcome = services
                .with_runtime(services.embed_note(note, print_events()))
                .await?;
            println!("Embedded note {} ({} chunks)", outcome.note_id, outcome.chunk_count);
            Ok(())
        }
        Command::Search {
            query,
            collections,
            limit,
            json,
            context,
        } => {
            let snippets = services
                .with_runtime(services.search(&query, &collections, limit))
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snippets)?);
            } else if context {
                println!("{}", services.assembler.format_context(&snippets));
            } else if snippets.is_empty() {
                println!("No results.");
            } else {
                println!("{:<4} {:<8} {:<20} {:<24} CONTENT", "#", "SCORE", "COLLECTION", "SOURCE");
                println!("{}", "-".repeat(80));
                for (i, s) in snippets.iter().enumerate() {
                    let source = s.title.as_deref().unwrap_or(&s.file_id);
                    let preview: String = s.content.chars().take(60).collect();
                    println!(
                        "{:<4} {:<8.3} {:<20} {:<24} {}",
                        i + 1,
                        s.similarity,
                        s.collection_id,
                        source,
                        preview.replace('\n', " ")
                    );
                }
            }
            Ok(())
        }
        Command::Drop(cmd) => {
            match cmd {
                DropCommand::Kb { kb_id } => {
                    services.lifecycle.delete_knowledge_base(&kb_id).await?;
                    println!("Deleted knowledge base {}", kb_id);
                }
                DropCommand::Note { note_id } => {
                    services.lifecycle.delete_note(&note_id).await?;
                    println!("Deleted note {}", note_id);
                }
                DropCommand::File { kb_id, file_id } => {
                    services.lifecycle.delete_file(&kb_id, &file_id).await?;
                    println!("Deleted file {} from {}", file_id, kb_id);
                }
            }
            Ok(())
        }
        Command::Models(cmd) => run_models_command(&services.config, cmd).await,
    }
}

async fn run_runtime_command(services: &RagServices, cmd: RuntimeCommand) -> Result<()> {
    match cmd {
        RuntimeCommand::Init { foreground } => {
            let state = services.start().await?;
            println!("Runtime at {} ({})", state.base_url, state.source);

            if foreground {
                println!("Press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                services.stop().await?;
            }
            Ok(())
        }
        RuntimeCommand::Status => {
            let base_url = &services.config.runtime.base_url;
            match services.provisioner.probe().await {
                ProbeOutcome::Recognized(models) => {
                    println!("Runtime reachable at {}", base_url);
                    println!("Models: {}", models.len());
                }
                ProbeOutcome::Unrecognized => {
                    println!("Something is listening at {} but it is not a model runtime", base_url)
                }
                ProbeOutcome::Unreachable => println!("Runtime not reachable at {}", base_url),
            }
            let executable = services.provisioner.layout().executable();
            println!(
                "Provisioned binary: {:?} ({})",
                executable,
                if executable.exists() { "installed" } else { "not installed" }
            );
            Ok(())
        }
        RuntimeCommand::Shutdown => {
            let stopped = services.provisioner.terminate_provisioned()?;
            println!("Stopped {} runtime process(es)", stopped);
            Ok(())
        }
    }
}

async fn run_models_command(config: &RagConfig, cmd: ModelsCommand) -> Result<()> {
    let client = EmbeddingClient::new(config)?;
    match cmd {
        ModelsCommand::List => {
            let models = client.list_models().await?;
            if models.is_empty() {
                println!("No models installed.");
            }
            for model in models {
                println!("{}", model);
            }
        }
        ModelsCommand::Delete { name } => {
            client.delete_model(&name).await?;
            println!("Deleted model {}", name);
        }
    }
    Ok(())
}

fn print_events() -> ProgressCallback {
    Arc::new(|event| match event {
        PipelineEvent::Progress(p) => {
            eprintln!("[{:>5.1}%] {:<10} {}", p.percent, p.stage.name(), p.message)
        }
        PipelineEvent::Completed { chunk_count, .. } => {
            eprintln!("[100.0%] completed  {} chunks", chunk_count)
        }
        PipelineEvent::Failed { error, .. } => eprintln!("failed: {}", error.message),
    })
}
