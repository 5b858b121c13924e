//! Knowledge base module for LocalRAG
//! Chunking, embedding, vector storage, ingestion and retrieval

pub mod chunker;
pub mod embeddings;
pub mod ingest;
pub mod lifecycle;
pub mod locks;
pub mod metadata;
pub mod search;
pub mod vectors;
