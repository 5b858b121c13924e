//! Bundled offline assets for the local runtime
//! Locates the per-platform executable and model blobs, and installs them
//! into the writable runtime directory

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::ProvisionError;

/// Executable file name of the bundled runtime
pub fn executable_name() -> &'static str {
    if cfg!(windows) {
        "ollama.exe"
    } else {
        "ollama"
    }
}

/// `<os>-<arch>` key used to pick the bundled executable
pub fn platform_key() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Writable directory layout for a self-managed runtime
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    root: PathBuf,
}

impl RuntimeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn executable(&self) -> PathBuf {
        self.root.join("bin").join(executable_name())
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn home_dir(&self) -> PathBuf {
        self.root.join("home")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn ensure_dirs(&self) -> Result<(), ProvisionError> {
        for dir in [
            self.root.join("bin"),
            self.models_dir(),
            self.home_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Files copied by an install step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub copied: usize,
    pub skipped: usize,
}

/// Read-only bundle shipped with the application
#[derive(Debug, Clone)]
pub struct BundledAssets {
    bundle_dir: PathBuf,
}

impl BundledAssets {
    pub fn new(bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
        }
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Bundled executable for the current OS/architecture
    pub fn runtime_executable(&self) -> PathBuf {
        self.bundle_dir
            .join("runtime")
            .join(platform_key())
            .join(executable_name())
    }

    /// Bundled model directory, trying the exact name first and then the untagged name
    pub fn model_dir(&self, model: &str) -> Option<PathBuf> {
        let models = self.bundle_dir.join("models");
        let exact = models.join(model.replace(':', "_"));
        if exact.is_dir() {
            return Some(exact);
        }
        let base = model.split(':').next().unwrap_or(model);
        let untagged = models.join(base);
        untagged.is_dir().then_some(untagged)
    }

    /// Names of every bundled model directory
    pub fn bundled_models(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.bundle_dir.join("models")) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        names.sort();
        names
    }

    /// Copy the bundled executable into the layout. Skips the copy when an
    /// identical-size file is already installed.
    pub fn install_runtime(&self, layout: &RuntimeLayout) -> Result<PathBuf, ProvisionError> {
        let source = self.runtime_executable();
        if !source.is_file() {
            return Err(ProvisionError::MissingAsset(source));
        }

        layout.ensure_dirs()?;
        let dest = layout.executable();

        let source_len = fs::metadata(&source)?.len();
        let up_to_date = fs::metadata(&dest)
            .map(|m| m.len() == source_len)
            .unwrap_or(false);

        if up_to_date {
            tracing::debug!("Runtime executable already installed at {:?}", dest);
        } else {
            fs::copy(&source, &dest)?;
            tracing::info!("Installed runtime executable {:?} -> {:?}", source, dest);
        }

        make_executable(&dest)?;
        clear_quarantine(&dest);
        Ok(dest)
    }

    /// Copy a bundled model's `blobs/` and `manifests/` trees into `models_dir`,
    /// skipping files that already exist.
    pub fn install_model(&self, model: &str, models_dir: &Path) -> Result<InstallReport, ProvisionError> {
        let source = self
            .model_dir(model)
            .ok_or_else(|| ProvisionError::MissingAsset(self.bundle_dir.join("models").join(model)))?;

        let mut report = InstallReport::default();
        for sub in ["blobs", "manifests"] {
            let from = source.join(sub);
            if !from.is_dir() {
                return Err(ProvisionError::MissingAsset(from));
            }
            let sub_report = copy_tree_skip_existing(&from, &models_dir.join(sub))?;
            report.copied += sub_report.copied;
            report.skipped += sub_report.skipped;
        }

        tracing::info!(
            "Installed bundled model '{}' ({} copied, {} already present)",
            model,
            report.copied,
            report.skipped
        );
        Ok(report)
    }
}

/// Recursively copy `from` into `to`, leaving existing files untouched
fn copy_tree_skip_existing(from: &Path, to: &Path) -> Result<InstallReport, ProvisionError> {
    let mut report = InstallReport::default();
    fs::create_dir_all(to)?;

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if target.exists() {
                report.skipped += 1;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            report.copied += 1;
        }
    }

    Ok(report)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 != 0o111 {
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

/// Remove the macOS download quarantine flag so the copied binary can launch
#[cfg(target_os = "macos")]
pub fn clear_quarantine(path: &Path) {
    match std::process::Command::new("xattr")
        .args(["-d", "com.apple.quarantine"])
        .arg(path)
        .output()
    {
        Ok(out) if out.status.success() => {
            tracing::debug!("Cleared quarantine flag on {:?}", path);
        }
        // Attribute absent is the common case
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to run xattr on {:?}: {}", path, e),
    }
}

#[cfg(not(target_os = "macos"))]
pub fn clear_quarantine(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_layout_paths() {
        let layout = RuntimeLayout::new("/data/runtime");
        assert!(layout.executable().starts_with("/data/runtime/bin"));
        assert_eq!(layout.models_dir(), PathBuf::from("/data/runtime/models"));
    }

    #[test]
    fn test_install_runtime_missing_asset() {
        let bundle = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let assets = BundledAssets::new(bundle.path());
        let layout = RuntimeLayout::new(target.path());

        let err = assets.install_runtime(&layout).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingAsset(_)));
    }

    #[test]
    fn test_install_runtime_is_idempotent() {
        let bundle = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let assets = BundledAssets::new(bundle.path());
        write(&assets.runtime_executable(), b"#!/bin/sh\n");
        let layout = RuntimeLayout::new(target.path());

        let first = assets.install_runtime(&layout).unwrap();
        let second = assets.install_runtime(&layout).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"#!/bin/sh\n");
        assert!(layout.tmp_dir().is_dir());
    }

    #[test]
    fn test_model_dir_resolution() {
        let bundle = TempDir::new().unwrap();
        fs::create_dir_all(bundle.path().join("models/nomic-embed-text")).unwrap();
        let assets = BundledAssets::new(bundle.path());

        assert!(assets.model_dir("nomic-embed-text").is_some());
        assert!(assets.model_dir("nomic-embed-text:latest").is_some());
        assert!(assets.model_dir("demo-model").is_none());
        assert_eq!(assets.bundled_models(), vec!["nomic-embed-text".to_string()]);
    }

    #[test]
    fn test_install_model_skips_existing() {
        let bundle = TempDir::new().unwrap();
        let models = TempDir::new().unwrap();
        let root = bundle.path().join("models/nomic-embed-text");
        write(&root.join("blobs/sha256-abc"), b"weights");
        write(
            &root.join("manifests/registry.ollama.ai/library/nomic-embed-text/latest"),
            b"{}",
        );
        let assets = BundledAssets::new(bundle.path());

        let first = assets.install_model("nomic-embed-text", models.path()).unwrap();
        assert_eq!(first, InstallReport { copied: 2, skipped: 0 });
        assert!(models.path().join("blobs/sha256-abc").is_file());

        let second = assets.install_model("nomic-embed-text", models.path()).unwrap();
        assert_eq!(second, InstallReport { copied: 0, skipped: 2 });
    }

    #[test]
    fn test_install_model_requires_both_trees() {
        let bundle = TempDir::new().unwrap();
        let models = TempDir::new().unwrap();
        write(&bundle.path().join("models/partial/blobs/sha256-1"), b"x");
        let assets = BundledAssets::new(bundle.path());

        let err = assets.install_model("partial", models.path()).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingAsset(_)));
    }
}
