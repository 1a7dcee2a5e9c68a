//! Bare Git repository helpers for the on-disk store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates any missing parent directories and runs `git init --bare`.
#[instrument(fields(path = %path.display()))]
pub async fn init_bare_repo(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Check whether `path` looks like a bare Git repository: a directory
/// containing a `HEAD` file.
pub async fn validate_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return false;
    }

    tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Walk `root` and return the names (relative, without `.git`) of every bare
/// repository below it.  Repositories are not descended into.
pub fn list_bare_repos(root: &Path) -> Result<Vec<String>> {
    let mut repos = Vec::new();
    if !root.exists() {
        return Ok(repos);
    }

    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(err) => {
                warn!(path = %dir.display(), error = %err, "failed to read directory while listing repos");
                continue;
            }
        };

        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let is_repo = path.extension().is_some_and(|ext| ext == "git")
                && path.join("HEAD").is_file();
            if !is_repo {
                stack.push(path);
                continue;
            }

            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("repo {} is outside {}", path.display(), root.display()))?;
            let name = relative.to_string_lossy();
            let name = name.strip_suffix(".git").unwrap_or(&name).to_string();
            repos.push(name);
        }
    }

    repos.sort();
    Ok(repos)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
