//! SSH host key loading and first-start generation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tracing::info;

/// Load the host key at `path`, generating and persisting a new Ed25519 key
/// when the file does not exist yet.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), algorithm = key.name(), "loaded SSH host key");
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create host key directory: {}", parent.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create SSH host key file: {}", path.display()))?;
    file.write_all(&pem)
        .with_context(|| format!("failed to write SSH host key: {}", path.display()))?;

    info!(path = %path.display(), "generated new Ed25519 SSH host key");
    Ok(key)
}
