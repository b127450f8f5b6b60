use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

pub async fn calculate_hash(filepath: &Path) -> Result<String> {
    let mut file = File::open(filepath).await?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes `filepath` and compares it with `expected`, ignoring case.
pub async fn verify_hash(filepath: &Path, expected: &str) -> Result<String> {
    let computed = calculate_hash(filepath).await?;
    if !computed.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "hash mismatch for {}: expected {}, got {}",
            filepath.display(),
            expected,
            computed
        );
    }
    Ok(computed)
}
