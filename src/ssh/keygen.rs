//! Delegation to the system `ssh-keygen`: key-type support probing and host
//! key generation.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Error;

/// A hung probe must not delay startup indefinitely.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the system `ssh-keygen` can generate keys of `key_type`.
///
/// Any failure to run the probe (missing binary, timeout, unexpected error)
/// downgrades to "not supported" so the server can still start.
pub async fn keygen_supports_type(key_type: &str) -> bool {
    match probe(key_type).await {
        Ok(supported) => {
            debug!(key_type, supported, "ssh-keygen key-type probe");
            supported
        }
        Err(e) => {
            warn!(key_type, error = %e, "ssh-keygen probe failed; treating key type as unsupported");
            false
        }
    }
}

async fn probe(key_type: &str) -> Result<bool> {
    let dir = tempfile::tempdir().context("failed to create probe temp dir")?;
    let path = dir.path().join("keytest");

    let run = Command::new("ssh-keygen")
        .arg("-t")
        .arg(key_type)
        .arg("-f")
        .arg(&path)
        .arg("-q")
        .arg("-N")
        .arg("")
        .stdin(Stdio::null())
        .output();

    let output = tokio::time::timeout(PROBE_TIMEOUT, run)
        .await
        .context("ssh-keygen probe timed out")?
        .context("failed to spawn ssh-keygen")?;

    if output.status.success() {
        return Ok(true);
    }

    let mut combined = output.stdout;
    combined.extend_from_slice(&output.stderr);
    if combined.starts_with(b"unknown key") {
        Ok(false)
    } else {
        bail!(
            "ssh-keygen failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&combined).trim(),
        );
    }
}

/// Generate an RSA host key pair at the given paths via `ssh-keygen`.
///
/// `ssh-keygen -f <key_file>` writes the public half next to the private
/// one; it is moved when the configured public path differs.
pub async fn generate_host_key(key_file: &Path, pub_key_file: &Path) -> Result<(), Error> {
    let output = Command::new("ssh-keygen")
        .arg("-t")
        .arg("rsa")
        .arg("-f")
        .arg(key_file)
        .arg("-q")
        .arg("-N")
        .arg("")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|_| Error::HostkeyGeneration)?;

    if !output.status.success() {
        warn!(
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "ssh-keygen failed to generate host key"
        );
        return Err(Error::HostkeyGeneration);
    }

    let mut default_pub = key_file.as_os_str().to_owned();
    default_pub.push(".pub");
    let default_pub = Path::new(&default_pub);
    if default_pub != pub_key_file {
        tokio::fs::rename(default_pub, pub_key_file)
            .await
            .map_err(|_| Error::HostkeyGeneration)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rsa_is_supported() {
        assert!(keygen_supports_type("rsa").await);
    }

    #[tokio::test]
    async fn bogus_type_is_not_supported() {
        assert!(!keygen_supports_type("ssh-fail").await);
    }

    #[tokio::test]
    async fn generates_key_pair() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("hostkey");
        let pubkey = dir.path().join("hostkey.pub");
        generate_host_key(&key, &pubkey).await.unwrap();
        assert!(key.exists());
        assert!(pubkey.exists());
    }
}
