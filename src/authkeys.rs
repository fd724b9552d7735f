//! Rewriter for the authorized_keys file consumed by an external OpenSSH
//! daemon.
//!
//! The file is shared with co-tenants: only lines this system emitted
//! (recognized by containing both the `gogs` and `serve` markers) are ever
//! replaced; every other line is preserved verbatim and in its original
//! order.  A rewrite builds a sibling temporary file and commits it with an
//! atomic rename, so readers never observe a partial file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::keys::parse_blob;

/// OpenSSH options emitted on every managed line.
const MANAGED_LINE_OPTIONS: &str =
    "no-port-forwarding,no-X11-forwarding,no-agent-forwarding,no-pty";

/// Trailing comment on managed lines.  Carries both recognition markers so
/// that [`is_managed_line`] matches exactly the lines we emit.
const MANAGED_LINE_COMMENT: &str = "gogs-serve-key";

/// Sibling temp file used as the staging area for rewrites.
const TMP_FILE_NAME: &str = "authorized_keys.forgegate.tmp";

/// A line is managed when it contains both marker substrings
/// (case-sensitive).
pub fn is_managed_line(line: &[u8]) -> bool {
    contains(line, b"gogs") && contains(line, b"serve")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Concurrency-safe handle on one authorized_keys file.
///
/// The mutex serializes whole rewrites within this process; the rename
/// provides atomicity against the external OpenSSH reader.
pub struct AuthorizedKeysFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuthorizedKeysFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file: one managed line per parseable entry of `new_keys`
    /// first, then the previous contents, minus the old managed lines when
    /// `filter_old` is set.
    ///
    /// Entries of `new_keys` that fail to parse are silently skipped; the
    /// source is expected to be pre-validated canonical bodies.
    pub async fn rewrite(&self, new_keys: &[String], filter_old: bool) -> io::Result<()> {
        let _guard = self.lock.lock().await;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(TMP_FILE_NAME);

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut tmp = options.open(&tmp_path).await?;

        for key in new_keys {
            if let Some(parsed) = parse_blob(key.as_bytes(), true) {
                let line = format!(
                    "command=\"{}\",{} {} {} {}\n",
                    parsed.fingerprint,
                    MANAGED_LINE_OPTIONS,
                    parsed.key_type,
                    parsed.canonical,
                    MANAGED_LINE_COMMENT,
                );
                tmp.write_all(line.as_bytes()).await?;
            }
        }

        match tokio::fs::read(&self.path).await {
            Ok(existing) => {
                if filter_old {
                    for line in existing.split_inclusive(|&b| b == b'\n') {
                        if !is_managed_line(line) {
                            tmp.write_all(line).await?;
                        }
                    }
                } else {
                    tmp.write_all(&existing).await?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);

        // The rename is the commit point.
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), keys = new_keys.len(), filter_old, "authorized_keys rewritten");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Lines from the sshd(8) AUTHORIZED_KEYS examples; none of them are
    /// ours and all must survive every rewrite byte-for-byte.
    const FOREIGN_LINES: &str = "# Comments allowed at start of line\n\
ssh-rsa AAAAB3Nza...LiPk== gogs@example.net\n\
from=\"*.sales.gogs.net,!pc.sales.example.net\" ssh-rsa AAAAB2...19Q== john@example.net\n\
command=\"dump /home\",no-pty,no-port-forwarding ssh-dss AAAAC3...51R== example.net\n\
permitopen=\"192.0.2.1:80\",permitopen=\"192.0.2.2:25\" ssh-dss AAAAB5...21S==\n\
tunnel=\"0\",command=\"sh /etc/netstart tun0\" ssh-rsa AAAA...== jane@example.net";

    const KEYS: &[&str] = &[
        "AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBKDMeKhrQa+GPPOIksafnmlxcH401iCTN6UEPZayC0gnQM3cIuEX2y58EwyVHITfgbDndM4A/lZDLTQnxekiHmk=",
        "AAAAE2VjZHNhLXNoYTItbmlzdHAzODQAAAAIbmlzdHAzODQAAABhBD66ur1JKLaUZZ1Ug/fbXbMlwd8YOwxLfcvrxAg+L73kJPkiPzXE0zkYycBBKRF0mH1P4OOzjzPXx4KNtKFrmR0Y5kFWPcbALcveNG/u3V1W5lql1c1r3ehL+6OOjQEq0w==",
        "AAAAE2VjZHNhLXNoYTItbmlzdHA1MjEAAAAIbmlzdHA1MjEAAACFBAErzKhOVCufSiP2xlQmIzvRHXD6t4JTl4JS0XPz9TInkcZqRi0Juz64FAzcurkC/8d0qGdvAQXfZ+wOPSYrXfEeNwCwQGlNYImpaTcqg3RQxKQPdZKAux0yq0ptkG8OULfieRATe648kiN5ZWSb3WGneRA3FkbFR/sxTosCD8XLMJQVBg==",
        "AAAAB3NzaC1kc3MAAACBAIj1YvMaQrHDEnDX7f7mBSctXyFuVXPEU04HXDUASi0oLmiQe1iTHf3BXX6pdAa3Mc8bZ30HwQ5kjyxSA8LascD/VAoznv1FolDee4wjGex4cGfvfn56hHG/uf4HQS3AzxnT+hBSDFkWm/AY+f8PQArhlGQfhpzgrzVxbtA2pFbHAAAAFQC+I3TjWrpmZv3zMJ+ZNuyZA68HHQAAAIAs3AWnA73BXh3BdgPRxrWzlOm98Kah7XgTKFUUO27KGWIgNYY1tP/NZRSA1yBwu1l7O3AY3knhyuNrEVbyReA+qxjbUrHQEOVxb3NFIsoSdKm7HrIjSUc3KvAT2dKXCx1dOyircuEnyhmkph+kgcYtaXwcvMysSk812sKcbkDulgAAAIAXa0LcU1LpAOejqrqdkb7COshigYQS8gxrePhPx3skt9k4nMJ3/dTOsL92LpEUIdixoeXvv8fjRrVhEu+eoJ9QSgRwcIE7WEIjmDRLV0VDJE4WCfOR3pmGHi18WC9CKTopowpV3SGtUGuzHZBUs4EbYWwxvZnOviddRR89igEAKg==",
        "AAAAC3NzaC1lZDI1NTE5AAAAIOw6e0L1FN9qMPrF1K6NiAZQlezvGwFsfPFVjUH/sdx0",
        "AAAAB3NzaC1yc2EAAAADAQABAAABAQDTbuP29xhh2XpqNC5BsiOlf0njyiBYU0zm4CyLpVu3PktnCaCk/zztIIIQJNlg7xKsnEyBmhG+vy1IeD7raoBG55OHZsKdEwqEr6O+dmVEy/cghD0/X1AKLF0q/1offo3VgDyfHkINgnheUR8a7csRJLF3H0mdeWFFlIp0hO5E66NXvcH8xAeCbPfRqbe5v6zcHqVUASwvWFHeLIKCVtRJjsbklLOtleTeftFp7ML9CgpxIuYvUUOXd5Zvi7ZYoU/Ey5dYHnqQoRKqk9XcFn03+NiH2O7udtDW7F9ylPwueveIWAZ7RgL0DufJ0H0Iu/4N3d+6dCIBKNwKZGQj8u4B",
    ];

    fn keys() -> Vec<String> {
        KEYS.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn rewrite_preserves_foreign_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(&path, FOREIGN_LINES).await.unwrap();

        let file = AuthorizedKeysFile::new(&path);
        file.rewrite(&keys(), true).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(
            contents.ends_with(FOREIGN_LINES),
            "foreign lines were not preserved:\n{contents}"
        );
        for key in KEYS {
            assert!(contents.contains(key), "missing managed line for {key}");
        }
        assert!(
            !dir.path().join(TMP_FILE_NAME).exists(),
            "temp file left behind"
        );
    }

    #[tokio::test]
    async fn managed_lines_parse_as_openssh_options() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let file = AuthorizedKeysFile::new(&path);
        file.rewrite(&keys(), true).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let first = contents.lines().next().unwrap();
        let (options, rest) = first.split_once(' ').unwrap();
        assert!(options.starts_with("command=\""));
        for flag in [
            "no-port-forwarding",
            "no-X11-forwarding",
            "no-agent-forwarding",
            "no-pty",
        ] {
            assert!(options.contains(flag), "missing {flag} in {options}");
        }
        // <key_type> <body> <comment>
        assert_eq!(rest.split_whitespace().count(), 3);
        assert!(is_managed_line(first.as_bytes()));
    }

    #[tokio::test]
    async fn add_without_filter_keeps_prior_managed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(&path, FOREIGN_LINES).await.unwrap();

        let file = AuthorizedKeysFile::new(&path);
        for key in KEYS {
            file.rewrite(&[key.to_string()], false).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.ends_with(FOREIGN_LINES));
        for key in KEYS {
            assert!(contents.contains(key), "missing managed line for {key}");
        }
    }

    #[tokio::test]
    async fn teardown_removes_only_managed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(&path, FOREIGN_LINES).await.unwrap();

        let file = AuthorizedKeysFile::new(&path);
        file.rewrite(&keys(), true).await.unwrap();
        file.rewrite(&[], true).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, FOREIGN_LINES);
    }

    #[tokio::test]
    async fn unparseable_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let file = AuthorizedKeysFile::new(&path);
        file.rewrite(&["not a key".to_string(), KEYS[5].to_string()], true)
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains(KEYS[5]));
    }

    #[tokio::test]
    async fn rewrite_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let file = AuthorizedKeysFile::new(&path);
        file.rewrite(&[KEYS[0].to_string()], true).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn managed_line_predicate_needs_both_markers() {
        assert!(is_managed_line(b"command=\"abc\" ssh-rsa AAAA gogs-serve-key"));
        assert!(!is_managed_line(b"ssh-rsa AAAAB3Nza...LiPk== gogs@example.net"));
        assert!(!is_managed_line(b"command=\"dump /home\" ssh-dss AAAA serve@example.net"));
    }
}
