//! The access-gate interface between the SSH server and the surrounding
//! forge.
//!
//! The server makes no assumptions about the forge beyond these three
//! callbacks: fingerprint lookup during authentication, key enumeration for
//! authorized_keys resyncs, and session handling once a command has been
//! authorized.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Error;
use crate::ssh::channel::SessionChannel;

/// Facts about the underlying connection, handed to the session handler.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Peer address of the connecting client, when known.
    pub addr: Option<SocketAddr>,
    /// Whether the connection arrived through the OpenSSH proxy channel.
    pub proxied: bool,
}

/// Outcome of a handled session: the exit status to signal on the channel,
/// plus an optional error whose string form is echoed to the client.
#[derive(Debug)]
pub struct SessionResult {
    pub exit_status: u32,
    pub error: Option<anyhow::Error>,
}

impl SessionResult {
    /// A session that ran to completion (successfully or not) with the given
    /// exit status.
    pub fn exit(exit_status: u32) -> Self {
        Self {
            exit_status,
            error: None,
        }
    }

    /// A session aborted by the handler; `error` is reported to the client.
    pub fn failed(exit_status: u32, error: impl Into<anyhow::Error>) -> Self {
        Self {
            exit_status,
            error: Some(error.into()),
        }
    }
}

/// Callbacks the server depends on.  All three must be installed before
/// `Server::start`.
#[async_trait]
pub trait Gate: Send + Sync {
    /// Return the key content registered under `fingerprint`, or
    /// [`Error::PermissionDenied`] when the fingerprint has no access.
    async fn key_by_fingerprint(&self, fingerprint: &str) -> Result<String, Error>;

    /// All key contents connections should be accepted from, preferably
    /// most-recently-used first.
    async fn all_keys(&self) -> Vec<String>;

    /// Execute `command` (e.g. `git-upload-pack 'my/repo.git'`) for the key
    /// with the already-verified `fingerprint`, speaking to the client over
    /// `channel`.  The handler must drain its streams before returning and
    /// must not retain the channel past return.
    async fn handle_session(
        &self,
        fingerprint: &str,
        command: &str,
        channel: SessionChannel,
        info: ConnectionInfo,
    ) -> SessionResult;
}
