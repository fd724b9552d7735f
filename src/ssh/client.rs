//! The serve-shim: a one-shot SSH client acting as the proxy account's
//! shell.
//!
//! The external OpenSSH daemon authenticates the real user, then invokes
//! this client (via `command=` in authorized_keys) to re-originate the
//! connection to the in-process server, carrying the verified fingerprint
//! as the first word of the exec command line.  Local stdio is bridged to
//! the remote channel and the remote exit status becomes the process exit
//! code.

use std::path::PathBuf;
use std::sync::Arc;

use russh::{client, ChannelMsg};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Account name the shim authenticates as on the in-process server.
pub const PROXY_USER: &str = "gogsproxy";

/// Fixed subverb marking a proxied command line.
pub const PROXY_SUBVERB: &str = "info";

const INTERNAL_ERROR_MSG: &[u8] = b"Internal GOGS error\n";

/// Exit codes reserved for client-local infrastructure failures; anything
/// else is the remote Git exit status (or 0/1 for clean/unclassified ends).
pub const EXIT_KEY_UNREADABLE: u32 = 23;
pub const EXIT_KEY_UNPARSEABLE: u32 = 24;
pub const EXIT_DIAL_FAILED: u32 = 25;
pub const EXIT_SESSION_FAILED: u32 = 26;

/// One shim invocation.
pub struct ServeShim {
    /// Private key matching the in-process server's host key.
    pub internal_key_file: PathBuf,
    /// Verified fingerprint of the user OpenSSH authenticated.
    pub fingerprint: String,
    /// Address of the in-process server.
    pub host: String,
    /// The Git command line (from `SSH_ORIGINAL_COMMAND`).
    pub command: String,
}

struct ShimHandler;

#[async_trait::async_trait]
impl client::Handler for ShimHandler {
    type Error = anyhow::Error;

    /// The target is the co-deployed gateway we hold the private key for,
    /// reached over its configured internal address.
    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

impl ServeShim {
    /// Run the command on the in-process server, bridging the given stdio
    /// streams.  Returns the process exit code.
    pub async fn run<I, O, E>(&self, stdin: &mut I, stdout: &mut O, stderr: &mut E) -> u32
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let pem = match tokio::fs::read_to_string(&self.internal_key_file).await {
            Ok(pem) => pem,
            Err(e) => {
                warn!(path = %self.internal_key_file.display(), error = %e, "cannot read internal key");
                let _ = stderr.write_all(INTERNAL_ERROR_MSG).await;
                let _ = stderr.flush().await;
                return EXIT_KEY_UNREADABLE;
            }
        };
        let key_pair = match russh_keys::decode_secret_key(&pem, None) {
            Ok(key_pair) => key_pair,
            Err(e) => {
                warn!(path = %self.internal_key_file.display(), error = %e, "cannot decode internal key");
                let _ = stderr.write_all(INTERNAL_ERROR_MSG).await;
                let _ = stderr.flush().await;
                return EXIT_KEY_UNPARSEABLE;
            }
        };

        let config = Arc::new(client::Config::default());
        let mut session = match client::connect(config, self.host.as_str(), ShimHandler).await {
            Ok(session) => session,
            Err(e) => {
                warn!(host = %self.host, error = %e, "cannot reach gateway");
                return EXIT_DIAL_FAILED;
            }
        };
        match session
            .authenticate_publickey(PROXY_USER, Arc::new(key_pair))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(host = %self.host, "gateway rejected the proxy key");
                return EXIT_DIAL_FAILED;
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "proxy authentication failed");
                return EXIT_DIAL_FAILED;
            }
        }

        let mut channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "cannot open session channel");
                return EXIT_SESSION_FAILED;
            }
        };

        let exec_line = format!("{} {} {}", self.fingerprint, PROXY_SUBVERB, self.command);
        debug!(command = %exec_line, "exec on gateway");
        if channel.exec(true, exec_line.as_bytes()).await.is_err() {
            return EXIT_SESSION_FAILED;
        }

        // Bridge stdio until the remote side closes.  Stdin EOF is
        // forwarded so the remote command sees the end of its input.
        let mut exit_status: Option<u32> = None;
        let mut stdin_open = true;
        let mut buf = vec![0u8; 32768];
        loop {
            tokio::select! {
                read = stdin.read(&mut buf), if stdin_open => match read {
                    Ok(0) => {
                        stdin_open = false;
                        if channel.eof().await.is_err() {
                            return 1;
                        }
                    }
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            return 1;
                        }
                    }
                    Err(_) => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if stdout.write_all(&data).await.is_err() {
                            return 1;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        let _ = stderr.write_all(&data).await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                        exit_status = Some(status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }

        let _ = stdout.flush().await;
        let _ = stderr.flush().await;

        exit_status.unwrap_or(0)
    }
}
