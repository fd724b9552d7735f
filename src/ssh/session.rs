//! Per-connection SSH session handling: public-key authentication, channel
//! acceptance, and exec dispatch into the access gate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::channel::{ChannelOutput, ChannelStdin, SessionChannel};
use crate::gate::{ConnectionInfo, Gate};
use crate::keys::codec::{colon_fingerprint, fingerprint};

/// Stdin chunks buffered per channel before the session loop backpressures
/// the client.
const STDIN_PIPE_DEPTH: usize = 32;

/// State shared by every session of one server instance.
pub(crate) struct SessionContext {
    pub gate: Arc<dyn Gate>,
    /// Wire bytes of the host public key; offering this exact key selects
    /// the proxy channel.  `None` outside proxy mode.
    pub proxy_pubkey_blob: Option<Vec<u8>>,
}

/// How this connection authenticated.
#[derive(Debug, Clone)]
enum AuthContext {
    /// The serve-shim authenticated with the host key; the real fingerprint
    /// arrives on the exec command line and is verified there.
    Proxy,
    /// A Git client authenticated directly; the fingerprint is verified.
    Fingerprint(String),
}

/// Stdin pipe of one session channel.  The sender stays with the handler so
/// incoming data keeps flowing; the receiver is taken by the exec dispatch.
struct ChannelState {
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    stdin_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

/// Handler for a single inbound connection.
pub(crate) struct SessionHandler {
    ctx: Arc<SessionContext>,
    peer_addr: Option<SocketAddr>,
    auth: Option<AuthContext>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SessionHandler {
    pub(crate) fn new(ctx: Arc<SessionContext>, peer_addr: Option<SocketAddr>) -> Self {
        debug!(peer = ?peer_addr, "new SSH connection");
        Self {
            ctx,
            peer_addr,
            auth: None,
            channels: HashMap::new(),
        }
    }
}

#[async_trait::async_trait]
impl Handler for SessionHandler {
    type Error = anyhow::Error;

    /// Authenticate an offered public key: the host key itself selects the
    /// proxy channel (proxy mode only); anything else is resolved through
    /// the gate by fingerprint.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let blob = key.public_key_bytes();

        if let Some(proxy_blob) = &self.ctx.proxy_pubkey_blob {
            if *proxy_blob == blob {
                debug!(peer = ?self.peer_addr, %user, "proxy key accepted");
                self.auth = Some(AuthContext::Proxy);
                return Ok(Auth::Accept);
            }
        }

        let fp = fingerprint(&blob);
        match self.ctx.gate.key_by_fingerprint(&fp).await {
            Ok(_) => {
                info!(
                    peer = ?self.peer_addr,
                    %user,
                    fingerprint = %colon_fingerprint(&fp),
                    "public-key auth accepted"
                );
                self.auth = Some(AuthContext::Fingerprint(fp));
                Ok(Auth::Accept)
            }
            Err(e) => {
                info!(
                    peer = ?self.peer_addr,
                    %user,
                    fingerprint = %colon_fingerprint(&fp),
                    error = %e,
                    "public-key auth rejected"
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = ?self.peer_addr, channel = ?channel.id(), "session channel opened");
        let (tx, rx) = mpsc::channel(STDIN_PIPE_DEPTH);
        self.channels.insert(
            channel.id(),
            ChannelState {
                stdin_tx: Some(tx),
                stdin_rx: Some(rx),
            },
        );
        Ok(true)
    }

    /// Honor exactly one exec request per channel; the command runs in its
    /// own task so the connection keeps pumping channel data meanwhile.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let stdin_rx = self
            .channels
            .get_mut(&channel_id)
            .and_then(|state| state.stdin_rx.take());
        let Some(stdin_rx) = stdin_rx else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);

        let command = String::from_utf8_lossy(data).into_owned();
        info!(peer = ?self.peer_addr, command = %command, "exec request");

        let ctx = Arc::clone(&self.ctx);
        let auth = self.auth.clone();
        let peer_addr = self.peer_addr;
        let handle = session.handle();
        tokio::spawn(async move {
            dispatch_exec(ctx, auth, stdin_rx, handle, channel_id, command, peer_addr).await;
        });
        Ok(())
    }

    /// Forward client data into the channel's stdin pipe.  The send blocks
    /// when the session is slow to consume, which backpressures the client
    /// through the channel window.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel_id) {
            if let Some(tx) = &state.stdin_tx {
                let _ = tx.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Dropping the sender delivers EOF to the session's stdin.
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel_id);
        Ok(())
    }

    // Requests other than exec get a failure reply, but the channel stays
    // open for the exec that is still expected.

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        _name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }
}

/// Resolve the session fingerprint, run the gate's handler, and signal the
/// exit status once the streams have drained.
async fn dispatch_exec(
    ctx: Arc<SessionContext>,
    auth: Option<AuthContext>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    handle: Handle,
    channel_id: ChannelId,
    command: String,
    peer_addr: Option<SocketAddr>,
) {
    let output = ChannelOutput::new(handle, channel_id);

    let (fingerprint, command, proxied) = match auth {
        Some(AuthContext::Proxy) => {
            // Proxy exec grammar: `<fingerprint> <subverb> <command>`.
            let parts: Vec<&str> = command.splitn(3, ' ').collect();
            if parts.len() != 3 {
                let _ = output.stderr(b"Proxy error!\n").await;
                let _ = output.eof().await;
                let _ = output.close().await;
                return;
            }
            let claimed = parts[0];
            let rest = parts[2].to_string();
            match ctx.gate.key_by_fingerprint(claimed).await {
                Ok(_) => (Some(claimed.to_string()), rest, true),
                Err(e) => {
                    debug!(fingerprint = %claimed, error = %e, "proxied fingerprint rejected");
                    (None, rest, true)
                }
            }
        }
        Some(AuthContext::Fingerprint(fp)) => (Some(fp), command, false),
        None => (None, command, false),
    };

    let Some(fingerprint) = fingerprint else {
        let _ = output.stderr(b"Permission denied\n").await;
        let _ = output.eof().await;
        let _ = output.close().await;
        return;
    };

    let info = ConnectionInfo {
        addr: peer_addr,
        proxied,
    };
    let session_channel =
        SessionChannel::from_parts(ChannelStdin::new(stdin_rx), output.clone());
    let result = ctx
        .gate
        .handle_session(&fingerprint, &command, session_channel, info)
        .await;

    // The handler has drained its streams by now; the status goes out
    // before the close, and a handler error is echoed to the client.
    let _ = output.exit_status(result.exit_status).await;
    if let Some(error) = result.error {
        debug!(error = %error, exit_status = result.exit_status, "session ended with error");
        let _ = output.data(error.to_string().as_bytes()).await;
    }
    let _ = output.eof().await;
    let _ = output.close().await;
}
