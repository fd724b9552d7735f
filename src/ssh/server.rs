//! SSH server bootstrap: configuration, lifecycle, and the
//! [`russh::server::Server`] implementation that hands each incoming
//! connection to a [`SessionHandler`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::server::Server as _;
use russh::MethodSet;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::keygen;
use super::session::{SessionContext, SessionHandler};
use crate::authkeys::AuthorizedKeysFile;
use crate::error::Error;
use crate::gate::Gate;
use crate::keys::codec::KEY_ALGO_ED25519;
use crate::keys::SupportedKeyTypes;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Server configuration; immutable once [`Server::start`] has returned.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the SSH listener (e.g. `0.0.0.0:2222`).
    pub listen_addr: String,
    /// Path to the host private key.  Generated via `ssh-keygen` when
    /// absent.
    pub host_key_file: PathBuf,
    /// Path to the host public key; only read in proxy mode, where the
    /// serve-shim authenticates with the host key pair.
    pub host_pub_key_file: PathBuf,
    /// Authorized-keys proxy submode.
    #[serde(default)]
    pub authorized_keys_proxy: AuthorizedKeysProxy,
}

/// Settings for the deployment where an external OpenSSH daemon fronts this
/// server and hands connections over through the serve-shim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizedKeysProxy {
    #[serde(default)]
    pub enabled: bool,
    /// The authorized_keys file of the external daemon's proxy account.
    #[serde(default)]
    pub file: PathBuf,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

struct Running {
    local_addr: SocketAddr,
    serve: JoinHandle<()>,
}

/// The in-process SSH server.
///
/// Construct with [`Server::new`], install the gate callbacks, then
/// [`start`](Server::start).  Startup errors (missing callbacks, unreadable
/// keys, port collisions) surface synchronously; everything after the accept
/// loop is spawned is contained per connection.
pub struct Server {
    config: ServerConfig,
    gate: Option<Arc<dyn Gate>>,
    authkeys: Option<Arc<AuthorizedKeysFile>>,
    key_types: SupportedKeyTypes,
    running: Option<Running>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let authkeys = config
            .authorized_keys_proxy
            .enabled
            .then(|| Arc::new(AuthorizedKeysFile::new(config.authorized_keys_proxy.file.clone())));
        Self {
            config,
            gate: None,
            authkeys,
            key_types: SupportedKeyTypes::builtin(),
            running: None,
        }
    }

    /// Install the forge-side callbacks.  Required before [`start`](Server::start).
    pub fn install_callbacks(&mut self, gate: Arc<dyn Gate>) {
        self.gate = Some(gate);
    }

    fn proxy_enabled(&self) -> bool {
        self.config.authorized_keys_proxy.enabled
    }

    /// Key types accepted from clients, with minimum sizes.  Fixed after
    /// [`start`](Server::start).
    pub fn key_types(&self) -> &SupportedKeyTypes {
        &self.key_types
    }

    /// Validate a user-pasted public key against the supported-type table.
    /// Returns the canonical body and fingerprint.
    pub fn parse_user_key(&self, content: &str) -> Result<(String, String), Error> {
        self.key_types.parse_user_input(content)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Start the server: load (or generate) the host key, resync the
    /// authorized_keys file and probe key-type support in proxy mode, bind
    /// the listener, and spawn the accept loop.
    pub async fn start(&mut self) -> Result<(), Error> {
        let gate = self.gate.clone().ok_or(Error::MissingCallbacks)?;

        if !self.config.host_key_file.exists() {
            keygen::generate_host_key(&self.config.host_key_file, &self.config.host_pub_key_file)
                .await?;
        }
        let host_key = russh_keys::load_secret_key(&self.config.host_key_file, None)?;

        // In proxy mode the serve-shim authenticates with the host key pair,
        // so the public half must be comparable against offered keys.
        let proxy_pubkey_blob = if self.proxy_enabled() {
            use russh_keys::PublicKeyBase64;
            let pubkey = russh_keys::load_public_key(&self.config.host_pub_key_file)?;
            Some(pubkey.public_key_bytes())
        } else {
            None
        };

        self.resync().await?;

        // `ed25519` is the type's ssh-keygen spelling.
        if self.proxy_enabled() && keygen::keygen_supports_type("ed25519").await {
            self.key_types.insert(KEY_ALGO_ED25519, 256);
        }

        let russh_config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            inactivity_timeout: Some(Duration::from_secs(600)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        });

        let listener = TcpListener::bind(self.config.listen_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        let mut acceptor = Acceptor {
            ctx: Arc::new(SessionContext {
                gate,
                proxy_pubkey_blob,
            }),
        };
        let serve = tokio::spawn(async move {
            if let Err(e) = acceptor.run_on_socket(russh_config, &listener).await {
                error!(error = %e, "SSH accept loop exited");
            }
        });

        info!(%local_addr, proxy = self.proxy_enabled(), "SSH server listening");
        self.running = Some(Running { local_addr, serve });
        Ok(())
    }

    /// Stop the server: close the listener and, in proxy mode, remove the
    /// managed authorized_keys lines.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.serve.abort();
            let _ = running.serve.await;
            info!("SSH server stopped");
        }
        if let Some(authkeys) = &self.authkeys {
            if let Err(e) = authkeys.rewrite(&[], true).await {
                warn!(error = %e, "failed to tear down authorized_keys");
            }
        }
    }

    // -- authorized_keys maintenance ---------------------------------------

    /// Notify the server that `key` is now acceptable.  Prepends one managed
    /// line; no-op unless proxy mode is enabled.
    pub async fn add_key(&self, key: &str) -> Result<(), Error> {
        let Some(authkeys) = &self.authkeys else {
            return Ok(());
        };
        authkeys.rewrite(&[key.to_string()], false).await?;
        Ok(())
    }

    /// Notify the server that `key` is no longer valid.  Removing a single
    /// line is not worth the bookkeeping; the file is rebuilt from the
    /// current key set instead.
    pub async fn remove_key(&self, _key: &str) -> Result<(), Error> {
        self.resync().await
    }

    /// Rebuild the authorized_keys file from the gate's current key set,
    /// dropping stale managed lines.  No-op unless proxy mode is enabled.
    pub async fn resync(&self) -> Result<(), Error> {
        let Some(authkeys) = &self.authkeys else {
            return Ok(());
        };
        let gate = self.gate.as_ref().ok_or(Error::MissingCallbacks)?;
        let keys = gate.all_keys().await;
        authkeys.rewrite(&keys, true).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// russh acceptor
// ---------------------------------------------------------------------------

struct Acceptor {
    ctx: Arc<SessionContext>,
}

impl russh::server::Server for Acceptor {
    type Handler = SessionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        SessionHandler::new(Arc::clone(&self.ctx), peer_addr)
    }
}
