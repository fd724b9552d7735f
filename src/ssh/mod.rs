//! SSH protocol surface of the gateway.
//!
//! Accepts SSH connections from Git clients, authenticates them by
//! public-key fingerprint (or by the host key itself on the proxy channel),
//! and brokers one exec per session channel into the access gate.  Also
//! hosts the serve-shim client used when an external OpenSSH daemon fronts
//! the gateway.

pub mod channel;
pub mod client;
pub mod keygen;
pub mod server;
pub(crate) mod session;

pub use channel::{ChannelOutput, ChannelStdin, SessionChannel};
pub use client::ServeShim;
pub use server::{AuthorizedKeysProxy, Server, ServerConfig};
