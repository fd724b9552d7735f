//! forgegate: a key-authenticated SSH gateway for Git hosting.
//!
//! The gateway authenticates inbound Git clients by their SSH public-key
//! fingerprint, authorizes the requested Git verb against the hosting
//! forge's access policy, and brokers the protocol's byte streams between
//! the client and a locally spawned Git process.  A symmetric serve-shim
//! client lets an external OpenSSH daemon front the gateway: the daemon
//! authenticates the user against a managed authorized_keys file and hands
//! the connection over with the verified fingerprint on the command line.
//!
//! The forge plugs in through [`gate::Gate`]; [`git::GitExecutor`] is the
//! stock session handler a forge installs to serve the three Git
//! smart-protocol verbs.

pub mod authkeys;
pub mod error;
pub mod gate;
pub mod git;
pub mod keys;
pub mod ssh;

pub use error::Error;
pub use gate::{ConnectionInfo, Gate, SessionResult};
pub use ssh::{Server, ServerConfig, ServeShim};
