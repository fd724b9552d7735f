//! Crate-wide error taxonomy.
//!
//! User-input validation failures (`NoKey`, `KeyTypeNotSupported`,
//! `KeyTooSmall`) surface to the key-upload path; `PermissionDenied` doubles
//! as the SSH auth rejection and the gate's "unknown fingerprint" answer;
//! the remaining variants are startup preconditions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No parseable public key was found in the input.
    #[error("no key found")]
    NoKey,

    /// The key parsed, but its type is not in the supported-type table.
    #[error("this key type is not supported")]
    KeyTypeNotSupported,

    /// The key parsed, but is below the minimum size for its type.
    #[error("the size of this key is too small")]
    KeyTooSmall,

    /// Authentication or authorization failure.
    #[error("permission denied")]
    PermissionDenied,

    /// `Server::start` was called before the gate callbacks were installed.
    #[error("all server callbacks must be installed before start")]
    MissingCallbacks,

    /// Delegated host-key generation (`ssh-keygen`) failed.
    #[error("failed to generate host key")]
    HostkeyGeneration,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Key(#[from] russh_keys::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),
}
