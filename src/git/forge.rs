//! The forge-side interface the Git executor runs against.
//!
//! Users, repositories, access checks, and post-push update tasks all live
//! in the forge database; the executor only consumes them through this
//! trait.

use anyhow::Result;
use async_trait::async_trait;

use crate::keys::PublicKeyRecord;

/// Access level a Git verb requires on the target repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Readable,
    Writable,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct Repository {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub is_private: bool,
}

/// One ref update recorded by the post-receive hook, keyed by the batch id
/// the executor exported to the hook environment.
#[derive(Debug, Clone)]
pub struct UpdateTask {
    pub ref_name: String,
    pub old_commit_id: String,
    pub new_commit_id: String,
}

#[async_trait]
pub trait Forge: Send + Sync {
    /// Resolve a fingerprint to its stored public-key record.
    async fn key_by_fingerprint(&self, fingerprint: &str) -> Result<PublicKeyRecord>;

    /// Canonical bodies of every key that may connect, preferably
    /// most-recently-used first.
    async fn all_keys(&self) -> Result<Vec<String>>;

    async fn user_by_id(&self, id: i64) -> Result<User>;

    async fn user_by_name(&self, name: &str) -> Result<User>;

    async fn repository(&self, owner_id: i64, name: &str) -> Result<Repository>;

    /// Whether `user_name` holds `access` on `repo_path` (`owner/name`).
    async fn has_access(&self, user_name: &str, repo_path: &str, access: AccessLevel)
        -> Result<bool>;

    /// Update tasks queued under `batch` by the push hooks.
    async fn update_tasks(&self, batch: &str) -> Result<Vec<UpdateTask>>;

    /// Apply one recorded ref update.
    async fn apply_update(
        &self,
        task: &UpdateTask,
        pusher: &User,
        repo_owner_name: &str,
        repo_name: &str,
    ) -> Result<()>;

    async fn clear_update_tasks(&self, batch: &str) -> Result<()>;

    /// Stamp the key's last-use time after a successful session.
    async fn touch_key(&self, key_id: i64) -> Result<()>;
}
