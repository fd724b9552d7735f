//! The `handle_session` policy a forge installs: resolve the authenticated
//! key to a user, authorize the requested Git verb against the target
//! repository, and run the Git subcommand wired to the session channel.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::forge::{AccessLevel, Forge};
use crate::error::Error;
use crate::gate::{ConnectionInfo, Gate, SessionResult};
use crate::ssh::channel::{ChannelOutput, SessionChannel};

/// Environment variable carrying the update-task batch id into Git hooks.
pub const UPDATE_BATCH_ENV: &str = "FORGEGATE_UUID";

/// Access level required by each recognized Git verb.
fn required_access(verb: &str) -> Option<AccessLevel> {
    match verb {
        "git-upload-pack" | "git-upload-archive" => Some(AccessLevel::Readable),
        "git-receive-pack" => Some(AccessLevel::Writable),
        _ => None,
    }
}

/// Executes authorized Git commands against repositories under `repo_root`.
pub struct GitExecutor<F> {
    forge: Arc<F>,
    repo_root: PathBuf,
}

impl<F: Forge> GitExecutor<F> {
    pub fn new(forge: Arc<F>, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            forge,
            repo_root: repo_root.into(),
        }
    }

    async fn serve(
        &self,
        fingerprint: &str,
        command: &str,
        channel: SessionChannel,
        _info: ConnectionInfo,
    ) -> SessionResult {
        let key = match self.forge.key_by_fingerprint(fingerprint).await {
            Ok(key) => key,
            Err(e) => return SessionResult::failed(1, e),
        };
        let user = match self.forge.user_by_id(key.owner_id).await {
            Ok(user) => user,
            Err(e) => return SessionResult::failed(1, e),
        };

        let (stdin, output) = channel.split();

        let (verb, args) = command.split_once(' ').unwrap_or((command, ""));
        let Some(access) = required_access(verb) else {
            warn!(%verb, user = %user.name, "command not allowed");
            let _ = output.stderr(b"Command not allowed\n").await;
            return SessionResult::failed(1, anyhow!("Illegal verb"));
        };

        let repo_path = args.trim().trim_matches('\'');
        let Some((owner_name, name)) = repo_path.split_once('/') else {
            return deny_repository(&output, args).await;
        };
        let repo_name = name.strip_suffix(".git").unwrap_or(name);

        let repo_owner = match self.forge.user_by_name(owner_name).await {
            Ok(owner) => owner,
            Err(_) => return deny_repository(&output, args).await,
        };
        let repo = match self.forge.repository(repo_owner.id, repo_name).await {
            Ok(repo) => repo,
            Err(_) => return deny_repository(&output, args).await,
        };
        let slug = format!("{owner_name}/{repo_name}");
        let has = match self.forge.has_access(&user.name, &slug, access).await {
            Ok(has) => has,
            Err(_) => return deny_repository(&output, args).await,
        };
        if !has && repo.is_private {
            return deny_repository(&output, args).await;
        }

        // Batch id handed to the push hooks; writable sessions read their
        // queued ref updates back under it.
        let batch = Uuid::new_v4().to_string();

        let mut cmd = Command::new(verb);
        cmd.arg(repo_path)
            .current_dir(&self.repo_root)
            .env(UPDATE_BATCH_ENV, &batch)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(%verb, repo = %slug, user = %user.name, "spawning git command");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(%verb, error = %e, "failed to spawn git command");
                let _ = output
                    .stderr(format!("internal error: {e}\n").as_bytes())
                    .await;
                return SessionResult::exit(1);
            }
        };

        // Three peer copies share only the channel handle; the output pair
        // drains on child EOF, the stdin pump ends with the client's EOF or
        // the child's exit.
        let mut child_stdin = child.stdin.take().expect("child stdin is piped");
        let stdin_task = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(chunk) = stdin.recv().await {
                if child_stdin.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut child_stdout = child.stdout.take().expect("child stdout is piped");
        let stdout_out = output.clone();
        let stdout_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 32768];
            while let Ok(n) = child_stdout.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                if stdout_out.data(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let mut child_stderr = child.stderr.take().expect("child stderr is piped");
        let stderr_out = output.clone();
        let stderr_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 32768];
            while let Ok(n) = child_stderr.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                if stderr_out.stderr(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });

        let status = child.wait().await;
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        stdin_task.abort();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!(%verb, repo = %slug, %status, "git command failed");
                let _ = output
                    .stderr(format!("internal error: {status}\n").as_bytes())
                    .await;
                return SessionResult::exit(1);
            }
            Err(e) => {
                error!(%verb, repo = %slug, error = %e, "failed to wait for git command");
                let _ = output
                    .stderr(format!("internal error: {e}\n").as_bytes())
                    .await;
                return SessionResult::exit(1);
            }
        }

        if access == AccessLevel::Writable {
            let tasks = match self.forge.update_tasks(&batch).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    error!(%batch, error = %e, "failed to read update tasks");
                    return SessionResult::exit(1);
                }
            };
            for task in &tasks {
                if let Err(e) = self
                    .forge
                    .apply_update(task, &user, owner_name, repo_name)
                    .await
                {
                    error!(ref_name = %task.ref_name, error = %e, "failed to apply ref update");
                    return SessionResult::exit(1);
                }
            }
            if let Err(e) = self.forge.clear_update_tasks(&batch).await {
                error!(%batch, error = %e, "failed to clear update tasks");
                return SessionResult::exit(1);
            }
        }

        if let Err(e) = self.forge.touch_key(key.id).await {
            error!(key_id = key.id, error = %e, "failed to stamp key activity");
            return SessionResult::exit(1);
        }

        SessionResult::exit(0)
    }
}

async fn deny_repository(output: &ChannelOutput, args: &str) -> SessionResult {
    warn!(repo = %args, "unavailable repository");
    let _ = output.stderr(b"unavailable repository\n").await;
    SessionResult::failed(1, anyhow!("Illegal args"))
}

#[async_trait]
impl<F: Forge + 'static> Gate for GitExecutor<F> {
    async fn key_by_fingerprint(&self, fingerprint: &str) -> Result<String, Error> {
        self.forge
            .key_by_fingerprint(fingerprint)
            .await
            .map(|key| key.content)
            .map_err(|_| Error::PermissionDenied)
    }

    async fn all_keys(&self) -> Vec<String> {
        self.forge.all_keys().await.unwrap_or_default()
    }

    async fn handle_session(
        &self,
        fingerprint: &str,
        command: &str,
        channel: SessionChannel,
        info: ConnectionInfo,
    ) -> SessionResult {
        self.serve(fingerprint, command, channel, info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_access_table() {
        assert_eq!(required_access("git-upload-pack"), Some(AccessLevel::Readable));
        assert_eq!(
            required_access("git-upload-archive"),
            Some(AccessLevel::Readable)
        );
        assert_eq!(required_access("git-receive-pack"), Some(AccessLevel::Writable));
        assert_eq!(required_access("git-evil"), None);
        assert_eq!(required_access(""), None);
    }
}
