use super::Restic;
use super::benign::{Phase, Tally};
use super::command::Sink;
use super::flags::Flags;
use crate::error::{ResticError, Result};

impl Restic {
    /// Removes stale locks, or every lock when `all` is set.
    pub async fn unlock(&self, all: bool) -> Result<()> {
        tracing::info!(all, "unlocking repository");
        let args = if all {
            vec!["--remove-all".to_string()]
        } else {
            Vec::new()
        };
        let tally = Tally::new();
        let options = self
            .options("unlock", "unlock", Flags::new(), args)
            .stdout(Sink::Log)
            .stderr(tally.sink(Phase::Unlock, "unlock"));

        match self.command(options).run().await {
            Ok(_) => Ok(()),
            Err(ResticError::Execution { .. }) if tally.only_benign() => {
                tracing::info!("lock was removed by another process");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One entry per lock currently held on the repository.
    pub async fn list_locks(&self) -> Result<Vec<String>> {
        let local = Flags::new().with_switch("--json").with_switch("--no-lock");
        let options = self
            .options("list locks", "list", local, vec!["locks".to_string()])
            .stdout(Sink::Capture)
            .stderr(Sink::Log);
        let output = self.command(options).run().await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Blocks until the repository holds no locks anymore.
    pub async fn wait_for_locks(&self) -> Result<()> {
        tracing::info!("remove old locks");
        self.unlock(false).await?;

        tracing::info!("checking for any locks");
        loop {
            let locks = self.list_locks().await?;
            if locks.is_empty() {
                break;
            }
            tracing::info!(
                count = locks.len(),
                retry_in = ?self.lock_retry,
                "locks found, retrying"
            );
            self.unlock(false).await?;
            tokio::select! {
                _ = tokio::time::sleep(self.lock_retry) => {}
                _ = self.cancel.cancelled() => {
                    return Err(ResticError::Cancelled { command: "wait for locks".into() });
                }
            }
        }

        tracing::info!("no more locks found");
        Ok(())
    }
}
