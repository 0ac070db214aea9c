use super::Restic;
use super::benign::{Phase, Tally};
use super::command::Sink;
use super::flags::Flags;
use crate::error::{ResticError, Result};

impl Restic {
    /// Initialises the repository. Safe to call on every run, an existing repository is kept.
    pub async fn init(&self) -> Result<()> {
        tracing::info!(repository = %self.repository, "initialising repository");
        let tally = Tally::new();
        let options = self
            .options("init", "init", Flags::new(), Vec::new())
            .stdout(Sink::Log)
            .stderr(tally.sink(Phase::Init, "init"));

        match self.command(options).run().await {
            Ok(_) => Ok(()),
            Err(ResticError::Execution { .. }) if tally.benign() > 0 => {
                tracing::info!("repository is already initialised");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
