use super::Restic;
use super::command::Sink;
use super::flags::Flags;
use crate::error::Result;
use crate::stats::Gauge;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

impl Restic {
    /// Checks the repository for errors and pushes how many were reported.
    pub async fn check(&self) -> Result<()> {
        tracing::info!("checking repository");
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let stderr = Sink::lines(move |line: &str| {
            if !line.trim().is_empty() {
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(command = "check", stream = "stderr", "{line}");
            }
        });
        let options = self
            .options("check", "check", Flags::new(), Vec::new())
            .stdout(Sink::Log)
            .stderr(stderr);

        let result = self.command(options).run().await;

        let errors = errors.load(Ordering::Relaxed);
        let gauges = vec![Gauge::last_errors(errors, &self.bucket, &self.hostname)];
        if let Err(e) = self.stats.send_prometheus(&gauges).await {
            tracing::error!("prometheus send failed: {e}");
        }

        result.map(|_| ())
    }
}
