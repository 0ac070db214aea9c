use super::Restic;
use super::command::Sink;
use super::flags::{Flags, tag_args};
use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::stats::Gauge;

/// Arguments of `restic forget`. Rules that aren't configured are left out so restic's own
/// defaults apply.
pub fn forget_args(policy: &RetentionPolicy, hostname: &str, tags: &[String]) -> Vec<String> {
    let mut args = vec!["--prune".to_string()];
    for (arg, value) in policy.counters() {
        if let Some(n) = value.filter(|n| *n > 0) {
            args.push(arg.to_string());
            args.push(n.to_string());
        }
    }
    for (arg, value) in policy.durations() {
        if let Some(d) = value.filter(|d| !d.is_empty()) {
            args.push(arg.to_string());
            args.push(d.to_string());
        }
    }
    if policy.keep_tags {
        args.push("--keep-tag".to_string());
    }
    if !hostname.is_empty() {
        args.push(format!("--host={hostname}"));
    }
    args.extend(tag_args(tags));
    args
}

impl Restic {
    /// Enforces the retention policy onto the repository.
    pub async fn prune(&mut self, policy: &RetentionPolicy, tags: &[String]) -> Result<()> {
        tracing::info!("pruning repository");
        let args = forget_args(policy, &self.hostname, tags);
        let options = self
            .options("prune", "forget", Flags::new(), args)
            .stdout(Sink::Log)
            .stderr(Sink::Log);
        self.command(options).run().await?;

        self.send_snapshot_list().await;
        let gauges = vec![Gauge::available_snapshots(self.snapshots.len())];
        if let Err(e) = self.stats.send_prometheus(&gauges).await {
            tracing::error!("prometheus send failed: {e}");
        }
        Ok(())
    }
}
