//! Stderr lines restic prints that do not indicate a failure of the job at hand.

use super::command::Sink;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Restore,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The repository was initialised before, `init` failing is expected.
    RepositoryExists,
    /// Ownership can't be restored on filesystems that don't support it.
    OwnershipIgnored,
    /// Restic's closing error tally, the individual errors were already judged.
    ErrorTally,
    /// Another process removed the lock first.
    LockRace,
}

#[derive(Debug)]
pub struct Benign {
    pub phase: Phase,
    pub pattern: &'static str,
    pub disposition: Disposition,
}

pub static BENIGN: &[Benign] = &[
    Benign {
        phase: Phase::Init,
        pattern: "already initialized",
        disposition: Disposition::RepositoryExists,
    },
    Benign {
        phase: Phase::Init,
        pattern: "already exists",
        disposition: Disposition::RepositoryExists,
    },
    Benign {
        phase: Phase::Restore,
        pattern: "chown",
        disposition: Disposition::OwnershipIgnored,
    },
    Benign {
        phase: Phase::Restore,
        pattern: "Fatal: There were",
        disposition: Disposition::ErrorTally,
    },
    Benign {
        phase: Phase::Unlock,
        pattern: "no such file or directory",
        disposition: Disposition::LockRace,
    },
    Benign {
        phase: Phase::Unlock,
        pattern: "does not exist",
        disposition: Disposition::LockRace,
    },
];

/// Returns how a stderr line of the given phase should be treated, `None` if it is a real error.
pub fn classify(phase: Phase, line: &str) -> Option<Disposition> {
    BENIGN
        .iter()
        .find(|b| b.phase == phase && line.contains(b.pattern))
        .map(|b| b.disposition)
}

/// Counts the stderr lines of one invocation by whether they are benign.
#[derive(Debug, Default)]
pub struct Tally {
    benign: AtomicUsize,
    unignored: AtomicUsize,
}

impl Tally {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A stderr sink feeding this tally. Every line is logged.
    pub fn sink(self: &Arc<Self>, phase: Phase, command: &'static str) -> Sink {
        let tally = Arc::clone(self);
        Sink::lines(move |line: &str| tally.record(phase, command, line))
    }

    pub fn record(&self, phase: Phase, command: &str, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match classify(phase, line) {
            Some(disposition) => {
                self.benign.fetch_add(1, Ordering::Relaxed);
                tracing::info!(command, stream = "stderr", ?disposition, "{line}");
            }
            None => {
                self.unignored.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(command, stream = "stderr", "{line}");
            }
        }
    }

    pub fn benign(&self) -> usize {
        self.benign.load(Ordering::Relaxed)
    }

    pub fn unignored(&self) -> usize {
        self.unignored.load(Ordering::Relaxed)
    }

    /// Whether a failed invocation only reported expected conditions.
    pub fn only_benign(&self) -> bool {
        self.benign() > 0 && self.unignored() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_exists() {
        assert_eq!(
            classify(
                Phase::Init,
                "Fatal: create key in repository at s3:http://minio/b failed: repository master key and config already initialized"
            ),
            Some(Disposition::RepositoryExists)
        );
        assert_eq!(
            classify(Phase::Init, "Fatal: config file already exists"),
            Some(Disposition::RepositoryExists)
        );
        assert_eq!(classify(Phase::Init, "Fatal: wrong password"), None);
    }

    #[test]
    fn test_patterns_are_scoped_to_phase() {
        let line = "ignoring error for /data/file: lchown /data/file: operation not permitted";
        assert_eq!(
            classify(Phase::Restore, line),
            Some(Disposition::OwnershipIgnored)
        );
        assert_eq!(classify(Phase::Init, line), None);
        assert_eq!(classify(Phase::Unlock, line), None);
    }

    #[test]
    fn test_restore_other_errors_are_not_benign() {
        assert_eq!(
            classify(Phase::Restore, "ignoring error for /data/x: open /data/x: permission denied"),
            None
        );
    }

    #[test]
    fn test_tally() {
        let tally = Tally::new();
        tally.record(Phase::Restore, "restore", "ignoring error for /data/a: lchown /data/a: operation not permitted");
        tally.record(Phase::Restore, "restore", "Fatal: There were 1 errors");
        assert!(tally.only_benign());

        tally.record(Phase::Restore, "restore", "");
        assert_eq!(tally.unignored(), 0);

        tally.record(Phase::Restore, "restore", "ignoring error for /data/b: open /data/b: no space left on device");
        assert_eq!(tally.benign(), 2);
        assert_eq!(tally.unignored(), 1);
        assert!(!tally.only_benign());
    }
}
