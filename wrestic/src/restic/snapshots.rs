use super::Restic;
use super::command::Sink;
use super::flags::{Flags, tag_args};
use crate::error::{ResticError, Result};
use common::Snapshot;

impl Restic {
    /// Loads the snapshots of the repository, optionally only those carrying `tags`.
    pub async fn list_snapshots(&mut self, tags: &[String]) -> Result<&[Snapshot]> {
        self.load_snapshots(tags, false).await
    }

    /// Loads the latest snapshot of every host and path.
    pub async fn last_snapshots(&mut self, tags: &[String]) -> Result<&[Snapshot]> {
        self.load_snapshots(tags, true).await
    }

    async fn load_snapshots(&mut self, tags: &[String], latest: bool) -> Result<&[Snapshot]> {
        tracing::info!(latest, "getting list of snapshots");
        let mut local = Flags::new().with_switch("--json");
        if latest {
            local.add_flag("--latest", ["1"]);
        }
        let options = self
            .options("snapshots", "snapshots", local, tag_args(tags))
            .stdout(Sink::Capture);
        let output = self.command(options).run().await?;

        self.snapshots = parse_snapshots(&output.stdout)?;
        Ok(&self.snapshots)
    }
}

pub fn parse_snapshots(raw: &[u8]) -> Result<Vec<Snapshot>> {
    let raw = raw.trim_ascii();
    // restic prints `null` for a repository without snapshots
    if raw.is_empty() || raw == b"null" {
        return Ok(Vec::new());
    }
    serde_json::from_slice(raw).map_err(|e| ResticError::decode("snapshot list", e))
}

/// Picks the snapshot to restore: the one matching `id` exactly or by unique prefix, or the
/// newest one when no id is given.
pub fn select_snapshot<'a>(snapshots: &'a [Snapshot], id: Option<&str>) -> Result<&'a Snapshot> {
    if snapshots.is_empty() {
        return Err(ResticError::NoSnapshots);
    }

    let Some(id) = id.filter(|id| !id.is_empty()) else {
        tracing::info!("no snapshot defined, using latest one");
        return snapshots
            .iter()
            .max_by_key(|s| s.time)
            .ok_or(ResticError::NoSnapshots);
    };

    if let Some(exact) = snapshots.iter().find(|s| s.id == id) {
        return Ok(exact);
    }
    let matches: Vec<&Snapshot> = snapshots.iter().filter(|s| s.id.starts_with(id)).collect();
    match matches.as_slice() {
        [] => Err(ResticError::SnapshotNotFound(id.to_string())),
        [single] => Ok(*single),
        many => Err(ResticError::AmbiguousSnapshot {
            prefix: id.to_string(),
            matches: many.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot(id: &str, hour: u32) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            time: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            tree: String::new(),
            paths: vec!["/data/pvc".to_string()],
            hostname: "ns".to_string(),
            username: String::new(),
            uid: 0,
            gid: 0,
            tags: vec![],
        }
    }

    #[test]
    fn test_select_latest_by_time() {
        // listed out of order on purpose
        let snaps = vec![snapshot("bbb222", 12), snapshot("aaa111", 10)];
        assert_eq!(select_snapshot(&snaps, None).unwrap().id, "bbb222");
        assert_eq!(select_snapshot(&snaps, Some("")).unwrap().id, "bbb222");
    }

    #[test]
    fn test_select_by_prefix() {
        let snaps = vec![snapshot("aaa111", 10), snapshot("bbb222", 12)];
        assert_eq!(select_snapshot(&snaps, Some("aaa")).unwrap().id, "aaa111");
        assert_eq!(select_snapshot(&snaps, Some("bbb222")).unwrap().id, "bbb222");
    }

    #[test]
    fn test_select_failures() {
        let snaps = vec![snapshot("aaa111", 10), snapshot("aab222", 12)];
        let err = select_snapshot(&snaps, Some("ccc")).unwrap_err();
        assert!(err.to_string().contains("no snapshot found"));
        assert!(matches!(
            select_snapshot(&snaps, Some("aa")),
            Err(ResticError::AmbiguousSnapshot { matches: 2, .. })
        ));
        assert!(matches!(
            select_snapshot(&[], None),
            Err(ResticError::NoSnapshots)
        ));
    }

    #[test]
    fn test_parse_snapshots() {
        let raw = br#"[{"time":"2024-05-01T10:00:00.123456789Z","tree":"t","paths":["/data/pvc"],"hostname":"ns","username":"root","uid":0,"gid":0,"id":"aaa111","short_id":"aaa1"}]
"#;
        let snaps = parse_snapshots(raw).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].hostname, "ns");
        assert!(parse_snapshots(b"null\n").unwrap().is_empty());
        assert!(parse_snapshots(b"").unwrap().is_empty());
        assert!(matches!(
            parse_snapshots(b"Fatal: wrong password"),
            Err(ResticError::Decode { .. })
        ));
    }
}
