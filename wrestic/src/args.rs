use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "wrestic", version, about = "Backup worker driving restic", long_about = None)]
pub struct Args {
    /// Check the repository for errors
    #[arg(long)]
    pub check: bool,

    /// Enforce the retention policy
    #[arg(long)]
    pub prune: bool,

    /// Restore a snapshot
    #[arg(long)]
    pub restore: bool,

    /// Upload the latest snapshot of every host to object storage
    #[arg(long)]
    pub archive: bool,

    /// Annotation holding the backup command of a pod
    #[arg(
        long,
        env = "BACKUPCOMMAND_ANNOTATION",
        default_value = "k8up.io/backupcommand"
    )]
    pub backup_command_annotation: String,

    /// Annotation holding the file extension of a backup command's output
    #[arg(
        long,
        env = "FILEEXTENSION_ANNOTATION",
        default_value = "k8up.io/file-extension"
    )]
    pub file_extension_annotation: String,

    /// Annotation naming the container the backup command runs in
    #[arg(
        long,
        env = "BACKUPCOMMAND_CONTAINER_ANNOTATION",
        default_value = "k8up.io/backupcommand-container"
    )]
    pub backup_container_annotation: String,

    /// Directory whose subdirectories are backed up
    #[arg(long, env = "BACKUP_DIR", default_value = "/data")]
    pub backup_dir: PathBuf,

    /// Do not look for pods with backup commands
    #[arg(long, env = "SKIP_PREBACKUP")]
    pub skip_pre_backup: bool,

    /// Push gateway URL
    #[arg(long, env = "PROM_URL", default_value = "")]
    pub prom_url: String,

    /// Webhook URL receiving the stats
    #[arg(long, env = "STATS_URL", default_value = "")]
    pub webhook_url: String,

    /// Hostname used for snapshots, usually the namespace
    #[arg(long, env = "HOSTNAME", default_value = "")]
    pub hostname: String,

    #[arg(long, env = "RESTIC_BINARY", default_value = "/usr/local/bin/restic")]
    pub restic_bin: PathBuf,

    #[arg(long, env = "RESTIC_REPOSITORY", default_value = "")]
    pub restic_repository: String,

    /// Comma separated list of `--option` values passed to every restic call
    #[arg(long, env = "RESTIC_OPTIONS", default_value = "")]
    pub restic_options: String,

    #[arg(long, env = "CA_CERT_FILE")]
    pub ca_cert: Option<PathBuf>,

    #[arg(long, env = "CLIENT_CERT_FILE")]
    pub client_cert: Option<PathBuf>,

    #[arg(long, env = "CLIENT_KEY_FILE")]
    pub client_key: Option<PathBuf>,

    /// Scratch directory for generated files
    #[arg(long, env = "VAR_DIR", default_value = "/k8up")]
    pub var_dir: PathBuf,

    #[arg(long, env = "RESTORE_DIR", default_value = "/data")]
    pub restore_dir: PathBuf,

    #[arg(long, env = "RESTORE_S3ENDPOINT", default_value = "")]
    pub restore_s3_endpoint: String,

    #[arg(long, env = "RESTORE_ACCESSKEYID", default_value = "")]
    pub restore_s3_access_key: String,

    #[arg(long, env = "RESTORE_SECRETACCESSKEY", default_value = "")]
    pub restore_s3_secret_key: String,

    /// Snapshot to restore, the latest one if empty
    #[arg(long, env = "RESTORE_SNAP", default_value = "")]
    pub restore_snap: String,

    /// `folder` or `s3`
    #[arg(long, env = "RESTORE_TYPE", default_value = "")]
    pub restore_type: String,

    #[arg(long, env = "RESTORE_FILTER", default_value = "")]
    pub restore_filter: String,

    #[arg(long, env = "VERIFY_RESTORE")]
    pub verify_restore: bool,

    /// Strip the first two path levels of a snapshot when restoring to a folder
    #[arg(long, env = "RESTORE_TRIM_PATH", default_value_t = true, action = ArgAction::Set)]
    pub restore_trim_path: bool,

    #[arg(long, env = "KEEP_LAST")]
    pub keep_last: Option<u32>,
    #[arg(long, env = "KEEP_HOURLY")]
    pub keep_hourly: Option<u32>,
    #[arg(long, env = "KEEP_DAILY")]
    pub keep_daily: Option<u32>,
    #[arg(long, env = "KEEP_WEEKLY")]
    pub keep_weekly: Option<u32>,
    #[arg(long, env = "KEEP_MONTHLY")]
    pub keep_monthly: Option<u32>,
    #[arg(long, env = "KEEP_YEARLY")]
    pub keep_yearly: Option<u32>,

    #[arg(long, env = "KEEP_WITHIN")]
    pub keep_within: Option<String>,
    #[arg(long, env = "KEEP_WITHIN_HOURLY")]
    pub keep_within_hourly: Option<String>,
    #[arg(long, env = "KEEP_WITHIN_DAILY")]
    pub keep_within_daily: Option<String>,
    #[arg(long, env = "KEEP_WITHIN_WEEKLY")]
    pub keep_within_weekly: Option<String>,
    #[arg(long, env = "KEEP_WITHIN_MONTHLY")]
    pub keep_within_monthly: Option<String>,
    #[arg(long, env = "KEEP_WITHIN_YEARLY")]
    pub keep_within_yearly: Option<String>,

    /// Keep snapshots carrying a tag
    #[arg(long, env = "KEEP_TAGS")]
    pub keep_tags: bool,

    /// Tags added to backups and used to filter snapshots
    #[arg(long = "tag", env = "TAGS", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only run backup commands in these pods
    #[arg(long, env = "TARGET_PODS", value_delimiter = ',')]
    pub target_pods: Vec<String>,

    /// Seconds to idle after the jobs finished
    #[arg(long, env = "SLEEP_DURATION")]
    pub sleep_duration: Option<u64>,

    #[arg(long, env = "KUBECTL_BINARY", default_value = "kubectl")]
    pub kubectl_bin: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["wrestic"]).unwrap();
        assert!(!args.check && !args.prune && !args.restore && !args.archive);
        assert!(args.restore_trim_path);
        assert_eq!(args.keep_last, None);
        assert_eq!(args.backup_command_annotation, "k8up.io/backupcommand");
    }

    #[test]
    fn test_explicit_values() {
        let args = Args::try_parse_from([
            "wrestic",
            "--prune",
            "--keep-last",
            "5",
            "--tag",
            "daily,weekly",
            "--restore-trim-path",
            "false",
        ])
        .unwrap();
        assert!(args.prune);
        assert_eq!(args.keep_last, Some(5));
        assert_eq!(args.tags, vec!["daily", "weekly"]);
        assert!(!args.restore_trim_path);
    }
}
