use crate::args::Args;
use crate::error::ConfigError;
use regex::Regex;
use std::{fmt, path::PathBuf, str::FromStr, sync::LazyLock, time::Duration};

static ENGINE_DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+[ymdh])+$").expect("valid duration pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreType {
    Folder,
    S3,
}

impl FromStr for RestoreType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "folder" => Ok(RestoreType::Folder),
            "s3" => Ok(RestoreType::S3),
            other => Err(ConfigError::UnknownRestoreType(other.to_string())),
        }
    }
}

impl fmt::Display for RestoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreType::Folder => write!(f, "folder"),
            RestoreType::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Destination {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Keep rules for `restic forget`. Unset rules are never passed to restic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_last: Option<u32>,
    pub keep_hourly: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,
    pub keep_within: Option<String>,
    pub keep_within_hourly: Option<String>,
    pub keep_within_daily: Option<String>,
    pub keep_within_weekly: Option<String>,
    pub keep_within_monthly: Option<String>,
    pub keep_within_yearly: Option<String>,
    pub keep_tags: bool,
}

impl RetentionPolicy {
    pub fn counters(&self) -> [(&'static str, Option<u32>); 6] {
        [
            ("--keep-last", self.keep_last),
            ("--keep-hourly", self.keep_hourly),
            ("--keep-daily", self.keep_daily),
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ]
    }

    pub fn durations(&self) -> [(&'static str, Option<&str>); 6] {
        [
            ("--keep-within", self.keep_within.as_deref()),
            ("--keep-within-hourly", self.keep_within_hourly.as_deref()),
            ("--keep-within-daily", self.keep_within_daily.as_deref()),
            ("--keep-within-weekly", self.keep_within_weekly.as_deref()),
            ("--keep-within-monthly", self.keep_within_monthly.as_deref()),
            ("--keep-within-yearly", self.keep_within_yearly.as_deref()),
        ]
    }

    fn validate(&self, errors: &mut Vec<ConfigError>) {
        for (arg, value) in self.durations() {
            let Some(value) = value else { continue };
            if value.is_empty() {
                continue;
            }
            if !ENGINE_DURATION.is_match(value) {
                errors.push(ConfigError::InvalidDuration {
                    arg,
                    value: value.to_string(),
                });
            } else if value.chars().filter(char::is_ascii_digit).all(|c| c == '0') {
                errors.push(ConfigError::EmptyDuration {
                    arg,
                    value: value.to_string(),
                });
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub do_check: bool,
    pub do_prune: bool,
    pub do_restore: bool,
    pub do_archive: bool,

    pub backup_command_annotation: String,
    pub file_extension_annotation: String,
    pub backup_container_annotation: String,
    pub backup_dir: PathBuf,
    pub skip_pre_backup: bool,
    pub target_pods: Vec<String>,

    pub prom_url: String,
    pub webhook_url: String,

    pub hostname: String,
    pub restic_bin: PathBuf,
    pub restic_repository: String,
    pub restic_options: Vec<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub var_dir: PathBuf,
    pub kubectl_bin: PathBuf,

    pub restore_dir: PathBuf,
    pub restore_snap: Option<String>,
    pub restore_type: Option<RestoreType>,
    pub restore_filter: Option<String>,
    pub verify_restore: bool,
    pub restore_trim_path: bool,
    pub restore_s3: S3Destination,

    pub retention: RetentionPolicy,
    pub tags: Vec<String>,
    pub sleep_duration: Option<Duration>,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Config {
    /// Builds and validates the configuration of the selected jobs.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let restore_selected = args.restore || args.archive;
        let restore_type = match non_empty(&args.restore_type) {
            Some(t) => match t.parse::<RestoreType>() {
                Ok(t) => Some(t),
                Err(e) => {
                    if restore_selected {
                        errors.push(e);
                    }
                    None
                }
            },
            // archives always go to object storage
            None if args.archive => Some(RestoreType::S3),
            None => {
                if args.restore {
                    errors.push(ConfigError::UnknownRestoreType(String::new()));
                }
                None
            }
        };

        let config = Config {
            do_check: args.check,
            do_prune: args.prune,
            do_restore: args.restore,
            do_archive: args.archive,
            backup_command_annotation: args.backup_command_annotation,
            file_extension_annotation: args.file_extension_annotation,
            backup_container_annotation: args.backup_container_annotation,
            backup_dir: args.backup_dir,
            skip_pre_backup: args.skip_pre_backup,
            target_pods: args
                .target_pods
                .into_iter()
                .filter_map(|p| non_empty(&p))
                .collect(),
            prom_url: args.prom_url,
            webhook_url: args.webhook_url,
            hostname: args.hostname,
            restic_bin: args.restic_bin,
            restic_repository: args.restic_repository,
            restic_options: args
                .restic_options
                .split(',')
                .filter_map(non_empty)
                .collect(),
            ca_cert: args.ca_cert,
            client_cert: args.client_cert,
            client_key: args.client_key,
            var_dir: args.var_dir,
            kubectl_bin: args.kubectl_bin,
            restore_dir: args.restore_dir,
            restore_snap: non_empty(&args.restore_snap),
            restore_type,
            restore_filter: non_empty(&args.restore_filter),
            verify_restore: args.verify_restore,
            restore_trim_path: args.restore_trim_path,
            restore_s3: S3Destination {
                endpoint: args.restore_s3_endpoint,
                access_key: args.restore_s3_access_key,
                secret_key: args.restore_s3_secret_key,
            },
            retention: RetentionPolicy {
                keep_last: args.keep_last,
                keep_hourly: args.keep_hourly,
                keep_daily: args.keep_daily,
                keep_weekly: args.keep_weekly,
                keep_monthly: args.keep_monthly,
                keep_yearly: args.keep_yearly,
                keep_within: args.keep_within,
                keep_within_hourly: args.keep_within_hourly,
                keep_within_daily: args.keep_within_daily,
                keep_within_weekly: args.keep_within_weekly,
                keep_within_monthly: args.keep_within_monthly,
                keep_within_yearly: args.keep_within_yearly,
                keep_tags: args.keep_tags,
            },
            tags: args.tags.into_iter().filter_map(|t| non_empty(&t)).collect(),
            sleep_duration: args.sleep_duration.map(Duration::from_secs),
        };

        config.validate(&mut errors);
        match ConfigError::from_all(errors) {
            Some(err) => Err(err),
            None => Ok(config),
        }
    }

    fn validate(&self, errors: &mut Vec<ConfigError>) {
        if self.do_prune {
            self.retention.validate(errors);
        }
        if self.do_restore || self.do_archive {
            self.validate_restore(errors);
        }
    }

    fn validate_restore(&self, errors: &mut Vec<ConfigError>) {
        match self.restore_type {
            Some(RestoreType::S3) => {
                let required = [
                    ("restore s3 endpoint", &self.restore_s3.endpoint),
                    ("restore s3 access key", &self.restore_s3.access_key),
                    ("restore s3 secret key", &self.restore_s3.secret_key),
                ];
                for (what, value) in required {
                    if value.trim().is_empty() {
                        errors.push(ConfigError::MissingRestoreSetting {
                            restore_type: "s3",
                            what,
                        });
                    }
                }
            }
            Some(RestoreType::Folder) => {
                if self.restore_dir.as_os_str().is_empty() {
                    errors.push(ConfigError::MissingRestoreSetting {
                        restore_type: "folder",
                        what: "restore directory",
                    });
                }
            }
            // the unknown type was already reported
            None => {}
        }
    }

    /// The name of the bucket or directory the repository lives in.
    pub fn repository_name(&self) -> String {
        self.restic_repository
            .trim_end_matches('/')
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string()
    }
}
