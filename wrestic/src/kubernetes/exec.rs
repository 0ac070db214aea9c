//! Runs a pod's backup command through `kubectl exec` and exposes its stdout as a stream.

use super::pods::BackupPod;
use crate::error::{ResticError, Result};
use crate::restic::command::{Command, CommandOptions, InputStream, RunningCommand, Sink};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub fn exec_args(pod: &BackupPod) -> Result<Vec<String>> {
    let command = shlex::split(&pod.command).ok_or_else(|| {
        ResticError::Kubernetes(format!(
            "backup command of pod {} can't be split: {}",
            pod.pod_name, pod.command
        ))
    })?;
    if command.is_empty() {
        return Err(ResticError::Kubernetes(format!(
            "backup command of pod {} is empty",
            pod.pod_name
        )));
    }

    let mut args = vec![
        "exec".to_string(),
        "-i=false".to_string(),
        "--namespace".to_string(),
        pod.namespace.clone(),
        pod.pod_name.clone(),
        "-c".to_string(),
        pod.container_name.clone(),
        "--".to_string(),
    ];
    args.extend(command);
    Ok(args)
}

/// A running backup command. Its stdout is the input of a stdin backup.
pub struct ExecStream {
    pod: String,
    command: RunningCommand,
}

impl ExecStream {
    pub fn start(pod: &BackupPod, kubectl: &Path, cancel: CancellationToken) -> Result<Self> {
        let args = exec_args(pod)?;
        tracing::info!(namespace = %pod.namespace, pod = %pod.pod_name, command = %pod.command, "executing command");

        let options = CommandOptions::new(format!("exec {}", pod.pod_name), kubectl, args)
            .stdout(Sink::Piped)
            .stderr(Sink::Log);
        let command = Command::new(options, cancel).start()?;
        Ok(Self {
            pod: pod.pod_name.clone(),
            command,
        })
    }

    pub fn take_reader(&mut self) -> Result<InputStream> {
        let stdout = self.command.take_stdout().ok_or_else(|| {
            ResticError::stream(
                "exec stream",
                std::io::Error::other("stdout of the backup command was already taken"),
            )
        })?;
        Ok(Box::new(stdout))
    }

    /// Waits for the backup command after its stream was consumed.
    pub async fn finish(self) -> Result<()> {
        match self.command.wait().await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!(pod = %self.pod, "streaming data failed: {e}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(command: &str) -> BackupPod {
        BackupPod {
            command: command.to_string(),
            pod_name: "db-0".to_string(),
            container_name: "postgres".to_string(),
            namespace: "ns".to_string(),
            file_extension: ".sql".to_string(),
        }
    }

    #[test]
    fn test_exec_args() {
        let args = exec_args(&pod("sh -c 'pg_dumpall -U \"postgres\"'")).unwrap();
        assert_eq!(
            args,
            vec![
                "exec",
                "-i=false",
                "--namespace",
                "ns",
                "db-0",
                "-c",
                "postgres",
                "--",
                "sh",
                "-c",
                "pg_dumpall -U \"postgres\""
            ]
        );
    }

    #[test]
    fn test_invalid_commands() {
        assert!(exec_args(&pod("")).is_err());
        assert!(exec_args(&pod("sh -c 'unterminated")).is_err());
    }
}
