//! Spawning restic (or any helper binary) with concurrently drained output.
//!
//! A [`Command`] is started without blocking and awaited separately through the returned
//! [`RunningCommand`]. Each output stream is drained by its own task so a full pipe buffer on
//! one side can never stall the process. When an input stream is supplied a forwarding task
//! copies it into the process and reports through a one-shot completion slot, which is awaited
//! before the process itself.

use crate::error::{ResticError, Result};
use std::{
    ffi::OsString,
    fmt,
    io,
    path::PathBuf,
    process::Stdio,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub const PROGRESS_FPS_ENV: &str = "RESTIC_PROGRESS_FPS";
const DEFAULT_PROGRESS_FPS: f64 = 1.0 / 60.0;

/// Restic exits with 3 when the snapshot was written but some source files were unreadable.
pub const PARTIAL_SNAPSHOT_EXIT_CODE: i32 = 3;

pub trait LineHandler: Send + 'static {
    fn handle_line(&mut self, line: &str);
}

impl<F> LineHandler for F
where
    F: FnMut(&str) + Send + 'static,
{
    fn handle_line(&mut self, line: &str) {
        self(line)
    }
}

/// Where one output stream of the process goes.
#[derive(Default)]
pub enum Sink {
    #[default]
    Discard,
    /// Every line is re-emitted through `tracing`.
    Log,
    Lines(Box<dyn LineHandler>),
    /// The stream is collected and returned by [`RunningCommand::wait`].
    Capture,
    /// The caller takes the raw stream with [`RunningCommand::take_stdout`].
    Piped,
}

impl Sink {
    pub fn lines(handler: impl LineHandler) -> Self {
        Sink::Lines(Box::new(handler))
    }

    fn stdio(&self) -> Stdio {
        match self {
            Sink::Discard => Stdio::null(),
            _ => Stdio::piped(),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Sink::Discard => "Discard",
            Sink::Log => "Log",
            Sink::Lines(_) => "Lines",
            Sink::Capture => "Capture",
            Sink::Piped => "Piped",
        };
        f.write_str(name)
    }
}

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

pub struct CommandOptions {
    /// Logical operation, used in logs and errors.
    pub name: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<InputStream>,
    pub stdout: Sink,
    pub stderr: Sink,
}

impl CommandOptions {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args,
            env: Vec::new(),
            stdin: None,
            stdout: Sink::Log,
            stderr: Sink::Log,
        }
    }

    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn stdin(mut self, input: InputStream) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Default)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct Command {
    options: CommandOptions,
    cancel: CancellationToken,
}

impl Command {
    pub fn new(options: CommandOptions, cancel: CancellationToken) -> Self {
        Self { options, cancel }
    }

    /// Starts the process and its I/O tasks without waiting for it.
    pub fn start(self) -> Result<RunningCommand> {
        let CommandOptions {
            name,
            path,
            args,
            mut env,
            stdin,
            stdout,
            stderr,
        } = self.options;

        if self.cancel.is_cancelled() {
            return Err(ResticError::Cancelled { command: name });
        }

        if let Some(fps) = default_progress_fps(&env, std::env::var_os(PROGRESS_FPS_ENV)) {
            tracing::debug!(frequency = %fps.1, "defining {PROGRESS_FPS_ENV}");
            env.push(fps);
        }

        tracing::info!(command = %name, path = %path.display(), args = ?args, "restic command");

        let mut cmd = tokio::process::Command::new(&path);
        cmd.args(&args)
            .envs(env)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(stdout.stdio())
            .stderr(stderr.stdio())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ResticError::Startup {
            path: path.display().to_string(),
            source,
        })?;

        let input_done = match (stdin, child.stdin.take()) {
            (Some(source), Some(sink)) => {
                let (tx, rx) = oneshot::channel();
                tokio::spawn(async move {
                    let _ = tx.send(forward_input(source, sink).await);
                });
                Some(rx)
            }
            _ => None,
        };

        let mut raw_stdout = None;
        let stdout_task = match (stdout, child.stdout.take()) {
            (Sink::Piped, Some(out)) => {
                raw_stdout = Some(out);
                None
            }
            (sink, Some(out)) => Some(tokio::spawn(drain(out, sink, name.clone(), "stdout"))),
            (_, None) => None,
        };
        let stderr_task = match (stderr, child.stderr.take()) {
            (Sink::Piped, Some(err)) => {
                tracing::warn!(command = %name, "stderr can't be piped, logging it instead");
                Some(tokio::spawn(drain(err, Sink::Log, name.clone(), "stderr")))
            }
            (sink, Some(err)) => Some(tokio::spawn(drain(err, sink, name.clone(), "stderr"))),
            (_, None) => None,
        };

        Ok(RunningCommand {
            name,
            child,
            cancel: self.cancel,
            raw_stdout,
            stdout_task,
            stderr_task,
            input_done,
        })
    }

    /// Starts the process and waits for it, see [`RunningCommand::wait`].
    pub async fn run(self) -> Result<CommandOutput> {
        self.start()?.wait().await
    }
}

pub struct RunningCommand {
    name: String,
    child: Child,
    cancel: CancellationToken,
    raw_stdout: Option<ChildStdout>,
    stdout_task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stderr_task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    input_done: Option<oneshot::Receiver<io::Result<u64>>>,
}

impl RunningCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// The raw stdout of a command started with [`Sink::Piped`].
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.raw_stdout.take()
    }

    /// Waits until the input stream was fully forwarded into the process.
    ///
    /// Must complete before the process is awaited, otherwise the output can be read before
    /// all input reached the process. [`RunningCommand::wait`] calls it when the caller didn't.
    pub async fn input_done(&mut self) -> Result<()> {
        let Some(rx) = self.input_done.take() else {
            return Ok(());
        };
        let forwarded = tokio::select! {
            res = rx => res,
            _ = self.cancel.cancelled() => {
                let _ = self.child.kill().await;
                return Err(ResticError::Cancelled { command: self.name.clone() });
            }
        };
        match forwarded {
            Ok(Ok(bytes)) => {
                tracing::debug!(command = %self.name, bytes, "input forwarded");
                Ok(())
            }
            Ok(Err(e)) => Err(ResticError::stream("stdin forwarding", e)),
            Err(_) => Err(ResticError::stream(
                "stdin forwarding",
                io::Error::other("forwarding task stopped without a result"),
            )),
        }
    }

    /// Waits for the process to exit and for all of its output to be drained, then applies the
    /// exit code policy.
    pub async fn wait(mut self) -> Result<CommandOutput> {
        self.input_done().await?;

        let status = tokio::select! {
            status = self.child.wait() => status.map_err(|e| ResticError::stream("process wait", e))?,
            _ = self.cancel.cancelled() => {
                tracing::warn!(command = %self.name, "cancelled, killing process");
                let _ = self.child.kill().await;
                return Err(ResticError::Cancelled { command: self.name });
            }
        };

        let stdout = join_drain(self.stdout_task.take(), "stdout drain").await?;
        let stderr = join_drain(self.stderr_task.take(), "stderr drain").await?;

        exit_policy(&self.name, status.code())?;
        Ok(CommandOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Exit 0 and the partial snapshot code are success, everything else is fatal.
pub fn exit_policy(command: &str, code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        Some(PARTIAL_SNAPSHOT_EXIT_CODE) => {
            tracing::warn!(command, "some source files could not be read");
            Ok(())
        }
        Some(code) => Err(ResticError::Execution {
            command: command.to_string(),
            code,
        }),
        None => Err(ResticError::Terminated {
            command: command.to_string(),
        }),
    }
}

fn default_progress_fps(
    env: &[(String, String)],
    inherited: Option<OsString>,
) -> Option<(String, String)> {
    if inherited.is_some() || env.iter().any(|(k, _)| k == PROGRESS_FPS_ENV) {
        return None;
    }
    Some((
        PROGRESS_FPS_ENV.to_string(),
        format!("{DEFAULT_PROGRESS_FPS:.6}"),
    ))
}

fn is_closed_pipe(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

async fn forward_input(mut source: InputStream, mut sink: ChildStdin) -> io::Result<u64> {
    let copied = match tokio::io::copy(&mut source, &mut sink).await {
        Ok(n) => n,
        Err(e) if is_closed_pipe(&e) => return Ok(0),
        Err(e) => return Err(e),
    };
    match sink.shutdown().await {
        Err(e) if !is_closed_pipe(&e) => Err(e),
        _ => Ok(copied),
    }
}

async fn drain<R>(reader: R, sink: Sink, command: String, stream: &'static str) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let result = match sink {
        Sink::Capture => reader.read_to_end(&mut captured).await.map(|_| ()),
        Sink::Discard | Sink::Piped => tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .map(|_| ()),
        Sink::Log => {
            for_each_line(&mut reader, |line| {
                tracing::info!(command = %command, stream, "{line}");
            })
            .await
        }
        Sink::Lines(mut handler) => for_each_line(&mut reader, |line| handler.handle_line(line)).await,
    };
    match result {
        Err(e) if !is_closed_pipe(&e) => Err(e),
        _ => Ok(captured),
    }
}

async fn for_each_line<R, F>(reader: &mut BufReader<R>, mut f: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.trim_end_matches(['\n', '\r']));
    }
}

async fn join_drain(
    task: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stage: &'static str,
) -> Result<Vec<u8>> {
    let Some(task) = task else {
        return Ok(Vec::new());
    };
    task.await
        .map_err(|e| ResticError::stream(stage, io::Error::other(e)))?
        .map_err(|e| ResticError::stream(stage, e))
}
