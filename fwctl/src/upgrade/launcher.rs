//! Process launching

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::UpgradeError;
use crate::upgrade::transport::CommandSpec;

/// Longest line forwarded in one piece
const MAX_LINE_BYTES: u64 = 16 * 1024;

/// Output stream of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// One line of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Starts processes for the supervisor
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn RunningProcess>, UpgradeError>;
}

/// A started process
#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Next line from stdout or stderr. `None` once both streams are closed.
    async fn next_line(&mut self) -> Option<OutputLine>;

    /// Wait for exit. `None` when the process was ended by a signal.
    async fn wait(&mut self) -> Result<Option<i32>, UpgradeError>;

    /// Ask the process to stop, force it after `grace`, and reap it
    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, UpgradeError>;
}

/// Spawns real child processes with tokio
#[derive(Debug, Clone, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn RunningProcess>, UpgradeError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some((name, value)) = &spec.secret_env {
            cmd.env(name, value.expose_secret());
        }

        // own process group so termination reaches ssh and its helpers
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| UpgradeError::SpawnError(format!("{}: {}", spec.program, e)))?;

        let (tx, rx) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, tx));
        }

        debug!("Spawned {} with pid {:?}", spec.program, child.id());
        Ok(Box::new(TokioProcess { child, lines: rx }))
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // longer lines arrive in pieces
        let read = (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                // device output may be in any encoding
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read {}: {}", stream.as_str(), e);
                break;
            }
        }
    }
}

struct TokioProcess {
    child: Child,
    lines: mpsc::Receiver<OutputLine>,
}

impl TokioProcess {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain syscall on the group we created at spawn
            let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
            if result != 0 {
                debug!(
                    "kill(-{}, {}) failed: {}",
                    pid,
                    signal,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[async_trait]
impl RunningProcess for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    async fn wait(&mut self) -> Result<Option<i32>, UpgradeError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Option<i32>, UpgradeError> {
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);

        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.code()),
            Err(_) => {
                warn!("Process did not stop within {:?}, killing it", grace);
                #[cfg(unix)]
                self.signal_group(libc::SIGKILL);
                let _ = self.child.start_kill();
                let status = self.child.wait().await?;
                Ok(status.code())
            }
        }
    }
}
