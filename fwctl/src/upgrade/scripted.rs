//! Scripted process launcher
//!
//! Replays canned output instead of spawning processes. The CLI uses it for `--dry-run`, the
//! test suites use it to drive the engine through every scenario without a device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::UpgradeError;
use crate::upgrade::launcher::{OutputLine, ProcessLauncher, RunningProcess};
use crate::upgrade::transport::CommandSpec;

/// Canned behaviour of one launched process
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    lines: Vec<(Duration, OutputLine)>,
    repeat: Option<(Duration, OutputLine)>,
    exit_code: Option<i32>,
    hang: bool,
    launch_error: Option<String>,
}

impl ScriptedRun {
    /// Print the configured lines, then exit with `code`
    pub fn exits(code: i32) -> Self {
        Self {
            lines: Vec::new(),
            repeat: None,
            exit_code: Some(code),
            hang: false,
            launch_error: None,
        }
    }

    /// Print the configured lines, then never exit on its own
    pub fn hangs() -> Self {
        Self {
            hang: true,
            exit_code: None,
            ..Self::exits(0)
        }
    }

    /// Fail at launch, like a missing binary
    pub fn fails_to_launch(message: impl Into<String>) -> Self {
        Self {
            launch_error: Some(message.into()),
            ..Self::exits(0)
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.lines.push((Duration::ZERO, OutputLine::stdout(text)));
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.lines.push((Duration::ZERO, OutputLine::stderr(text)));
        self
    }

    /// Delay the next line
    pub fn pause(mut self, delay: Duration) -> Self {
        self.lines.push((delay, OutputLine::stdout(String::new())));
        self
    }

    /// After the configured lines, print `text` every `every` until killed
    pub fn streaming(mut self, text: impl Into<String>, every: Duration) -> Self {
        self.repeat = Some((every, OutputLine::stdout(text)));
        self.hang = true;
        self
    }
}

/// What the launcher was asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchRecord {
    /// The argument carrying the remote script or upload destination
    pub fn last_arg(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: Mutex<VecDeque<ScriptedRun>>,
    launches: Mutex<Vec<LaunchRecord>>,
    kills: AtomicUsize,
    next_pid: AtomicU32,
}

/// Launcher that plays back queued [`ScriptedRun`]s in order.
///
/// With an empty queue every launch succeeds silently with exit code 0.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLauncher {
    inner: Arc<Inner>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        let launcher = Self::new();
        for run in runs {
            launcher.push(run);
        }
        launcher
    }

    pub fn push(&self, run: ScriptedRun) {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(run);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.inner
            .launches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn launch_count(&self) -> usize {
        self.inner
            .launches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Number of processes terminated through [`RunningProcess::terminate`]
    pub fn kill_count(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, spec: &CommandSpec) -> Result<Box<dyn RunningProcess>, UpgradeError> {
        self.inner
            .launches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(LaunchRecord {
                program: spec.program.clone(),
                args: spec.args.clone(),
            });

        let run = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::exits(0));

        if let Some(message) = run.launch_error {
            return Err(UpgradeError::SpawnError(message));
        }

        let pid = 40_000 + self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedProcess {
            pid,
            lines: run.lines.into(),
            repeat: run.repeat,
            exit_code: run.exit_code,
            hang: run.hang,
            killed: false,
            inner: self.inner.clone(),
        }))
    }
}

struct ScriptedProcess {
    pid: u32,
    lines: VecDeque<(Duration, OutputLine)>,
    repeat: Option<(Duration, OutputLine)>,
    exit_code: Option<i32>,
    hang: bool,
    killed: bool,
    inner: Arc<Inner>,
}

#[async_trait]
impl RunningProcess for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn next_line(&mut self) -> Option<OutputLine> {
        if self.killed {
            return None;
        }
        while let Some((delay, line)) = self.lines.pop_front() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // pauses are carried by empty placeholder lines
            if !line.text.is_empty() {
                return Some(line);
            }
        }
        match &self.repeat {
            Some((every, line)) => {
                tokio::time::sleep(*every).await;
                Some(line.clone())
            }
            None => None,
        }
    }

    async fn wait(&mut self) -> Result<Option<i32>, UpgradeError> {
        if self.hang && !self.killed {
            std::future::pending::<()>().await;
        }
        Ok(if self.killed { None } else { self.exit_code })
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Option<i32>, UpgradeError> {
        if !self.killed {
            self.killed = true;
            self.lines.clear();
            self.repeat = None;
            self.inner.kills.fetch_add(1, Ordering::SeqCst);
        }
        Ok(None)
    }
}
