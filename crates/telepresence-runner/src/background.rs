use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::error::RunnerError;
use crate::output::Output;

/// Lines of recent output retained per background job for crash reports.
const CAPTURE_LINES: usize = 10;

pub type KillFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type KillFn = Box<dyn FnOnce() -> KillFuture + Send>;

pub struct LaunchOptions {
    /// Custom shutdown action (e.g. `docker stop`); the default is SIGTERM
    /// followed by SIGKILL one second later.
    pub killer: Option<KillFn>,
    /// Does this job's death take the whole session down?
    pub critical: bool,
    /// Keep the child in our session so it can use the controlling terminal
    /// (needed when a subprocess must prompt for a sudo password). Everything
    /// else runs in its own session, isolated from terminal signals.
    pub keep_session: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        LaunchOptions {
            killer: None,
            critical: true,
            keep_session: false,
        }
    }
}

/// A background job registered with the Runner. The child itself is owned by
/// a monitor task; this handle retains what is needed to kill it and to
/// report on its death.
pub struct BackgroundJob {
    pub name: String,
    pub track: u64,
    pub critical: bool,
    pid: i32,
    own_session: bool,
    finished: Arc<AtomicBool>,
    killer: Mutex<Option<KillFn>>,
}

impl BackgroundJob {
    pub fn new(
        name: &str,
        track: u64,
        critical: bool,
        pid: i32,
        own_session: bool,
        finished: Arc<AtomicBool>,
        killer: Option<KillFn>,
    ) -> Self {
        BackgroundJob {
            name: name.to_string(),
            track,
            critical,
            pid,
            own_session,
            finished,
            killer: Mutex::new(killer),
        }
    }

    pub fn alive(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    /// Stop the job: custom killer if one was registered, otherwise SIGTERM
    /// the process (group), escalating to SIGKILL after one second.
    pub async fn kill(&self) {
        let killer = self.killer.lock().unwrap().take();
        if let Some(killer) = killer {
            killer().await;
            return;
        }
        if !self.alive() {
            return;
        }
        // Children started in their own session are group leaders, so signal
        // the whole group to catch their helpers too.
        let target = if self.own_session { -self.pid } else { self.pid };
        unsafe {
            libc::kill(target, libc::SIGTERM);
        }
        for _ in 0..20 {
            if !self.alive() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        unsafe {
            libc::kill(target, libc::SIGKILL);
        }
    }
}

/// Spawn `argv` with stdout/stderr piped, optionally in a new session.
pub fn spawn_piped(
    argv: &[String],
    keep_session: bool,
    stdin: Stdio,
) -> Result<Child, RunnerError> {
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !keep_session {
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }
    command.spawn().map_err(|source| RunnerError::Spawn {
        command: crate::runner::render_command(argv),
        source,
    })
}

/// Pump one output stream into the session log line by line, keeping the
/// most recent lines in `capture`.
pub fn pump_stream<R>(
    stream: R,
    output: Arc<Output>,
    prefix: String,
    capture: Option<Arc<Mutex<VecDeque<String>>>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            output.write(&prefix, &line);
            if let Some(capture) = &capture {
                let mut capture = capture.lock().unwrap();
                if capture.len() == CAPTURE_LINES {
                    capture.pop_front();
                }
                capture.push_back(line);
            }
        }
    })
}
