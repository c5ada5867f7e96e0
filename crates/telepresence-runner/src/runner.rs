use std::collections::VecDeque;
use std::future::Future;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::process::Child;
use tokio::signal::unix::{signal, SignalKind};

use crate::background::{pump_stream, spawn_piped, BackgroundJob, LaunchOptions};
use crate::cache::Cache;
use crate::command::Cmd;
use crate::error::RunnerError;
use crate::output::Output;

const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
}

impl Platform {
    pub fn detect() -> Platform {
        if std::env::consts::OS == "macos" {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// Why the supervision loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The user command exited with this code.
    UserExit(i32),
    /// A critical background process died underneath us.
    SessionLost,
    /// SIGINT/SIGTERM/SIGHUP arrived; treated as a normal exit.
    Signal,
}

/// Context for running subprocesses.
pub struct Runner {
    output: Arc<Output>,
    verbose: bool,
    platform: Platform,
    chatty: bool,
    session_id: String,
    temp: PathBuf,
    counter: AtomicU64,
    quitting: AtomicBool,
    got_signal: AtomicBool,
    sudo_held: AtomicBool,
    ended: Mutex<Vec<String>>,
    jobs: Mutex<Vec<Arc<BackgroundJob>>>,
    cleanup_stack: Mutex<Vec<(String, CleanupFn)>>,
    cache: Mutex<Cache>,
}

impl Runner {
    /// Open the session log, create the session temp directory, and load the
    /// discovery cache. `logfile` follows `--logfile` semantics.
    pub fn new(logfile: &str, verbose: bool, version: &str) -> Result<Arc<Runner>, RunnerError> {
        let output = Arc::new(Output::open(logfile)?);
        output.write(
            "TEL",
            &format!(
                "Telepresence {} launched at {}",
                version,
                chrono::Local::now().format("%a %b %e %T %Y")
            ),
        );
        let argv: Vec<String> = std::env::args().collect();
        output.write("TEL", &format!("  {}", render_command(&argv)));

        let platform = Platform::detect();
        output.write(
            "TEL",
            &format!(
                "Platform: {}",
                match platform {
                    Platform::Linux => "linux",
                    Platform::MacOs => "darwin",
                }
            ),
        );

        let session_id = format!("{:032x}", rand::random::<u128>());

        // Docker for Mac only shares some folders; the default TMPDIR on
        // macOS is not one of them, so always use /tmp.
        let temp = PathBuf::from(format!("/tmp/tel-{:08x}", rand::random::<u32>()));
        std::fs::create_dir_all(&temp)?;
        std::fs::write(temp.join("session_id.txt"), &session_id)?;

        let cache_path = directories::BaseDirs::new()
            .map(|dirs| dirs.cache_dir().join("telepresence"))
            .unwrap_or_else(|| PathBuf::from("/tmp/telepresence-cache"))
            .join("cache.json");
        let mut cache = Cache::load(&cache_path);
        cache.invalidate(CACHE_TTL);

        // Cover common locations for conntrack, ifconfig, etc.
        let path = std::env::var("PATH").unwrap_or_default();
        let mut elements: Vec<&str> = path.split(':').collect();
        for additional in ["/usr/sbin", "/sbin"] {
            if !elements.contains(&additional) {
                elements.push(additional);
            }
        }
        std::env::set_var("PATH", elements.join(":"));

        Ok(Arc::new(Runner {
            output,
            verbose,
            platform,
            chatty: std::io::stderr().is_terminal(),
            session_id,
            temp,
            counter: AtomicU64::new(0),
            quitting: AtomicBool::new(false),
            got_signal: AtomicBool::new(false),
            sudo_held: AtomicBool::new(false),
            ended: Mutex::new(Vec::new()),
            jobs: Mutex::new(Vec::new()),
            cleanup_stack: Mutex::new(Vec::new()),
            cache: Mutex::new(cache),
        }))
    }

    pub fn output(&self) -> Arc<Output> {
        self.output.clone()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Is a human watching stderr?
    pub fn chatty(&self) -> bool {
        self.chatty
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn make_temp(&self, name: &str) -> Result<PathBuf, RunnerError> {
        let dir = self.temp.join(name);
        std::fs::create_dir(&dir)?;
        Ok(dir)
    }

    pub fn with_cache<R>(&self, f: impl FnOnce(&mut Cache) -> R) -> R {
        f(&mut self.cache.lock().unwrap())
    }

    pub(crate) fn next_track(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a message to the session log only.
    pub fn write(&self, message: &str) {
        self.output.write("TEL", message);
    }

    /// Display a message to the user on stderr (and log it).
    pub fn show(&self, message: &str) {
        self.output.write(">>>", message);
        for line in message.lines() {
            eprintln!("T: {}", line);
        }
    }

    pub fn command<I, S>(&self, argv: I) -> Cmd<'_>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Cmd::new(self, argv.into_iter().map(Into::into).collect())
    }

    /// Run a subprocess to completion; non-zero exit is an error.
    pub async fn check_call<I, S>(&self, argv: I) -> Result<(), RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(argv).check().await
    }

    /// Run a subprocess and return its trimmed stdout.
    pub async fn get_output<I, S>(&self, argv: I) -> Result<String, RunnerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(argv).capture().await
    }

    /// Start a background process and track it. Its output is pumped into
    /// the session log under a numeric prefix; the last few lines are kept
    /// for the shutdown message.
    pub async fn launch(
        self: &Arc<Self>,
        name: &str,
        argv: Vec<String>,
        options: LaunchOptions,
    ) -> Result<(), RunnerError> {
        let track = self.next_track();
        let rendered = render_command(&argv);
        self.write(&format!("[{}] Launching {}: {}", track, name, rendered));
        let mut child = spawn_piped(&argv, options.keep_session, Stdio::null())?;
        let pid = child.id().unwrap_or(0) as i32;
        let finished = Arc::new(AtomicBool::new(false));
        let capture = Arc::new(Mutex::new(VecDeque::new()));

        let prefix = format!("{:>3}", track);
        let out_pump = pump_stream(
            child.stdout.take().expect("stdout was piped"),
            self.output(),
            prefix.clone(),
            Some(capture.clone()),
        );
        let err_pump = pump_stream(
            child.stderr.take().expect("stderr was piped"),
            self.output(),
            prefix,
            Some(capture.clone()),
        );

        let job = Arc::new(BackgroundJob::new(
            name,
            track,
            options.critical,
            pid,
            !options.keep_session,
            finished.clone(),
            options.killer,
        ));
        self.jobs.lock().unwrap().push(job.clone());

        let runner = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = out_pump.await;
            let _ = err_pump.await;
            finished.store(true, Ordering::SeqCst);
            let code = status.ok().and_then(|status| status.code()).unwrap_or(-1);
            runner.write(&format!("[{}] exit {}", track, code));
            if !job.critical {
                return;
            }
            let recent: Vec<String> = capture.lock().unwrap().iter().cloned().collect();
            let mut message = format!(
                "Background process ({}) exited with return code {}. Command was:\n  {}",
                name, code, rendered
            );
            if !recent.is_empty() {
                message.push_str("\nRecent output was:\n");
                for line in recent {
                    message.push_str("  ");
                    message.push_str(&line);
                    message.push('\n');
                }
            }
            runner.ended.lock().unwrap().push(message);
            runner.quitting.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    // Dependencies

    /// Find unavailable commands from a set of dependencies.
    pub fn depend(&self, commands: &[&str]) -> Vec<String> {
        commands
            .iter()
            .filter(|command| which::which(command).is_err())
            .map(|command| command.to_string())
            .collect()
    }

    /// Verify that a set of commands is available in `$PATH`. Fail with an
    /// explanation if any is unavailable.
    pub fn require(&self, commands: &[&str], message: &str) -> Result<(), RunnerError> {
        let missing = self.depend(commands);
        if missing.is_empty() {
            return Ok(());
        }
        self.show("Required dependencies not found in your PATH:");
        self.show(&format!("  {}", missing.join(" ")));
        self.show(message);
        Err(RunnerError::Fatal(
            "Please see https://www.telepresence.io/reference/install#dependencies \
             for more information."
                .to_string(),
        ))
    }

    // Privilege escalation

    /// Grab sudo and hold on to it: a helper task refreshes the timestamp
    /// every 30 seconds for the rest of the session.
    pub async fn require_sudo(self: &Arc<Self>) -> Result<(), RunnerError> {
        if self.sudo_held.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.check_call(["sudo", "-n", "true"]).await.is_err() {
            self.show("Invoking sudo. Please enter your sudo password.");
            if self
                .command(["sudo", "true"])
                .interactive()
                .check()
                .await
                .is_err()
            {
                self.sudo_held.store(false, Ordering::SeqCst);
                return Err(RunnerError::Fatal(
                    "Unable to escalate privileges with sudo".to_string(),
                ));
            }
        }

        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if !runner.sudo_held.load(Ordering::SeqCst) {
                    break;
                }
                if runner.check_call(["sudo", "-n", "true"]).await.is_err() {
                    runner.write("Attempt to hold on to sudo privileges failed");
                    runner.sudo_held.store(false, Ordering::SeqCst);
                    break;
                }
            }
            runner.write("(sudo privileges holder task exiting)");
        });

        let runner = self.clone();
        self.add_cleanup("Kill sudo privileges holder", move || async move {
            runner.sudo_held.store(false, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    }

    // Cleanup

    /// Push a callback onto the LIFO cleanup stack. It runs on every exit
    /// path; failures are logged and never propagated.
    pub fn add_cleanup<F, Fut>(&self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RunnerError>> + Send + 'static,
    {
        self.cleanup_stack
            .lock()
            .unwrap()
            .push((name.to_string(), Box::new(move || Box::pin(action()))));
    }

    /// Run the cleanup stack in reverse registration order, then stop all
    /// remaining background jobs, remove the temp directory, and flush the
    /// cache. Idempotent: a second call finds nothing left to do.
    pub async fn run_cleanup(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        self.show("Exit cleanup in progress");
        let mut failures = 0;
        loop {
            let item = self.cleanup_stack.lock().unwrap().pop();
            let Some((name, action)) = item else { break };
            self.write(&format!("(Cleanup) {}", name));
            if let Err(exc) = action().await {
                self.write(&format!("(Cleanup) {} failed:", name));
                self.write(&format!("(Cleanup)   {}", exc));
                failures += 1;
            }
        }
        let jobs: Vec<Arc<BackgroundJob>> =
            self.jobs.lock().unwrap().drain(..).rev().collect();
        for job in jobs {
            self.write(&format!("(Cleanup) Kill [{}] {}", job.track, job.name));
            job.kill().await;
        }
        if std::fs::remove_dir_all(&self.temp).is_ok() {
            self.write("(Cleanup) Removed temporary directory");
        }
        if let Err(exc) = self.with_cache(|cache| cache.save()) {
            self.write(&format!("(Cleanup) Failed to save cache: {}", exc));
        }
        if failures > 0 {
            self.show("WARNING: Failures during cleanup. See above.");
        }
    }

    // Failure and exit handling

    pub fn quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn background_crash(&self) -> RunnerError {
        let ended = self.ended.lock().unwrap();
        RunnerError::BackgroundCrash {
            count: ended.len(),
            details: ended.join("\n\n"),
        }
    }

    /// The death notice of the first critical job that exited, if any.
    pub fn first_crash(&self) -> Option<String> {
        self.ended.lock().unwrap().first().cloned()
    }

    /// Begin a polling loop: yields counter values until the deadline, and
    /// errors out as soon as a critical background process has died.
    pub fn loop_until(&self, total: Duration, pause: Duration) -> Ticker<'_> {
        Ticker {
            runner: self,
            deadline: Instant::now() + total,
            pause,
            counter: 0,
            started: false,
        }
    }

    /// Route SIGINT/SIGTERM/SIGHUP into the quitting flag. Repeat signals
    /// (e.g. during cleanup) are coalesced and ignored.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<(), RunnerError> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                    _ = hangup.recv() => "SIGHUP",
                };
                if !runner.got_signal.swap(true, Ordering::SeqCst) {
                    runner.show(&format!("Received signal {}", name));
                    runner.quitting.store(true, Ordering::SeqCst);
                } else {
                    runner.write(&format!("Ignoring {} during shutdown", name));
                }
            }
        });
        Ok(())
    }

    /// Monitor the user process and the background jobs until one of them
    /// ends the session. Polls every 100 ms; never blocks on child I/O.
    pub async fn wait_for_exit(&self, mut user_process: Child) -> ExitReason {
        self.write("Everything launched. Waiting to exit...");
        loop {
            if self.quitting() {
                break;
            }
            match user_process.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code().unwrap_or(-1);
                    self.write(&format!("Main process exited with code {}.", code));
                    return ExitReason::UserExit(code);
                }
                Ok(None) => {}
                Err(exc) => {
                    self.write(&format!("Lost track of the main process: {}", exc));
                    return ExitReason::UserExit(1);
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if self.got_signal.load(Ordering::SeqCst) {
            ExitReason::Signal
        } else {
            ExitReason::SessionLost
        }
    }
}

/// Yields monotonically increasing integers until the deadline passes,
/// sleeping between iterations. Always yields at least once. Errors out when
/// the supervisor observes a critical child has died.
pub struct Ticker<'r> {
    runner: &'r Runner,
    deadline: Instant,
    pause: Duration,
    counter: u64,
    started: bool,
}

impl Ticker<'_> {
    pub async fn next(&mut self) -> Result<Option<u64>, RunnerError> {
        if !self.started {
            self.started = true;
            return Ok(Some(0));
        }
        if self.runner.quitting() {
            return Err(self.runner.background_crash());
        }
        if Instant::now() >= self.deadline {
            return Ok(None);
        }
        tokio::time::sleep(self.pause).await;
        if self.runner.quitting() {
            return Err(self.runner.background_crash());
        }
        self.counter += 1;
        Ok(Some(self.counter))
    }
}

/// Render an argv for logs, quoting arguments that need it.
pub fn render_command(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty()
                || arg
                    .chars()
                    .any(|c| c.is_whitespace() || c == '"' || c == '\'')
            {
                format!("{:?}", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_quotes_awkward_arguments() {
        let argv = vec![
            "kubectl".to_string(),
            "exec".to_string(),
            "print environ".to_string(),
        ];
        assert_eq!(render_command(&argv), "kubectl exec \"print environ\"");
    }

    #[tokio::test]
    async fn ticker_always_yields_once() {
        let runner = Runner::new("-", false, "0.0.0-test").unwrap();
        let mut ticker = runner.loop_until(Duration::from_secs(0), Duration::from_millis(1));
        assert_eq!(ticker.next().await.unwrap(), Some(0));
        assert_eq!(ticker.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_output_returns_trimmed_stdout() {
        let runner = Runner::new("-", false, "0.0.0-test").unwrap();
        let out = runner.get_output(["echo", "hello"]).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn merge_stderr_includes_stderr_in_captures() {
        let runner = Runner::new("-", false, "0.0.0-test").unwrap();
        let out = runner
            .command(["sh", "-c", "echo oops 1>&2"])
            .merge_stderr()
            .capture()
            .await
            .unwrap();
        assert_eq!(out, "oops");
    }

    #[tokio::test]
    async fn check_call_reports_nonzero_exit() {
        let runner = Runner::new("-", false, "0.0.0-test").unwrap();
        let err = runner.check_call(["false"]).await.unwrap_err();
        match err {
            RunnerError::CommandFailed { code, .. } => assert_eq!(code, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
