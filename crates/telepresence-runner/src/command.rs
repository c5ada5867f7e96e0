use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

use crate::background::spawn_piped;
use crate::error::RunnerError;
use crate::output::Output;
use crate::runner::{render_command, Runner};

/// Builder for a blocking subprocess call, logged to the session log under a
/// fresh track number.
pub struct Cmd<'r> {
    runner: &'r Runner,
    argv: Vec<String>,
    input: Option<Vec<u8>>,
    timeout: Option<Duration>,
    envs: Vec<(String, String)>,
    /// Leave stdin/stdout/stderr attached to the terminal (sudo prompts).
    interactive: bool,
    /// Log captured stdout even in quiet mode.
    reveal: bool,
    /// Include stderr in the captured text (tools that report on stderr).
    merge_stderr: bool,
}

impl<'r> Cmd<'r> {
    pub fn new(runner: &'r Runner, argv: Vec<String>) -> Self {
        Cmd {
            runner,
            argv,
            input: None,
            timeout: None,
            envs: Vec::new(),
            interactive: false,
            reveal: false,
            merge_stderr: false,
        }
    }

    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn reveal(mut self) -> Self {
        self.reveal = true;
        self
    }

    pub fn merge_stderr(mut self) -> Self {
        self.merge_stderr = true;
        self
    }

    /// Run to completion; non-zero exit is an error.
    pub async fn check(self) -> Result<(), RunnerError> {
        self.run(false).await.map(|_| ())
    }

    /// Run to completion and return trimmed stdout. Stderr goes to the log.
    pub async fn capture(self) -> Result<String, RunnerError> {
        self.run(true).await
    }

    async fn run(mut self, capture_stdout: bool) -> Result<String, RunnerError> {
        let track = self.runner.next_track();
        let rendered = render_command(&self.argv);
        let verb = if capture_stdout { "Capturing" } else { "Running" };
        self.runner
            .write(&format!("[{}] {}: {}", track, verb, rendered));
        let started = Instant::now();

        if self.interactive {
            return self.run_interactive(track, &rendered).await;
        }

        let stdin = if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut argv = std::mem::take(&mut self.argv);
        if !self.envs.is_empty() {
            // Compose through env(1) so the log shows the real invocation.
            let mut wrapped = vec!["env".to_string()];
            wrapped.extend(self.envs.iter().map(|(k, v)| format!("{}={}", k, v)));
            wrapped.extend(argv);
            argv = wrapped;
        }
        let mut child = spawn_piped(&argv, true, stdin)?;

        if let Some(data) = self.input.take() {
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle.write_all(&data).await?;
            drop(handle);
        }

        let prefix = format!("{:>3}", track);
        let log_stdout = !capture_stdout || self.reveal || self.runner.verbose();
        let out_pump = consume_stream(
            child.stdout.take().expect("stdout was piped"),
            self.runner.output(),
            prefix.clone(),
            log_stdout,
            capture_stdout,
        );
        let err_pump = consume_stream(
            child.stderr.take().expect("stderr was piped"),
            self.runner.output(),
            prefix.clone(),
            true,
            true,
        );

        let status = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(RunnerError::Timeout {
                        command: rendered,
                        timeout,
                    });
                }
            },
            None => child.wait().await?,
        };
        let stdout_lines = out_pump.await.unwrap_or_default();
        let stderr_lines = err_pump.await.unwrap_or_default();

        let spent = started.elapsed().as_secs_f64();
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            self.runner
                .write(&format!("[{}] exit {} in {:0.2} secs.", track, code, spent));
            let mut output = stdout_lines;
            output.extend(stderr_lines);
            return Err(RunnerError::CommandFailed {
                command: rendered,
                code,
                output: output.join("\n").trim().to_string(),
            });
        }
        if spent > 1.0 {
            let verb = if capture_stdout { "captured" } else { "ran" };
            self.runner
                .write(&format!("[{}] {} in {:0.2} secs.", track, verb, spent));
        }
        let mut captured = stdout_lines;
        if self.merge_stderr {
            captured.extend(stderr_lines);
        }
        Ok(captured.join("\n").trim().to_string())
    }

    async fn run_interactive(self, track: u64, rendered: &str) -> Result<String, RunnerError> {
        let mut command = tokio::process::Command::new(&self.argv[0]);
        command.args(&self.argv[1..]);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        let status = command
            .status()
            .await
            .map_err(|source| RunnerError::Spawn {
                command: rendered.to_string(),
                source,
            })?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            self.runner.write(&format!("[{}] exit {}", track, code));
            return Err(RunnerError::CommandFailed {
                command: rendered.to_string(),
                code,
                output: String::new(),
            });
        }
        Ok(String::new())
    }
}

/// Drain a stream line by line, optionally logging each line, returning the
/// collected lines once the stream closes.
fn consume_stream<R>(
    stream: R,
    output: Arc<Output>,
    prefix: String,
    log: bool,
    collect: bool,
) -> tokio::task::JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if log {
                output.write(&prefix, &line);
            }
            if collect {
                collected.push(line);
            }
        }
        collected
    })
}
