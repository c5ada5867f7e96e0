use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use telepresence_runner::Runner;
use tokio::process::Child;

use crate::OutboundError;

/// Start the user's command with the pod-derived environment, attached to
/// the terminal.
pub fn spawn_user_process(
    argv: &[String],
    env: &HashMap<String, String>,
) -> Result<Child, OutboundError> {
    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]);
    for (key, value) in env {
        command.env(key, value);
    }
    command
        .spawn()
        .map_err(|exc| OutboundError::Fatal(format!("Failed to run {}: {}", argv[0], exc)))
}

/// Arrange for the user process to be stopped during cleanup: SIGTERM, then
/// SIGKILL if it is still around a second later. `finished` is set by the
/// supervisor once the process has already been reaped.
pub fn terminate_on_cleanup(runner: &Arc<Runner>, pid: i32, finished: Arc<AtomicBool>) {
    let cleanup_runner = runner.clone();
    runner.add_cleanup("Terminate local process", move || async move {
        if finished.load(Ordering::SeqCst) || pid <= 0 {
            return Ok(());
        }
        cleanup_runner.write("Killing local process...");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        Ok(())
    });
}
