use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use telepresence_runner::Runner;
use tracing::debug;

use crate::OutboundError;

const TORSOCKS_CONFIG: &str = "\
# Allow process to listen on ports:
AllowInbound 1
# Allow process to connect to localhost:
AllowOutboundLocalhost 1
# Connect to custom port for SOCKS server:
TorPort {}
";

/// Set up the environment that makes torsocks redirect the user command's
/// TCP through the local SOCKS tunnel, then verify the tunnel actually
/// works before handing the environment back.
pub async fn setup_torsocks(
    runner: &Arc<Runner>,
    env: &mut HashMap<String, String>,
    socks_port: u16,
) -> Result<(), OutboundError> {
    // Older torsocks can't take the port from the environment, so write a
    // per-session config file.
    let conf_path = runner.temp_path().join("tel_torsocks.conf");
    std::fs::write(&conf_path, TORSOCKS_CONFIG.replace("{}", &socks_port.to_string()))
        .map_err(telepresence_runner::RunnerError::from)?;
    env.insert(
        "TORSOCKS_CONF_FILE".to_string(),
        conf_path.to_string_lossy().into_owned(),
    );
    if let Some(logfile) = runner.output().logfile_path() {
        env.insert(
            "TORSOCKS_LOG_FILE_PATH".to_string(),
            logfile.to_string_lossy().into_owned(),
        );
    }

    // Prove that proxying works by forcing a TCP connect through torsocks;
    // re-exec ourselves for the probe so no interpreter is needed.
    let probe_binary = std::env::current_exe()
        .map_err(telepresence_runner::RunnerError::from)?
        .to_string_lossy()
        .into_owned();
    let mut ticker = runner.loop_until(Duration::from_secs(10), Duration::from_millis(100));
    while ticker.next().await?.is_some() {
        let attempt = runner
            .command([
                "torsocks",
                probe_binary.as_str(),
                "--probe-connect",
                "google.com:80",
            ])
            .envs(env.clone())
            .check()
            .await;
        if attempt.is_ok() {
            debug!("torsocks tunnel verified");
            return Ok(());
        }
    }
    Err(OutboundError::Fatal(
        "SOCKS network proxying failed to start...".to_string(),
    ))
}

/// The target of the hidden `--probe-connect` flag: open a TCP connection
/// and exit. Run under torsocks this round-trips the SOCKS tunnel.
pub fn run_connect_probe(target: &str) -> i32 {
    match std::net::TcpStream::connect(target) {
        Ok(_) => 0,
        Err(exc) => {
            eprintln!("probe connect to {} failed: {}", target, exc);
            1
        }
    }
}

/// The user command's environment: the inherited one, the pod's variables
/// layered on top, a tagged shell prompt, and the workaround PATH.
pub fn user_environment(
    context: &str,
    env_overrides: &HashMap<String, String>,
    workaround_path: &str,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(env_overrides.clone());
    env.insert(
        "PROMPT_COMMAND".to_string(),
        format!("PS1=\"@{}|$PS1\";unset PROMPT_COMMAND", context),
    );
    env.insert("PATH".to_string(), workaround_path.to_string());
    env
}
