use std::sync::Arc;
use std::time::Duration;

use telepresence_runner::Runner;

use crate::OutboundError;

/// Composes `docker` command lines, with sudo when the daemon socket needs
/// it (Linux without docker-group membership).
#[derive(Debug, Clone, Copy)]
pub struct Docker {
    sudo: bool,
}

impl Docker {
    pub fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = Vec::new();
        if self.sudo {
            argv.push("sudo".to_string());
        }
        argv.push("docker".to_string());
        argv.extend(rest.into_iter().map(Into::into));
        argv
    }

    pub fn needs_sudo(&self) -> bool {
        self.sudo
    }
}

/// Check that docker is installed and the daemon answers, escalating to
/// sudo when plain access is refused.
pub async fn require_docker(runner: &Arc<Runner>) -> Result<Docker, OutboundError> {
    runner.require(&["docker"], "Please install Docker")?;
    let plain = Docker { sudo: false };
    if runner
        .command(plain.args(["version", "--format", "{{.Server.Version}}"]))
        .check()
        .await
        .is_ok()
    {
        return Ok(plain);
    }
    runner.require_sudo().await?;
    let with_sudo = Docker { sudo: true };
    runner
        .command(with_sudo.args(["version", "--format", "{{.Server.Version}}"]))
        .check()
        .await
        .map_err(|_| {
            OutboundError::Fatal("Unable to talk to the Docker daemon".to_string())
        })?;
    Ok(with_sudo)
}

/// Confirm the daemon is actually local by round-tripping the session id
/// through a volume mount. Remote daemons (including Minikube's) cannot see
/// our /tmp, which breaks volumes and port forwards in confusing ways.
pub async fn check_local_docker(runner: &Arc<Runner>, docker: Docker) -> Result<(), OutboundError> {
    let local_docker_message = "Telepresence's container method requires using a local \
        Docker daemon. Connecting to a remote daemon or a daemon running in a VM does not \
        work at this time. If you are using Minikube's Docker daemon, launch Telepresence \
        in a separate shell that does not have the Minikube Docker environment variables set.";
    let mount = format!("{}:/tel", runner.temp_path().display());
    let result = runner
        .command(docker.args([
            "run",
            "--rm",
            "-v",
            &mount,
            "alpine:3.6",
            "cat",
            "/tel/session_id.txt",
        ]))
        .timeout(Duration::from_secs(30))
        .reveal()
        .capture()
        .await;
    match result {
        Ok(id_in_container) if id_in_container.trim() == runner.session_id() => Ok(()),
        Ok(id_in_container) => {
            runner.write(&format!("Expected: [{}]", runner.session_id()));
            runner.write(&format!("Got:      [{}]", id_in_container));
            runner.show("ID mismatch on local Docker check.");
            runner.show(local_docker_message);
            Err(OutboundError::Fatal(
                "Error: Local Docker daemon required".to_string(),
            ))
        }
        Err(exc) => {
            runner.show(&format!("Local Docker check failed: {}", exc));
            runner.show(local_docker_message);
            Err(OutboundError::Fatal(
                "Error: Local Docker daemon required".to_string(),
            ))
        }
    }
}
