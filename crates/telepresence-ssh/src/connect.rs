use std::sync::Arc;

use regex::Regex;
use telepresence_kube::Kube;
use telepresence_proxy::{PortMapping, RemoteInfo};
use telepresence_runner::{LaunchOptions, Platform, Runner};
use tracing::info;

use crate::beacon::launch_local_server;
use crate::expose::expose_local_services;
use crate::{find_free_port, Ssh, SshError};

/// Routable alias added to `lo0` on macOS so containers can reach the
/// host-side tunnel; from the benchmarking range of RFC 6890, so it cannot
/// collide with real networks.
pub const MAC_LOOPBACK_IP: &str = "198.18.0.254";

/// The established tunnel stack: the SSH handle for building more forwards,
/// and the local port where the pod's SOCKS server is reachable.
pub struct Tunnel {
    pub ssh: Ssh,
    pub socks_port: u16,
}

/// Check that the `ssh` in $PATH is usable OpenSSH.
pub async fn check_ssh(runner: &Runner) -> Result<(), SshError> {
    runner.require(&["ssh"], "Please install the OpenSSH client")?;
    // OpenSSH reports its version on stderr.
    let version = runner.command(["ssh", "-V"]).merge_stderr().capture().await?;
    if !version.starts_with("OpenSSH") {
        return Err(SshError::NotOpenSsh);
    }
    Ok(())
}

/// Start every process that handles proxying to the pod: a pod log tail, the
/// port-forward to the pod's SSH listener, the exposed-port tunnels, and the
/// SOCKS plus liveness forwards.
pub async fn connect(
    runner: &Arc<Runner>,
    kube: &Kube,
    remote_info: &RemoteInfo,
    is_container_mode: bool,
    expose: &PortMapping,
) -> Result<Tunnel, SshError> {
    // Keep a local copy of the pod logs for debugging. Logs failing must not
    // bring the session down.
    runner
        .launch(
            "kubectl logs",
            kube.args([
                "logs",
                "-f",
                remote_info.pod_name.as_str(),
                "--container",
                remote_info.container_name.as_str(),
                "--tail=10",
            ]),
            LaunchOptions {
                critical: false,
                ..Default::default()
            },
        )
        .await?;

    let ssh = Ssh::new(find_free_port().map_err(SshError::Beacon)?);
    runner
        .launch(
            "kubectl port-forward",
            kube.args([
                "port-forward".to_string(),
                remote_info.pod_name.clone(),
                format!("{}:8022", ssh.port),
            ]),
            LaunchOptions::default(),
        )
        .await?;

    if is_container_mode {
        bridge_for_docker(runner, &ssh).await?;
    }

    if !ssh.wait(runner).await? {
        // Describe the pod; output goes to the logfile.
        runner.write("SSH timed out. Pod info follows.");
        remote_info.probe(runner, kube).await;
        return Err(SshError::SshNotStarting);
    }

    // In container mode the tunnels are created inside the network
    // container; only show the messages here.
    expose_local_services(runner, &ssh, &expose.local_to_remote(), is_container_mode).await?;

    // The SOCKS tunnel (local -> pod) and the liveness server the pod polls
    // (pod -> local).
    let socks_port = find_free_port().map_err(SshError::Beacon)?;
    let local_server_port = find_free_port().map_err(SshError::Beacon)?;
    launch_local_server(runner, local_server_port).await?;
    let forward_args = vec![
        format!("-L127.0.0.1:{}:127.0.0.1:9050", socks_port),
        format!("-R9055:127.0.0.1:{}", local_server_port),
    ];
    runner
        .launch(
            "SSH port forward (socks and proxy poll)",
            ssh.bg_command(runner.verbose(), &forward_args),
            LaunchOptions::default(),
        )
        .await?;

    info!("Tunnel ready; SOCKS on local port {}", socks_port);
    Ok(Tunnel { ssh, socks_port })
}

/// `kubectl port-forward` binds loopback only, but the docker sidecar has to
/// reach the tunnel from its own network namespace. Bridge the docker
/// interface (Linux) or an `lo0` alias (macOS) back to loopback with socat.
async fn bridge_for_docker(runner: &Arc<Runner>, ssh: &Ssh) -> Result<(), SshError> {
    let docker_interface = match runner.platform() {
        Platform::Linux => {
            let missing = runner.depend(&["ip", "ifconfig"]);
            let output = if !missing.contains(&"ip".to_string()) {
                runner
                    .get_output(["ip", "addr", "show", "dev", "docker0"])
                    .await?
            } else if !missing.contains(&"ifconfig".to_string()) {
                runner.get_output(["ifconfig", "docker0"]).await?
            } else {
                return Err(SshError::MissingInterface(
                    "docker0 (need \"ip addr\" or \"ifconfig\")".to_string(),
                ));
            };
            first_ipv4(&output).ok_or_else(|| SshError::MissingInterface("docker0".to_string()))?
        }
        Platform::MacOs => {
            runner
                .check_call(["sudo", "ifconfig", "lo0", "alias", MAC_LOOPBACK_IP])
                .await?;
            let cleanup_runner = runner.clone();
            runner.add_cleanup("Mac loopback alias", move || async move {
                cleanup_runner
                    .check_call(["sudo", "ifconfig", "lo0", "-alias", MAC_LOOPBACK_IP])
                    .await?;
                Ok(())
            });
            MAC_LOOPBACK_IP.to_string()
        }
    };

    runner
        .launch(
            "socat for docker",
            vec![
                "socat".to_string(),
                format!(
                    "TCP4-LISTEN:{},bind={},reuseaddr,fork",
                    ssh.port, docker_interface
                ),
                format!("TCP4:127.0.0.1:{}", ssh.port),
            ],
            LaunchOptions::default(),
        )
        .await?;
    Ok(())
}

fn first_ipv4(text: &str) -> Option<String> {
    let pattern = Regex::new(r"(\d+\.\d+\.\d+\.\d+)").expect("static pattern compiles");
    pattern
        .captures(text)
        .map(|captures| captures[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_interface_address() {
        let output = "4: docker0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500\n\
                      inet 172.17.0.1/16 brd 172.17.255.255 scope global docker0";
        assert_eq!(first_ipv4(output).as_deref(), Some("172.17.0.1"));
        assert_eq!(first_ipv4("no addresses here"), None);
    }
}
