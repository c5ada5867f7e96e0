use std::time::Duration;

use serde_json::json;
use telepresence_runner::{LaunchOptions, Platform, RunnerError};
use telepresence_ssh::{find_free_port, Ssh, MAC_LOOPBACK_IP};
use tokio::process::Child;
use tracing::debug;

use crate::cidr::get_proxy_cidrs;
use crate::docker::Docker;
use crate::launch::spawn_user_process;
use crate::{random_name, LaunchContext, OutboundError};

/// Separate `--publish` flags from the rest of a `docker run` argument
/// list. Published ports move to the network container, which owns the
/// namespace they must bind in.
pub fn parse_docker_args(docker_run: &[String]) -> (Vec<String>, Vec<String>) {
    let mut docker_args = Vec::new();
    let mut publish_args = Vec::new();
    let mut iter = docker_run.iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "--publish" || arg == "-p" {
            if let Some(value) = iter.next() {
                publish_args.push(format!("-p={}", value));
            }
        } else if let Some(value) = arg
            .strip_prefix("--publish=")
            .or_else(|| arg.strip_prefix("-p="))
        {
            publish_args.push(format!("-p={}", value));
        } else {
            docker_args.push(arg.clone());
        }
    }
    (docker_args, publish_args)
}

/// Convert the pod's resolv.conf into `docker run` DNS flags so the user
/// container resolves names the way the pod would.
pub fn parse_resolv_conf(contents: &str) -> Vec<String> {
    let mut result = Vec::new();
    for line in contents.lines() {
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else { continue };
        match keyword.to_lowercase().as_str() {
            "nameserver" => {
                if let Some(server) = tokens.next() {
                    result.push(format!("--dns={}", server));
                }
            }
            "search" => {
                for domain in tokens {
                    result.push(format!("--dns-search={}", domain));
                }
            }
            "options" => {
                for option in tokens {
                    result.push(format!("--dns-opt={}", option));
                }
            }
            _ => {}
        }
    }
    result
}

/// Convert the pod's hostAliases section of /etc/hosts into `--add-host`
/// flags.
pub fn parse_hosts_aliases(contents: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut in_host_aliases = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            in_host_aliases = comment.contains("HostAliases");
            continue;
        }
        if in_host_aliases {
            let mut tokens = line.split_whitespace();
            let Some(ip) = tokens.next() else { continue };
            for host in tokens {
                result.push(format!("--add-host={}:{}", host, ip));
            }
        }
    }
    result
}

fn docker_kill_args(docker: Docker, name: &str) -> Vec<String> {
    docker.args(["stop".to_string(), "--time=1".to_string(), name.to_string()])
}

/// Run the user's container inside a sibling network namespace that routes
/// through the cluster: a privileged network container runs sshuttle, the
/// user container joins it with `--network=container:<name>`.
pub async fn run_docker_command(
    ctx: &LaunchContext<'_>,
    docker: Docker,
    docker_run: &[String],
) -> Result<Child, OutboundError> {
    let runner = ctx.runner;
    let mut remote_env = ctx.env.clone();
    remote_env.insert("TELEPRESENCE_METHOD".to_string(), "container".to_string());

    let (docker_args, mut publish_args) = parse_docker_args(docker_run);

    // Reach the network container's sshd from the host.
    let container_sshd_port = find_free_port().map_err(RunnerError::from)?;
    publish_args.push(format!("--publish=127.0.0.1:{}:38022/tcp", container_sshd_port));
    let local_ssh = Ssh::with_user_at_host(container_sshd_port, "root@127.0.0.1");

    // The network container needs a route back to the tunnel: the bridged
    // interface address on Linux, the lo0 alias on macOS.
    let mut config = json!({
        "port": ctx.ssh.port,
        "cidrs": get_proxy_cidrs(runner, ctx.kube, ctx.remote_info, &[]).await?,
        "expose_ports": ctx.expose.local_to_remote(),
    });
    if runner.platform() == Platform::MacOs {
        config["ip"] = json!(MAC_LOOPBACK_IP);
    }

    let mut dns_args = Vec::new();
    if let Some(hostname) = &ctx.pod_info.hostname {
        dns_args.push(format!("--hostname={}", hostname.trim()));
    }
    if let Some(hosts) = &ctx.pod_info.hosts {
        dns_args.extend(parse_hosts_aliases(hosts));
    }
    if let Some(resolv) = &ctx.pod_info.resolv {
        dns_args.extend(parse_resolv_conf(resolv));
    }

    let name = random_name();
    let mut network_args = docker.args(["run"]);
    network_args.extend(publish_args);
    network_args.extend(dns_args);
    network_args.extend([
        "--rm".to_string(),
        "--privileged".to_string(),
        format!("--name={}", name),
        ctx.remote_info.image.clone(),
        "proxy".to_string(),
        config.to_string(),
    ]);
    let kill_runner = runner.clone();
    let kill_args = docker_kill_args(docker, &name);
    let killer: telepresence_runner::KillFn = Box::new(move || {
        let stop: telepresence_runner::KillFuture = Box::pin(async move {
            let _ = kill_runner.check_call(kill_args).await;
        });
        stop
    });
    runner
        .launch(
            "Network container",
            network_args,
            LaunchOptions {
                killer: Some(killer),
                keep_session: docker.needs_sudo(),
                ..Default::default()
            },
        )
        .await?;

    // Give the namespace a loopback path to the tunnel as well.
    if !local_ssh.wait(runner).await? {
        return Err(OutboundError::Fatal(
            "SSH to the network container failed to start.".to_string(),
        ));
    }
    let container_forward_args = vec![
        "-R".to_string(),
        format!("38023:127.0.0.1:{}", ctx.ssh.port),
    ];
    runner
        .launch(
            "Local SSH port forward",
            local_ssh.bg_command(runner.verbose(), &container_forward_args),
            LaunchOptions::default(),
        )
        .await?;

    // Wait for sshuttle inside the network container: a sibling container
    // in the same namespace exits 100 once the VPN works.
    let mut sshuttle_ok = false;
    let mut ticker = runner.loop_until(Duration::from_secs(120), Duration::from_secs(1));
    while ticker.next().await?.is_some() {
        let wait_args = docker.args([
            "run".to_string(),
            format!("--network=container:{}", name),
            "--rm".to_string(),
            ctx.remote_info.image.clone(),
            "wait".to_string(),
        ]);
        match runner.command(wait_args).check().await {
            Ok(()) => {
                return Err(OutboundError::Fatal(
                    "Waiting container exited prematurely. File a bug, please!".to_string(),
                ))
            }
            Err(RunnerError::CommandFailed { code: 100, .. }) => {
                sshuttle_ok = true;
                break;
            }
            // 125 is docker itself failing, usually because the network
            // container hasn't finished starting; try again.
            Err(RunnerError::CommandFailed { code: 125, .. }) => continue,
            Err(exc) => return Err(exc.into()),
        }
    }
    if !sshuttle_ok {
        return Err(OutboundError::Fatal(
            "Waiting for network container timed out. File a bug, please!".to_string(),
        ));
    }

    // Finally the container the user asked for, sharing that namespace.
    let container_name = random_name();
    let mut command = docker.args(["run"]);
    command.push(format!("--name={}", container_name));
    command.push(format!("--network=container:{}", name));
    for key in remote_env.keys() {
        command.push(format!("--env={}", key));
    }
    if let Some(mount_dir) = ctx.mount_dir {
        command.push(format!("--volume={}:{}", mount_dir.display(), mount_dir.display()));
    }
    // Don't add --init if the user is doing something with it already.
    let has_init = docker_args
        .iter()
        .any(|arg| arg == "--init" || arg.starts_with("--init="));
    if !has_init {
        let run_help = runner
            .get_output(["docker", "run", "--help"])
            .await
            .unwrap_or_default();
        if run_help.contains("--init") {
            command.push("--init".to_string());
        }
    }
    command.extend(docker_args);

    runner.show("Setup complete. Launching your container.");
    let process = spawn_user_process(&command, &remote_env)?;
    let kill_runner = runner.clone();
    let kill_args = docker_kill_args(docker, &container_name);
    runner.add_cleanup("Terminate local container", move || async move {
        kill_runner.write("Shutting down containers...");
        let _ = kill_runner.check_call(kill_args).await;
        Ok(())
    });
    debug!("User container is {}", container_name);
    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_flags_are_split_out() {
        let args: Vec<String> = [
            "-i", "-t", "--publish", "8080:80", "-p=9090:90", "ubuntu:16.04", "/bin/bash",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let (docker_args, publish_args) = parse_docker_args(&args);
        assert_eq!(docker_args, vec!["-i", "-t", "ubuntu:16.04", "/bin/bash"]);
        assert_eq!(publish_args, vec!["-p=8080:80", "-p=9090:90"]);
    }

    #[test]
    fn resolv_conf_turns_into_docker_dns_flags() {
        let resolv = "nameserver 10.96.0.10\nsearch default.svc.cluster.local svc.cluster.local\noptions ndots:5\n";
        assert_eq!(
            parse_resolv_conf(resolv),
            vec![
                "--dns=10.96.0.10",
                "--dns-search=default.svc.cluster.local",
                "--dns-search=svc.cluster.local",
                "--dns-opt=ndots:5",
            ]
        );
    }

    #[test]
    fn host_aliases_become_add_host_flags() {
        let hosts = "127.0.0.1 localhost\n# Kubernetes-managed hosts file (host aliases - HostAliases).\n10.1.2.3 foo.local bar.local\n";
        assert_eq!(
            parse_hosts_aliases(hosts),
            vec!["--add-host=foo.local:10.1.2.3", "--add-host=bar.local:10.1.2.3"]
        );
    }
}
