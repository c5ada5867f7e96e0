//! Network-container duty for the docker method: this binary also runs as a
//! privileged sidecar on the workstation, where it drives sshuttle over the
//! session tunnel and exposes the user's published ports.

use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::info;

/// Config blob passed by the host side.
#[derive(Debug, Deserialize)]
struct ProxyConfig {
    /// Host port of the session's SSH tunnel.
    port: u16,
    /// Address where the host is reachable from this container. Present on
    /// macOS (the lo0 alias); on Linux the default route points at the
    /// docker bridge, i.e. the host.
    #[serde(default)]
    ip: Option<String>,
    cidrs: Vec<String>,
    #[serde(default)]
    expose_ports: Vec<(u16, u16)>,
}

const SSH_ARGS: &str = "ssh -F /dev/null -oStrictHostKeyChecking=no -oUserKnownHostsFile=/dev/null";

/// Find the host: explicit config, else the default route's gateway.
async fn host_address(config: &ProxyConfig) -> anyhow::Result<String> {
    if let Some(ip) = &config.ip {
        return Ok(ip.clone());
    }
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await?;
    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    parse_default_route(&text)
        .ok_or_else(|| anyhow::anyhow!("no default route found in {:?}", text))
}

fn parse_default_route(ip_route_output: &str) -> Option<String> {
    for line in ip_route_output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() == Some(&"default") {
            if let Some(via) = tokens.iter().position(|token| *token == "via") {
                return tokens.get(via + 1).map(|gateway| gateway.to_string());
            }
        }
    }
    None
}

fn spawn(argv: Vec<String>) -> anyhow::Result<Child> {
    info!("Launching: {}", argv.join(" "));
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]).stdin(Stdio::null());
    Ok(command.spawn()?)
}

/// Run the VPN for the shared network namespace: sshuttle through the
/// session tunnel, plus the reverse tunnels for exposed ports. Never
/// returns on success; any child exiting takes the container down.
pub async fn proxy(config_text: &str) -> anyhow::Result<()> {
    let config: ProxyConfig = serde_json::from_str(config_text)?;
    let host = host_address(&config).await?;
    info!("Connecting to the session tunnel at {}:{}", host, config.port);

    let mut sshuttle_args: Vec<String> = [
        "sshuttle",
        "-v",
        "--dns",
        "--method",
        "nat",
        "-e",
        SSH_ARGS,
        "--to-ns",
        "127.0.0.1:9053",
        "-r",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    sshuttle_args.push(format!("telepresence@{}:{}", host, config.port));
    sshuttle_args.extend(config.cidrs.clone());
    let mut children = vec![spawn(sshuttle_args)?];

    if !config.expose_ports.is_empty() {
        let mut ssh_args: Vec<String> = SSH_ARGS.split(' ').map(str::to_string).collect();
        ssh_args.extend([
            "-N".to_string(),
            "-oServerAliveInterval=1".to_string(),
            "-oServerAliveCountMax=10".to_string(),
            "-p".to_string(),
            config.port.to_string(),
            format!("telepresence@{}", host),
        ]);
        for (local, remote) in &config.expose_ports {
            ssh_args.push("-R".to_string());
            ssh_args.push(format!("*:{}:127.0.0.1:{}", remote, local));
        }
        children.push(spawn(ssh_args)?);
    }

    // First child to die ends the namespace.
    loop {
        for child in &mut children {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("network process exited with {}", status);
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Readiness check, run in the same namespace as the proxy: exit 100 once
/// cluster DNS works through the VPN.
pub async fn wait() -> anyhow::Result<()> {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(30) {
        if !crate::dns::resolve_ipv4("hellotelepresence").await.is_empty() {
            // Give the rest of the stack a moment to settle.
            tokio::time::sleep(Duration::from_secs(1)).await;
            std::process::exit(100);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    eprintln!("Failed to connect to proxy in remote cluster.");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_gateway_is_extracted() {
        let output = "default via 172.17.0.1 dev eth0\n172.17.0.0/16 dev eth0 scope link\n";
        assert_eq!(parse_default_route(output).as_deref(), Some("172.17.0.1"));
        assert_eq!(parse_default_route("10.0.0.0/8 dev eth1\n"), None);
    }

    #[test]
    fn proxy_config_accepts_optional_ip() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"port": 40022, "cidrs": ["10.0.0.0/24"], "expose_ports": [[8080, 80]]}"#,
        )
        .unwrap();
        assert_eq!(config.port, 40022);
        assert_eq!(config.ip, None);
        assert_eq!(config.expose_ports, vec![(8080, 80)]);
    }
}
