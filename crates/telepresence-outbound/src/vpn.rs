use std::sync::Arc;
use std::time::Duration;

use telepresence_kube::Kube;
use telepresence_proxy::RemoteInfo;
use telepresence_runner::{LaunchOptions, Platform, Runner};
use telepresence_ssh::Ssh;
use tracing::debug;

use crate::cidr::get_proxy_cidrs;
use crate::OutboundError;

/// Read the nameserver entries out of a resolv.conf-style file.
pub fn resolv_conf_nameservers(contents: &str) -> Vec<String> {
    let mut result = Vec::new();
    for line in contents.lines() {
        let lowered = line.to_lowercase();
        let mut parts = lowered.split_whitespace();
        if parts.next() == Some("nameserver") {
            if let Some(server) = parts.next() {
                result.push(server.to_string());
            }
        }
    }
    result
}

/// Pick a public nameserver the host is *not* already using, so queries sent
/// to it are never re-captured by the firewall redirect (the DNS loop on
/// local VMs).
pub fn alternate_nameserver() -> Result<String, OutboundError> {
    let contents = std::fs::read_to_string("/etc/resolv.conf").unwrap_or_default();
    let banned = resolv_conf_nameservers(&contents);
    let public = [
        "8.8.8.8",
        "8.8.4.4",
        "216.146.35.35",
        "216.146.36.36",
        "209.244.0.3",
        "209.244.0.4",
        "64.6.64.6",
        "64.6.65.6",
    ];
    public
        .iter()
        .find(|ns| !banned.contains(&ns.to_string()))
        .map(|ns| ns.to_string())
        .ok_or_else(|| {
            OutboundError::Fatal(
                "All known public nameservers are in /etc/resolv.conf.".to_string(),
            )
        })
}

/// Does `name` resolve within the timeout? Uses the system resolver, so
/// search domains apply, which is exactly what the readiness probe needs.
pub async fn dns_lookup(name: &str, timeout: Duration) -> bool {
    let lookup = tokio::net::lookup_host((name, 80));
    matches!(tokio::time::timeout(timeout, lookup).await, Ok(Ok(_)))
}

fn sshuttle_command(ssh: &Ssh, method: &str) -> Vec<String> {
    vec![
        "sshuttle".to_string(),
        "-v".to_string(),
        "--dns".to_string(),
        "--method".to_string(),
        method.to_string(),
        "-e".to_string(),
        format!("ssh {}", ssh.required_args().join(" ")),
        "-r".to_string(),
        format!("{}:{}", ssh.user_at_host, ssh.port),
    ]
}

/// Launch sshuttle against the pod's SSH server and wait until cluster DNS
/// actually works through it.
pub async fn connect_sshuttle(
    runner: &Arc<Runner>,
    kube: &Kube,
    remote_info: &RemoteInfo,
    also_proxy: &[String],
    ssh: &Ssh,
) -> Result<(), OutboundError> {
    // tproxy mode is unreliable; force nat on Linux.
    let method = match runner.platform() {
        Platform::Linux => "nat",
        Platform::MacOs => "auto",
    };
    let mut argv = sshuttle_command(ssh, method);
    // DNS goes to the repeater on the remote pod.
    argv.extend(["--to-ns".to_string(), "127.0.0.1:9053".to_string()]);
    argv.extend(get_proxy_cidrs(runner, kube, remote_info, also_proxy).await?);
    runner
        .launch(
            "sshuttle",
            argv,
            LaunchOptions {
                // Avoid trouble with interactive sudo.
                keep_session: true,
                ..Default::default()
            },
        )
        .await?;

    // sshuttle takes a while to start. It is up once DNS resolution of
    // single-label names works three times in a row: single labels pick up
    // resolv.conf search domains, which also teaches the pod-side resolver
    // which suffixes to strip. Each probe uses a fresh name because some
    // systems cache NXDOMAIN aggressively.
    let mut countdown = 3;
    let mut ticker = runner.loop_until(Duration::from_secs(35), Duration::from_millis(100));
    while let Some(idx) = ticker.next().await? {
        let name = format!("hellotelepresence-{}", idx);
        runner.write(&format!("Wait for vpn-tcp connection: {}", name));
        if dns_lookup(&name, Duration::from_secs(5)).await {
            countdown -= 1;
            runner.write(&format!("Resolved {}. {} more...", name, countdown));
            if countdown == 0 {
                break;
            }
        }
        // Some network setups don't resolve single-label names the normal
        // way. This variant never resolves; it exists purely to show up in
        // the pod-side logs and make that failure mode diagnosable.
        let many_dotted_name = format!("{}.a.sanity.check.telepresence.io", name);
        dns_lookup(&many_dotted_name, Duration::from_secs(1)).await;
    }

    if countdown != 0 {
        let diagnostic_runner = runner.clone();
        runner.add_cleanup("Diagnose vpn-tcp", move || async move {
            log_info_vpn_crash(&diagnostic_runner).await;
            Ok(())
        });
        return Err(OutboundError::Fatal(
            "vpn-tcp tunnel did not connect".to_string(),
        ));
    }
    debug!("sshuttle is connected");
    Ok(())
}

/// Log resolver state that tends to explain vpn-tcp failures.
async fn log_info_vpn_crash(runner: &Arc<Runner>) {
    let commands = [
        "ls -l /etc/resolv.conf",
        "grep -v ^# /etc/resolv.conf",
        "ls -l /etc/resolvconf",
        "cat /etc/nsswitch.conf",
        "ls -l /etc/resolver",
    ];
    for command in commands {
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let _ = runner
            .command(argv)
            .timeout(Duration::from_secs(1))
            .check()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nameserver_lines_are_parsed_case_insensitively() {
        let contents = "# generated\nNAMESERVER 192.168.1.1\nnameserver 8.8.8.8\nsearch foo.example\n";
        assert_eq!(
            resolv_conf_nameservers(contents),
            vec!["192.168.1.1", "8.8.8.8"]
        );
    }

    #[test]
    fn sshuttle_command_targets_the_tunnel() {
        let ssh = Ssh::new(41000);
        let argv = sshuttle_command(&ssh, "nat");
        assert_eq!(argv[0], "sshuttle");
        assert!(argv.contains(&"--dns".to_string()));
        assert!(argv.contains(&"telepresence@127.0.0.1:41000".to_string()));
        let e_arg = &argv[argv.iter().position(|a| a == "-e").unwrap() + 1];
        assert!(e_arg.starts_with("ssh -F /dev/null"));
    }
}
