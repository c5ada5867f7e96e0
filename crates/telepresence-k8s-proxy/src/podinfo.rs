use std::collections::HashMap;

use regex::Regex;
use serde_json::json;

use crate::dns::resolve_ipv4;

/// Mount points that exist in any container and are never worth mirroring.
const IGNORED_MOUNTS: &[&str] = &[
    r"/sys($|/.*)",
    r"/proc($|/.*)",
    r"/dev($|/.*)",
    r"/etc/hostname$",
    r"/etc/resolv.conf$",
    r"/etc/hosts$",
    r"/$",
];

/// The volume mount points of this container, from /proc/mounts.
pub fn mount_points(proc_mounts: &str) -> Vec<String> {
    let ignore =
        Regex::new(&format!("^({})", IGNORED_MOUNTS.join("|"))).expect("static pattern compiles");
    proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|mount_point| !ignore.is_match(mount_point))
        .map(str::to_string)
        .collect()
}

/// Emit everything the host side wants to know about this pod as one JSON
/// blob: the environment, DNS configuration, and interesting mount points.
pub fn print_podinfo() -> anyhow::Result<()> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let info = json!({
        "env": env,
        "hostname": std::fs::read_to_string("/etc/hostname").ok(),
        "resolv": std::fs::read_to_string("/etc/resolv.conf").ok(),
        "hosts": std::fs::read_to_string("/etc/hosts").ok(),
        "mountpoints": mount_points(
            &std::fs::read_to_string("/proc/mounts").unwrap_or_default()
        ),
    });
    println!("{}", info);
    Ok(())
}

/// Resolve each name as this pod would and print a JSON list of address
/// lists, in input order. Any unresolvable name is an error: the caller
/// treats these as cluster dependencies that must exist.
pub async fn resolve_names(names: &[String]) -> anyhow::Result<()> {
    let mut result: Vec<Vec<String>> = Vec::new();
    for name in names {
        let ips = resolve_ipv4(name).await;
        if ips.is_empty() {
            anyhow::bail!("could not resolve {:?}", name);
        }
        result.push(ips.iter().map(|ip| ip.to_string()).collect());
    }
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_mounts_are_ignored() {
        let proc_mounts = "\
overlay / overlay rw 0 0
proc /proc proc rw 0 0
tmpfs /dev/shm tmpfs rw 0 0
/dev/sda1 /var/run/secrets/kubernetes.io/serviceaccount ext4 ro 0 0
/dev/sda1 /app/data ext4 rw 0 0
tmpfs /etc/resolv.conf tmpfs rw 0 0
";
        assert_eq!(
            mount_points(proc_mounts),
            vec!["/var/run/secrets/kubernetes.io/serviceaccount", "/app/data"]
        );
    }
}
