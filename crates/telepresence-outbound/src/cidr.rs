use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net};
use serde_json::{json, Value};
use telepresence_kube::Kube;
use telepresence_proxy::{RemoteInfo, SESSION_LABEL};
use telepresence_runner::Runner;
use tracing::debug;

use crate::{random_name, OutboundError};

/// Given a list of IPs, return the smallest network of prefix length <= 24
/// that covers them all: form a /24 around each address, then repeatedly
/// widen the first network until everything aggregates into one.
pub fn covering_cidr(ips: &[Ipv4Addr]) -> Option<Ipv4Net> {
    if ips.is_empty() {
        return None;
    }
    let mut networks: Vec<Ipv4Net> = ips
        .iter()
        .map(|&ip| Ipv4Net::new(ip, 24).expect("/24 is always valid").trunc())
        .collect();
    networks = Ipv4Net::aggregate(&networks);
    while networks.len() > 1 {
        let mut widened = vec![networks[0].supernet()?];
        widened.extend_from_slice(&networks[1..]);
        networks = Ipv4Net::aggregate(&widened);
    }
    Some(networks[0])
}

fn is_private_cidr(cidr: &str) -> bool {
    match cidr.parse::<IpNet>() {
        Ok(IpNet::V4(net)) => net.addr().is_private(),
        _ => false,
    }
}

/// The IP ranges the outbound method must route through the cluster: pod
/// CIDRs, the service CIDR, and the user's `--also-proxy` targets resolved
/// inside the cluster. Pod and service ranges are cached per context.
pub async fn get_proxy_cidrs(
    runner: &Arc<Runner>,
    kube: &Kube,
    remote_info: &RemoteInfo,
    also_proxy: &[String],
) -> Result<Vec<String>, OutboundError> {
    let mut result: BTreeSet<String> = k8s_resolve(runner, kube, remote_info, also_proxy)
        .await?
        .into_iter()
        .collect();

    let cached: Option<Vec<String>> =
        runner.with_cache(|cache| cache.get(&kube.context, "podCIDRs"));
    let pod_ranges = match cached {
        Some(ranges) => ranges,
        None => {
            let ranges = pod_cidrs(runner, kube).await?;
            runner.with_cache(|cache| cache.insert(&kube.context, "podCIDRs", &ranges));
            ranges
        }
    };
    result.extend(pod_ranges);

    let cached: Option<String> =
        runner.with_cache(|cache| cache.get(&kube.context, "serviceCIDR"));
    let service_range = match cached {
        Some(range) => range,
        None => {
            let range = service_cidr(runner, kube).await?;
            runner.with_cache(|cache| cache.insert(&kube.context, "serviceCIDR", &range));
            range
        }
    };
    result.insert(service_range);

    debug!("Proxying CIDRs: {:?}", result);
    Ok(result.into_iter().collect())
}

/// Resolve `--also-proxy` targets. IPs and networks pass through; hostnames
/// are resolved inside the pod so cloud resources get their cloud-local
/// addresses. Resolved hostnames are cached per context.
pub async fn k8s_resolve(
    runner: &Arc<Runner>,
    kube: &Kube,
    remote_info: &RemoteInfo,
    targets: &[String],
) -> Result<Vec<String>, OutboundError> {
    let mut ip_ranges = Vec::new();
    let mut hostnames: Vec<String> = Vec::new();
    for target in targets {
        if let Ok(net) = target.parse::<IpNet>() {
            ip_ranges.push(net.to_string());
            continue;
        }
        if let Ok(addr) = target.parse::<IpAddr>() {
            ip_ranges.push(format!("{}/32", addr));
            continue;
        }
        let cached: Option<Vec<String>> = runner.with_cache(|cache| {
            cache.get(&kube.context, &format!("ip-list/{}", target))
        });
        match cached {
            Some(ips) => ip_ranges.extend(ips),
            None => hostnames.push(target.clone()),
        }
    }
    if hostnames.is_empty() {
        return Ok(ip_ranges);
    }

    let mut exec_args = vec![
        "exec".to_string(),
        format!("--container={}", remote_info.container_name),
        remote_info.pod_name.clone(),
        "--".to_string(),
        "telepresence-k8s-proxy".to_string(),
        "resolve".to_string(),
    ];
    exec_args.extend(hostnames.iter().cloned());
    let output = runner
        .get_output(kube.args(exec_args))
        .await
        .map_err(|exc| {
            runner.write(&exc.to_string());
            OutboundError::Fatal(format!(
                "We failed to do a DNS lookup inside Kubernetes for the hostname(s) you listed \
                 in --also-proxy ({}). Maybe you mistyped one of them?",
                targets.join(", ")
            ))
        })?;
    let resolved: Vec<Vec<String>> = serde_json::from_str(&output)?;
    for (host, ips) in hostnames.iter().zip(resolved) {
        runner.with_cache(|cache| {
            cache.insert(&kube.context, &format!("ip-list/{}", host), &ips)
        });
        ip_ranges.extend(ips);
    }
    Ok(ip_ranges)
}

/// Pod IP ranges: from node specs when exposed, otherwise the covering CIDR
/// of every pod IP we can see. Non-RFC1918 results are discarded.
pub async fn pod_cidrs(runner: &Arc<Runner>, kube: &Kube) -> Result<Vec<String>, OutboundError> {
    let mut cidrs: BTreeSet<String> = BTreeSet::new();
    match runner
        .get_output(kube.args(["get", "nodes", "-o", "json"]))
        .await
    {
        Ok(text) => {
            let nodes: Value = serde_json::from_str(&text)?;
            for node in nodes["items"].as_array().into_iter().flatten() {
                if let Some(pod_cidr) = node["spec"]["podCIDR"].as_str() {
                    cidrs.insert(pod_cidr.to_string());
                }
            }
        }
        Err(exc) => runner.write(&format!("Failed to get nodes: {}", exc)),
    }

    if cidrs.is_empty() {
        // Fall back to a covering CIDR over the pod IPs themselves.
        let text = match runner
            .get_output(kube.args(["get", "pods", "--all-namespaces", "-o", "json"]))
            .await
        {
            Ok(text) => text,
            Err(exc) => {
                runner.write(&format!("Failed to get pods for all namespaces: {}", exc));
                runner
                    .get_output(kube.args(["get", "pods", "-o", "json"]))
                    .await?
            }
        };
        let pods: Value = serde_json::from_str(&text)?;
        let pod_ips: Vec<Ipv4Addr> = pods["items"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|pod| pod["status"]["podIP"].as_str())
            .filter_map(|ip| ip.parse().ok())
            .filter(Ipv4Addr::is_private)
            .collect();
        if let Some(covering) = covering_cidr(&pod_ips) {
            cidrs.insert(covering.to_string());
        }
    }

    Ok(cidrs.into_iter().filter(|cidr| is_private_cidr(cidr)).collect())
}

/// The cluster's service IP range: the apiserver's own flag when visible,
/// otherwise a covering CIDR guessed from existing ClusterIP services.
pub async fn service_cidr(runner: &Arc<Runner>, kube: &Kube) -> Result<String, OutboundError> {
    if let Some(range) = cluster_service_cidr(runner, kube).await? {
        return Ok(range);
    }
    guess_service_cidr(runner, kube).await
}

async fn cluster_service_cidr(
    runner: &Arc<Runner>,
    kube: &Kube,
) -> Result<Option<String>, OutboundError> {
    let Ok(text) = runner
        .get_output(kube.args(["get", "pods", "-n", "kube-system", "-o", "json"]))
        .await
    else {
        return Ok(None);
    };
    let pods: Value = serde_json::from_str(&text)?;
    for pod in pods["items"].as_array().into_iter().flatten() {
        for container in pod["spec"]["containers"].as_array().into_iter().flatten() {
            if container["name"].as_str() != Some("kube-apiserver") {
                continue;
            }
            let range = container["command"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .find_map(|param| param.strip_prefix("--service-cluster-ip-range="));
            return Ok(range.map(str::to_string));
        }
    }
    Ok(None)
}

/// Guess the service range from existing ClusterIP addresses, creating
/// throwaway services first when fewer than eight exist so the sample
/// actually spans the range.
async fn guess_service_cidr(runner: &Arc<Runner>, kube: &Kube) -> Result<String, OutboundError> {
    let session_selector = format!("{}={}", SESSION_LABEL, runner.session_id());
    let mut service_ips = get_service_ips(runner, kube).await?;
    let mut new_services: Vec<String> = Vec::new();
    if service_ips.len() < 8 {
        // The throwaway services carry the session label; this cleanup is a
        // no-op in the normal flow because they are deleted right below.
        let runner_for_cleanup = runner.clone();
        let delete_args = kube.args([
            "delete".to_string(),
            "service".to_string(),
            "--ignore-not-found".to_string(),
            format!("--selector={}", session_selector),
        ]);
        runner.add_cleanup("Delete CIDR-probe services", move || async move {
            runner_for_cleanup.check_call(delete_args).await?;
            Ok(())
        });
    }
    while service_ips.len() + new_services.len() < 8 {
        let name = random_name();
        let manifest = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": name,
                "labels": {SESSION_LABEL: runner.session_id()},
            },
            "spec": {
                "type": "ClusterIP",
                "ports": [{"port": 3000, "protocol": "TCP"}],
            },
        });
        runner
            .command(kube.args(["create", "-f", "-"]))
            .input(serde_json::to_vec(&manifest)?)
            .check()
            .await?;
        new_services.push(name);
    }
    if !new_services.is_empty() {
        service_ips = get_service_ips(runner, kube).await?;
    }

    let service_cidr = covering_cidr(&service_ips).ok_or_else(|| {
        OutboundError::Fatal("No ClusterIP services found to guess the service range".to_string())
    })?;

    for name in new_services {
        runner
            .check_call(kube.args(["delete", "service", name.as_str()]))
            .await?;
    }

    if runner.chatty() {
        runner.show(&format!(
            "Guessing that Services IP range is {}. Services started after this point will \
             be inaccessible if are outside this range; restart telepresence if you can't \
             access a new Service.\n",
            service_cidr
        ));
    }
    Ok(service_cidr.to_string())
}

async fn get_service_ips(
    runner: &Arc<Runner>,
    kube: &Kube,
) -> Result<Vec<Ipv4Addr>, OutboundError> {
    let text = runner
        .get_output(kube.args(["get", "services", "-o", "json"]))
        .await?;
    let services: Value = serde_json::from_str(&text)?;
    Ok(services["items"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|svc| svc["spec"]["clusterIP"].as_str())
        .filter(|ip| *ip != "None")
        .filter_map(|ip| ip.parse().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(addresses: &[&str]) -> Vec<Ipv4Addr> {
        addresses.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[test]
    fn covering_cidr_of_one_subnet_is_a_slash_24() {
        let net = covering_cidr(&ips(&["10.0.0.5", "10.0.0.250"])).unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn covering_cidr_widens_until_everything_fits() {
        let net = covering_cidr(&ips(&["10.0.0.5", "10.0.3.4"])).unwrap();
        assert_eq!(net.to_string(), "10.0.0.0/22");
        for ip in ips(&["10.0.0.5", "10.0.3.4"]) {
            assert!(net.contains(&ip));
        }

        let net = covering_cidr(&ips(&["10.96.0.1", "10.111.255.254"])).unwrap();
        assert!(net.prefix_len() <= 24);
        for ip in ips(&["10.96.0.1", "10.111.255.254"]) {
            assert!(net.contains(&ip));
        }
        // Minimality: halving the network loses at least one input.
        let narrower = Ipv4Net::new(net.addr(), net.prefix_len() + 1).unwrap();
        assert!(ips(&["10.96.0.1", "10.111.255.254"])
            .iter()
            .any(|ip| !narrower.contains(ip)));
    }

    #[test]
    fn covering_cidr_of_nothing_is_none() {
        assert_eq!(covering_cidr(&[]), None);
    }

    #[test]
    fn private_filter_rejects_public_ranges() {
        assert!(is_private_cidr("10.23.0.0/16"));
        assert!(is_private_cidr("192.168.0.0/24"));
        assert!(!is_private_cidr("35.192.0.0/12"));
        assert!(!is_private_cidr("not-a-cidr"));
    }
}
