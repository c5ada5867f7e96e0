use std::net::{IpAddr, Ipv4Addr};

use kube::config::Kubeconfig;
use telepresence_runner::{Runner, RunnerError};
use thiserror::Error;
use tracing::{debug, info};

use crate::{Kube, KubeCli};

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("Kubernetes config error: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),
    #[error("No current kubectl context; use --context to pick one")]
    NoContext,
    #[error("Context {0} not found in your kubeconfig")]
    UnknownContext(String),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("Failed to decode cluster tool output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Unable to get cluster version; is the cluster reachable?")]
    NoClusterVersion,
}

impl Kube {
    /// Probe the cluster and local tooling: context/namespace resolution from
    /// the kubeconfig, client and server versions, OpenShift detection, and
    /// whether the API server lives in a local VM.
    pub async fn discover(
        runner: &Runner,
        context_flag: Option<&str>,
        namespace_flag: Option<&str>,
    ) -> Result<Kube, KubeError> {
        runner.require(&["kubectl"], "Please install kubectl")?;

        let kubeconfig = Kubeconfig::read()?;
        let context = match context_flag {
            Some(context) => context.to_string(),
            None => kubeconfig
                .current_context
                .clone()
                .filter(|context| !context.is_empty())
                .ok_or(KubeError::NoContext)?,
        };
        let entry = kubeconfig
            .contexts
            .iter()
            .find(|named| named.name == context)
            .and_then(|named| named.context.as_ref())
            .ok_or_else(|| KubeError::UnknownContext(context.clone()))?;
        let namespace = match namespace_flag {
            Some(namespace) => namespace.to_string(),
            None => entry
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        };
        let server = kubeconfig
            .clusters
            .iter()
            .find(|named| named.name == entry.cluster)
            .and_then(|named| named.cluster.as_ref())
            .and_then(|cluster| cluster.server.clone())
            .unwrap_or_default();

        let mut kube = Kube {
            cli: KubeCli::Kubectl,
            context,
            namespace,
            server,
            client_version: String::new(),
            cluster_version: String::new(),
            cluster_is_openshift: false,
            in_local_vm: false,
        };

        let version_text = runner
            .get_output(kube.args(["version", "-o", "json"]))
            .await
            .map_err(|_| KubeError::NoClusterVersion)?;
        let version: serde_json::Value = serde_json::from_str(&version_text)?;
        kube.client_version = version["clientVersion"]["gitVersion"]
            .as_str()
            .unwrap_or("(unknown)")
            .to_string();
        kube.cluster_version = version["serverVersion"]["gitVersion"]
            .as_str()
            .ok_or(KubeError::NoClusterVersion)?
            .to_string();

        // The cluster CLI carries the cluster CA, so the probe is a plain
        // authenticated GET; any successful response means OpenShift.
        kube.cluster_is_openshift = runner
            .command(kube.args(["get", "--raw", "/version/openshift"]))
            .check()
            .await
            .is_ok();
        if kube.cluster_is_openshift && which::which("oc").is_ok() {
            kube.cli = KubeCli::Oc;
        }

        kube.in_local_vm = server_in_local_vm(&kube.server).await;

        info!(
            "Context: {}, namespace: {}, kubectl_command: {}",
            kube.context,
            kube.namespace,
            kube.cli.as_str()
        );
        debug!(
            "Server: {} (client {}, cluster {}, openshift: {}, local VM: {})",
            kube.server,
            kube.client_version,
            kube.cluster_version,
            kube.cluster_is_openshift,
            kube.in_local_vm
        );
        Ok(kube)
    }
}

/// Extract the host portion of an API server URL.
fn server_host(server: &str) -> Option<&str> {
    let rest = server.split("://").nth(1).unwrap_or(server);
    let rest = rest.split('/').next()?;
    if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal.
        return stripped.split(']').next();
    }
    let host = rest.rsplit_once(':').map_or(rest, |(host, _)| host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn is_local_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Does the API server URL point into a private or loopback network, i.e. a
/// minikube/minishift-style VM on this machine?
async fn server_in_local_vm(server: &str) -> bool {
    let Some(host) = server_host(server) else {
        return false;
    };
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        return is_local_address(IpAddr::V4(v4));
    }
    match tokio::net::lookup_host((host, 443)).await {
        Ok(mut addrs) => addrs.any(|addr| is_local_address(addr.ip())),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_host_handles_scheme_port_and_path() {
        assert_eq!(server_host("https://192.168.49.2:8443"), Some("192.168.49.2"));
        assert_eq!(server_host("https://api.example.com"), Some("api.example.com"));
        assert_eq!(
            server_host("https://api.example.com:6443/path"),
            Some("api.example.com")
        );
        assert_eq!(server_host("https://[::1]:6443"), Some("::1"));
    }

    #[tokio::test]
    async fn minikube_style_servers_count_as_local() {
        assert!(server_in_local_vm("https://192.168.49.2:8443").await);
        assert!(server_in_local_vm("https://127.0.0.1:6443").await);
        assert!(!server_in_local_vm("https://35.184.11.202:443").await);
    }
}
