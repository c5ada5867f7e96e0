use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use telepresence_runner::Runner;

use crate::{ProxyError, RemoteInfo};
use telepresence_kube::Kube;

/// What the in-pod helper reports about the proxy pod: its environment and
/// the bits of filesystem state that have to be replicated locally.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodInfo {
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub resolv: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub mountpoints: Vec<String>,
}

/// Read the pod's environment and filesystem facts by exec-ing the in-pod
/// helper. The SSH proxies may take a few seconds to settle, so retry for
/// up to ten seconds.
pub async fn get_pod_info(
    runner: &Runner,
    kube: &Kube,
    remote_info: &RemoteInfo,
) -> Result<PodInfo, ProxyError> {
    let exec_args = kube.args([
        "exec",
        remote_info.pod_name.as_str(),
        "--container",
        remote_info.container_name.as_str(),
        "--",
        "telepresence-k8s-proxy",
        "podinfo",
    ]);
    let mut last_error = None;
    let mut ticker = runner.loop_until(Duration::from_secs(10), Duration::from_millis(250));
    while ticker.next().await?.is_some() {
        match runner.command(exec_args.clone()).capture().await {
            Ok(output) => return Ok(serde_json::from_str(&output)?),
            Err(exc) => last_error = Some(exc),
        }
    }
    Err(ProxyError::Invalid(format!(
        "Error: Failed to get environment variables: {}",
        last_error.map(|exc| exc.to_string()).unwrap_or_default()
    )))
}
