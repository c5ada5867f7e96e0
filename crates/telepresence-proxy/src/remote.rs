use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use telepresence_runner::Runner;
use tracing::info;

use crate::{ImageConfig, ProxyError};
use telepresence_kube::Kube;

/// A namespaced object name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdent {
    pub namespace: String,
    pub name: String,
}

/// The live proxy target: which pod we talk to and which container in it
/// runs the proxy image.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub deployment: ResourceIdent,
    pub pod_name: String,
    pub container_name: String,
    pub image: String,
}

impl RemoteInfo {
    /// The version the remote proxy is running, from its image tag.
    pub fn remote_version(&self) -> &str {
        self.image.rsplit(':').next().unwrap_or("")
    }

    /// Dump the pod description into the log, for post-mortems.
    pub async fn probe(&self, runner: &Runner, kube: &Kube) {
        let _ = runner
            .command(kube.args(["describe", "pod", self.pod_name.as_str()]))
            .timeout(Duration::from_secs(10))
            .check()
            .await;
    }
}

fn proxy_container(
    containers: &serde_json::Value,
    images: &ImageConfig,
) -> Option<(String, String)> {
    containers.as_array()?.iter().find_map(|container| {
        let image = container["image"].as_str()?;
        if images.is_proxy_image(image) {
            Some((container["name"].as_str()?.to_string(), image.to_string()))
        } else {
            None
        }
    })
}

/// The pod's container image tag must match this client's version exactly;
/// anything else is fatal.
fn check_version(remote_info: &RemoteInfo, images: &ImageConfig) -> Result<(), ProxyError> {
    let remote = remote_info.remote_version();
    if remote != images.version() {
        return Err(ProxyError::VersionMismatch {
            remote: remote.to_string(),
            local: images.version().to_string(),
        });
    }
    Ok(())
}

/// Wait for the pod to be `Running` with the proxy container ready.
pub async fn wait_for_pod(
    runner: &Runner,
    kube: &Kube,
    remote_info: &RemoteInfo,
) -> Result<(), ProxyError> {
    let mut last_phase = "unknown".to_string();
    let mut ticker = runner.loop_until(Duration::from_secs(120), Duration::from_millis(250));
    while ticker.next().await?.is_some() {
        let Ok(text) = runner
            .get_output(kube.args(["get", "pod", remote_info.pod_name.as_str(), "-o", "json"]))
            .await
        else {
            continue;
        };
        let Ok(pod) = serde_json::from_str::<Pod>(&text) else {
            continue;
        };
        let status = pod.status.unwrap_or_default();
        last_phase = status.phase.unwrap_or_else(|| "unknown".to_string());
        if last_phase != "Running" {
            continue;
        }
        let ready = status
            .container_statuses
            .unwrap_or_default()
            .iter()
            .any(|container| container.name == remote_info.container_name && container.ready);
        if ready {
            return Ok(());
        }
    }
    Err(ProxyError::PodNotReady(last_phase))
}

/// Locate the proxy pod backing a Deployment (or DeploymentConfig) and
/// return a verified [`RemoteInfo`] once the pod is running.
///
/// `run_id` is set for objects this session created; the pod is then found
/// by the session-label selector. Otherwise the deployment name has to do.
pub async fn get_remote_info(
    runner: &Runner,
    kube: &Kube,
    images: &ImageConfig,
    deployment_name: &str,
    deployment_kind: &str,
    run_id: Option<&str>,
) -> Result<RemoteInfo, ProxyError> {
    let deployment = fetch_deployment(runner, kube, deployment_name, deployment_kind, run_id)
        .await?;
    let expected_labels: BTreeMap<String, String> = deployment["spec"]["template"]["metadata"]
        ["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default();

    runner.write("Searching for Telepresence pod:");
    runner.write(&format!("  with name {}-*", deployment_name));
    runner.write(&format!("  with labels {:?}", expected_labels));

    let mut list_args = vec!["get".to_string(), "pod".to_string()];
    if let Some(run_id) = run_id {
        list_args.push(format!("--selector={}={}", crate::SESSION_LABEL, run_id));
    }
    list_args.extend(["-o".to_string(), "json".to_string()]);

    let mut ticker = runner.loop_until(Duration::from_secs(120), Duration::from_secs(1));
    while ticker.next().await?.is_some() {
        let text = runner.get_output(kube.args(list_args.clone())).await?;
        let pods: k8s_openapi::List<Pod> = serde_json::from_str(&text)?;
        for pod in pods.items {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let phase = pod
                .status
                .as_ref()
                .and_then(|status| status.phase.clone())
                .unwrap_or_default();
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            runner.write(&format!("Checking {}", name));
            if !name.starts_with(&format!("{}-", deployment_name)) {
                runner.write("--> Name does not match");
                continue;
            }
            if phase != "Pending" && phase != "Running" {
                runner.write(&format!("--> Wrong phase: {}", phase));
                continue;
            }
            if !expected_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
            {
                runner.write(&format!("--> Labels don't match: {:?}", labels));
                continue;
            }

            info!("Found proxy pod {}", name);
            let (container_name, image) = proxy_container(
                &deployment["spec"]["template"]["spec"]["containers"],
                images,
            )
            .ok_or_else(|| {
                ProxyError::Invalid(format!(
                    "Could not find a proxy-image container in pod {}.",
                    name
                ))
            })?;
            let remote_info = RemoteInfo {
                deployment: ResourceIdent {
                    namespace: kube.namespace.clone(),
                    name: deployment_name.to_string(),
                },
                pod_name: name,
                container_name,
                image,
            };
            check_version(&remote_info, images)?;
            wait_for_pod(runner, kube, &remote_info).await?;
            return Ok(remote_info);
        }
    }
    Err(ProxyError::PodNotReady(format!(
        "no pod found for {} {}",
        deployment_kind, deployment_name
    )))
}

/// The new-pod operation creates the pod directly, so the pod is located by
/// its own name rather than through a Deployment.
pub async fn remote_info_for_pod(
    runner: &Runner,
    kube: &Kube,
    images: &ImageConfig,
    pod_name: &str,
) -> Result<RemoteInfo, ProxyError> {
    let mut remote_info = None;
    let mut ticker = runner.loop_until(Duration::from_secs(120), Duration::from_secs(1));
    while ticker.next().await?.is_some() {
        let Ok(text) = runner
            .get_output(kube.args(["get", "pod", pod_name, "-o", "json"]))
            .await
        else {
            continue;
        };
        let pod: serde_json::Value = serde_json::from_str(&text)?;
        if let Some((container_name, image)) =
            proxy_container(&pod["spec"]["containers"], images)
        {
            remote_info = Some(RemoteInfo {
                deployment: ResourceIdent {
                    namespace: kube.namespace.clone(),
                    name: pod_name.to_string(),
                },
                pod_name: pod_name.to_string(),
                container_name,
                image,
            });
            break;
        }
    }
    let remote_info = remote_info.ok_or_else(|| {
        ProxyError::Invalid(format!(
            "Could not find a proxy-image container in pod {}.",
            pod_name
        ))
    })?;
    check_version(&remote_info, images)?;
    wait_for_pod(runner, kube, &remote_info).await?;
    Ok(remote_info)
}

async fn fetch_deployment(
    runner: &Runner,
    kube: &Kube,
    deployment_name: &str,
    deployment_kind: &str,
    run_id: Option<&str>,
) -> Result<serde_json::Value, ProxyError> {
    let args: Vec<String> = match run_id {
        // Objects we created are found by selector; that returns a list.
        Some(run_id) => vec![
            "get".to_string(),
            deployment_kind.to_string(),
            format!("--selector={}={}", crate::SESSION_LABEL, run_id),
            "-o".to_string(),
            "json".to_string(),
        ],
        None => vec![
            "get".to_string(),
            deployment_kind.to_string(),
            deployment_name.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ],
    };
    let text = runner.get_output(kube.args(args)).await.map_err(|exc| {
        ProxyError::ResourceNotFound {
            kind: "deployment",
            name: deployment_name.to_string(),
            output: exc.command_output().unwrap_or("").to_string(),
        }
    })?;
    let decoded: serde_json::Value = serde_json::from_str(&text)?;
    if run_id.is_some() {
        let item = decoded["items"][0].clone();
        if item.is_null() {
            return Err(ProxyError::ResourceNotFound {
                kind: "deployment",
                name: deployment_name.to_string(),
                output: "empty selector result".to_string(),
            });
        }
        Ok(item)
    } else {
        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn images() -> ImageConfig {
        ImageConfig::from_env("0.109")
    }

    #[test]
    fn remote_version_is_the_image_tag() {
        let info = RemoteInfo {
            deployment: ResourceIdent {
                namespace: "default".to_string(),
                name: "hello".to_string(),
            },
            pod_name: "hello-abc".to_string(),
            container_name: "hello".to_string(),
            image: "datawire/telepresence-k8s:0.109".to_string(),
        };
        assert_eq!(info.remote_version(), "0.109");
        assert!(check_version(&info, &images()).is_ok());

        let stale = RemoteInfo {
            image: "datawire/telepresence-k8s:0.42".to_string(),
            ..info
        };
        assert!(matches!(
            check_version(&stale, &images()),
            Err(ProxyError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn proxy_container_skips_user_containers() {
        let containers = json!([
            {"name": "app", "image": "nginx:latest"},
            {"name": "proxy", "image": "datawire/telepresence-k8s:0.109"},
        ]);
        let (name, image) = proxy_container(&containers, &images()).unwrap();
        assert_eq!(name, "proxy");
        assert_eq!(image, "datawire/telepresence-k8s:0.109");
    }
}
