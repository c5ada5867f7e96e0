use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use telepresence_kube::{Kube, KubeCli};
use telepresence_runner::Runner;
use tracing::debug;

use crate::deployment::{
    container_name, merge_container_ports, new_swapped_deployment, swapped_deployment_name,
};
use crate::manifest::{manifest_list, proxy_pod, proxy_service};
use crate::remote::{get_remote_info, remote_info_for_pod};
use crate::{ImageConfig, PortMapping, ProxyError, RemoteInfo, SESSION_LABEL};

/// Which cluster-side mutation establishes the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Create a fresh proxy Pod (and Service when ports are exposed).
    New,
    /// Use a proxy Deployment that is already running; no mutation.
    Existing,
    /// Replace an existing Deployment/DeploymentConfig with a proxy sibling.
    Swap,
}

/// The declarative description of the proxy to establish.
#[derive(Debug, Clone)]
pub struct ProxyIntent {
    pub name: String,
    pub container: Option<String>,
    pub expose: PortMapping,
    /// Extra env entries for the proxy container (e.g. a distinct nameserver
    /// to break DNS loops on local VMs).
    pub env: BTreeMap<String, String>,
    pub service_account: Option<String>,
}

pub struct ProxyOperation {
    pub kind: OperationKind,
    pub intent: ProxyIntent,
}

impl ProxyOperation {
    pub fn new(kind: OperationKind, intent: ProxyIntent) -> ProxyOperation {
        ProxyOperation { kind, intent }
    }

    /// Refuse combinations the cluster cannot serve.
    pub fn check_preconditions(&self, kube: &Kube) -> Result<(), ProxyError> {
        if self.intent.expose.has_privileged_ports() && kube.cli == KubeCli::Oc {
            return Err(ProxyError::OpenShiftPrivilegedPorts);
        }
        Ok(())
    }

    /// Apply the mutation and return the live proxy target. Restore actions
    /// are registered on the Runner's cleanup stack as soon as the
    /// corresponding cluster state exists, so a failure part-way through
    /// still unwinds completely.
    pub async fn act(
        &mut self,
        runner: &Arc<Runner>,
        kube: &Kube,
        images: &ImageConfig,
    ) -> Result<RemoteInfo, ProxyError> {
        match self.kind {
            OperationKind::New => self.create_new(runner, kube, images).await,
            OperationKind::Existing => self.use_existing(runner, kube, images).await,
            OperationKind::Swap => {
                if dc_exists(runner, kube, &self.intent.name).await {
                    self.swap_deployment_config(runner, kube, images).await
                } else {
                    self.swap_deployment(runner, kube, images).await
                }
            }
        }
    }

    async fn create_new(
        &mut self,
        runner: &Arc<Runner>,
        kube: &Kube,
        images: &ImageConfig,
    ) -> Result<RemoteInfo, ProxyError> {
        let name = self.intent.name.clone();
        let run_id = runner.session_id().to_string();
        runner.show(&format!(
            "Starting network proxy to cluster using new proxy Pod {}",
            name
        ));

        let delete_args = kube.args([
            "delete".to_string(),
            "--ignore-not-found".to_string(),
            "svc,pod".to_string(),
            format!("--selector={}={}", SESSION_LABEL, run_id),
        ]);
        // Clear any leftovers from a previous half-cleaned session.
        runner.check_call(delete_args.clone()).await?;
        {
            let runner = runner.clone();
            let delete_args = delete_args.clone();
            runner.clone().add_cleanup("Delete new proxy pod", move || async move {
                runner.check_call(delete_args).await?;
                Ok(())
            });
        }

        let mut warn = |message: String| runner.show(&message);
        let image = images.select(&self.intent.expose, kube.cluster_is_openshift, &mut warn);
        let pod = proxy_pod(
            &name,
            &run_id,
            &image,
            &self.intent.env,
            self.intent.service_account.as_deref(),
        );
        let remote_ports: Vec<u16> = self.intent.expose.remote().into_iter().collect();
        let service = (!remote_ports.is_empty())
            .then(|| proxy_service(&name, &run_id, &remote_ports));
        let manifests = manifest_list(&pod, service.as_ref());
        runner
            .command(kube.args(["create", "-f", "-"]))
            .input(serde_json::to_vec(&manifests)?)
            .check()
            .await
            .map_err(|exc| {
                ProxyError::Invalid(format!(
                    "Failed to create proxy pod {}:\n{}",
                    name,
                    exc.command_output().unwrap_or("")
                ))
            })?;

        remote_info_for_pod(runner, kube, images, &name).await
    }

    async fn use_existing(
        &mut self,
        runner: &Arc<Runner>,
        kube: &Kube,
        images: &ImageConfig,
    ) -> Result<RemoteInfo, ProxyError> {
        let name = self.intent.name.clone();
        let kind = if dc_exists(runner, kube, &name).await {
            "deploymentconfig"
        } else {
            "deployment"
        };
        runner.show(&format!(
            "Starting network proxy to cluster using the existing proxy {} {}",
            kind, name
        ));
        let deployment = kube
            .get_json(runner, &[kind, name.as_str()])
            .await
            .map_err(|exc| ProxyError::Invalid(format!("Failed to find {} {}: {}", kind, name, exc)))?;
        let container = container_name(&deployment, self.intent.container.as_deref())?;
        if let Some(spec) = deployment["spec"]["template"]["spec"]["containers"]
            .as_array()
            .and_then(|containers| {
                containers
                    .iter()
                    .find(|c| c["name"].as_str() == Some(container.as_str()))
            })
        {
            merge_container_ports(&mut self.intent.expose, spec);
        }
        get_remote_info(runner, kube, images, &name, kind, None).await
    }

    async fn swap_deployment(
        &mut self,
        runner: &Arc<Runner>,
        kube: &Kube,
        images: &ImageConfig,
    ) -> Result<RemoteInfo, ProxyError> {
        let name = self.intent.name.clone();
        let run_id = runner.session_id().to_string();
        runner.show(&format!(
            "Starting network proxy to cluster by swapping out Deployment {} with a proxy",
            name
        ));

        let deployment = kube.get_json(runner, &["deployment", name.as_str()]).await.map_err(
            |exc| ProxyError::Invalid(format!("Failed to find deployment {}: {}", name, exc)),
        )?;
        let container = container_name(&deployment, self.intent.container.as_deref())?;
        let mut warn = |message: String| runner.show(&message);
        let image = images.select(&self.intent.expose, kube.cluster_is_openshift, &mut warn);
        let mut swapped = new_swapped_deployment(
            &deployment,
            &container,
            &run_id,
            &image,
            &mut self.intent.expose,
            &self.intent.env,
            self.intent.service_account.as_deref(),
        )?;
        let new_name = swapped_deployment_name(&name, &run_id);
        swapped["metadata"]["name"] = json!(new_name);
        debug!("Swapped deployment will be named {}", new_name);

        // Delete any stale sibling, then keep a deletion registered for exit.
        runner
            .check_call(kube.args([
                "delete",
                "deployment",
                new_name.as_str(),
                "--ignore-not-found",
            ]))
            .await?;
        {
            let runner_for_cleanup = runner.clone();
            let kube = kube.clone();
            let display_name = name.clone();
            let new_name = new_name.clone();
            runner.add_cleanup("Delete swapped deployment", move || async move {
                runner_for_cleanup.show(&format!(
                    "Swapping Deployment {} back to its original state",
                    display_name
                ));
                runner_for_cleanup
                    .check_call(kube.args(["delete", "deployment", new_name.as_str()]))
                    .await?;
                Ok(())
            });
        }
        runner
            .command(kube.args(["apply", "-f", "-"]))
            .input(serde_json::to_vec(&swapped)?)
            .check()
            .await
            .map_err(|exc| {
                ProxyError::Invalid(format!(
                    "Failed to create swapped deployment:\n{}",
                    exc.command_output().unwrap_or("")
                ))
            })?;

        // Scale the original down, restoring its replica count on exit.
        let replicas = deployment["spec"]["replicas"].as_u64().unwrap_or(1);
        {
            let runner_for_cleanup = runner.clone();
            let kube = kube.clone();
            let name = name.clone();
            runner.add_cleanup("Re-scale original deployment", move || async move {
                runner_for_cleanup
                    .check_call(kube.args([
                        "scale".to_string(),
                        "deployment".to_string(),
                        name,
                        format!("--replicas={}", replicas),
                    ]))
                    .await?;
                Ok(())
            });
        }
        runner
            .check_call(kube.args([
                "scale".to_string(),
                "deployment".to_string(),
                name.clone(),
                "--replicas=0".to_string(),
            ]))
            .await?;

        get_remote_info(runner, kube, images, &new_name, "deployment", Some(&run_id)).await
    }

    /// OpenShift swap: DeploymentConfigs revert image changes through their
    /// triggers, so the triggers are snapshotted and stripped first, and the
    /// saved config (triggers included) is re-applied on exit.
    async fn swap_deployment_config(
        &mut self,
        runner: &Arc<Runner>,
        kube: &Kube,
        images: &ImageConfig,
    ) -> Result<RemoteInfo, ProxyError> {
        let name = self.intent.name.clone();
        let run_id = runner.session_id().to_string();
        runner.show(&format!(
            "Starting network proxy to cluster by swapping out DeploymentConfig {} with a proxy",
            name
        ));

        let snapshot = get_dc_json(runner, kube, &name).await?;
        runner
            .check_call(kube.args([
                "set".to_string(),
                "triggers".to_string(),
                format!("dc/{}", name),
                "--remove-all".to_string(),
            ]))
            .await?;
        {
            // The triggers are already gone; from here on every exit path
            // must put the saved config back.
            let runner_for_cleanup = runner.clone();
            let kube = kube.clone();
            let name = name.clone();
            let snapshot = snapshot.clone();
            runner.add_cleanup("Restore original deployment config", move || async move {
                apply_dc_json(&runner_for_cleanup, &kube, &name, &snapshot).await
            });
        }
        let dc = get_dc_json(runner, kube, &name).await?;

        let container = container_name(&dc, self.intent.container.as_deref())?;
        let mut warn = |message: String| runner.show(&message);
        let image = images.select(&self.intent.expose, kube.cluster_is_openshift, &mut warn);
        let swapped = new_swapped_deployment(
            &dc,
            &container,
            &run_id,
            &image,
            &mut self.intent.expose,
            &self.intent.env,
            self.intent.service_account.as_deref(),
        )?;
        apply_dc_json(runner, kube, &name, &swapped).await?;

        get_remote_info(runner, kube, images, &name, "deploymentconfig", Some(&run_id)).await
    }
}

/// Is there an OpenShift DeploymentConfig with this name? Only meaningful
/// when driving the cluster with `oc`.
async fn dc_exists(runner: &Arc<Runner>, kube: &Kube, name: &str) -> bool {
    if kube.cli != KubeCli::Oc {
        return false;
    }
    runner
        .check_call(kube.args(["get".to_string(), format!("dc/{}", name)]))
        .await
        .is_ok()
}

/// Fetch a DeploymentConfig. Old cluster tools accepted `--export` to strip
/// server-owned fields; newer ones removed the flag, so probe and fall back.
async fn get_dc_json(
    runner: &Arc<Runner>,
    kube: &Kube,
    name: &str,
) -> Result<serde_json::Value, ProxyError> {
    let with_export = kube.args([
        "get".to_string(),
        format!("dc/{}", name),
        "-o".to_string(),
        "json".to_string(),
        "--export".to_string(),
    ]);
    match runner.command(with_export).capture().await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(exc) => {
            let unknown_flag = exc
                .command_output()
                .is_some_and(|output| output.contains("unknown flag"));
            if !unknown_flag {
                return Err(ProxyError::ResourceNotFound {
                    kind: "deploymentconfig",
                    name: name.to_string(),
                    output: exc.command_output().unwrap_or("").to_string(),
                });
            }
            let text = runner
                .get_output(kube.args([
                    "get".to_string(),
                    format!("dc/{}", name),
                    "-o".to_string(),
                    "json".to_string(),
                ]))
                .await?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

async fn apply_dc_json(
    runner: &Arc<Runner>,
    kube: &Kube,
    name: &str,
    config: &serde_json::Value,
) -> Result<(), telepresence_runner::RunnerError> {
    runner
        .command(kube.args(["replace", "-f", "-"]))
        .input(serde_json::to_vec(config).map_err(|exc| {
            telepresence_runner::RunnerError::Fatal(format!(
                "Failed to encode deployment config: {}",
                exc
            ))
        })?)
        .check()
        .await?;
    // Replacing the config is not enough; roll out the new version and wait.
    runner
        .check_call(kube.args([
            "rollout".to_string(),
            "latest".to_string(),
            format!("dc/{}", name),
        ]))
        .await?;
    runner
        .check_call(kube.args([
            "rollout".to_string(),
            "status".to_string(),
            "-w".to_string(),
            format!("dc/{}", name),
        ]))
        .await?;
    Ok(())
}
