//! Outbound interception: how the user's local process sees the cluster
//! network. Three methods exist behind one trait: per-process SOCKS preload
//! (inject-tcp), workstation-wide firewall redirect (vpn-tcp), and docker
//! network namespace sharing (container).

pub mod cidr;
mod container;
mod docker;
mod inject;
mod launch;
mod vpn;
mod workarounds;

pub use inject::run_connect_probe;
pub use launch::{spawn_user_process, terminate_on_cleanup};
pub use vpn::alternate_nameserver;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use telepresence_kube::Kube;
use telepresence_proxy::{PodInfo, PortMapping, RemoteInfo};
use telepresence_runner::{Runner, RunnerError};
use telepresence_ssh::Ssh;
use thiserror::Error;
use tokio::process::Child;

#[derive(Error, Debug)]
pub enum OutboundError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Ssh(#[from] telepresence_ssh::SshError),
    #[error("Failed to decode output: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0}")]
    Fatal(String),
}

/// Everything an outbound method needs to launch the user command.
pub struct LaunchContext<'a> {
    pub runner: &'a Arc<Runner>,
    pub kube: &'a Kube,
    pub remote_info: &'a RemoteInfo,
    /// The pod's (filtered) environment plus the TELEPRESENCE_* additions.
    pub env: HashMap<String, String>,
    pub socks_port: u16,
    pub ssh: &'a Ssh,
    pub mount_dir: Option<&'a Path>,
    pub pod_info: &'a PodInfo,
    pub expose: &'a PortMapping,
}

#[async_trait]
pub trait OutboundMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Set up interception and start the user command; returns the process
    /// whose exit ends the session.
    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Child, OutboundError>;
}

/// A DNS-safe random name for throwaway cluster and docker objects.
pub fn random_name() -> String {
    format!("telepresence-{:08x}-{}", rand::random::<u32>(), std::process::id())
}

fn check_local_command(runner: &Runner, command: &str) -> Result<(), OutboundError> {
    if !runner.depend(&[command]).is_empty() {
        return Err(OutboundError::Fatal(format!("{}: command not found", command)));
    }
    Ok(())
}

struct InjectTcp {
    /// `torsocks` plus the user command.
    command: Vec<String>,
}

#[async_trait]
impl OutboundMethod for InjectTcp {
    fn name(&self) -> &'static str {
        "inject-tcp"
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Child, OutboundError> {
        let runner = ctx.runner;
        let original_path = std::env::var("PATH").unwrap_or_default();
        // DNS is not proxied under inject-tcp, so the DNS tools get stubs.
        let adjusted_path = workarounds::apply_workarounds(runner, &original_path, true)?;
        let mut env = inject::user_environment(&ctx.kube.context, &ctx.env, &adjusted_path);
        inject::setup_torsocks(runner, &mut env, ctx.socks_port).await?;
        spawn_user_process(&self.command, &env)
    }
}

struct VpnTcp {
    command: Vec<String>,
    also_proxy: Vec<String>,
}

#[async_trait]
impl OutboundMethod for VpnTcp {
    fn name(&self) -> &'static str {
        "vpn-tcp"
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Child, OutboundError> {
        let runner = ctx.runner;
        let original_path = std::env::var("PATH").unwrap_or_default();
        let adjusted_path = workarounds::apply_workarounds(runner, &original_path, false)?;
        let env = inject::user_environment(&ctx.kube.context, &ctx.env, &adjusted_path);
        vpn::connect_sshuttle(runner, ctx.kube, ctx.remote_info, &self.also_proxy, ctx.ssh)
            .await?;
        spawn_user_process(&self.command, &env)
    }
}

struct ContainerMethod {
    docker: docker::Docker,
    docker_run: Vec<String>,
}

#[async_trait]
impl OutboundMethod for ContainerMethod {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Child, OutboundError> {
        container::run_docker_command(ctx, self.docker, &self.docker_run).await
    }
}

/// Build the inject-tcp method: verify torsocks and the user command exist
/// and explain the method's limitations.
pub async fn setup_inject(
    runner: &Arc<Runner>,
    run: Option<Vec<String>>,
    also_proxy: &[String],
) -> Result<Box<dyn OutboundMethod>, OutboundError> {
    let mut command = vec!["torsocks".to_string()];
    command.extend(run.unwrap_or_else(default_shell));
    check_local_command(runner, &command[1])?;
    runner.require(&["torsocks"], "Please install torsocks (v2.1 or later)")?;
    if runner.chatty() {
        runner.show(
            "Starting proxy with method 'inject-tcp', which has the following limitations: \
             Go programs, static binaries, suid programs, and custom DNS implementations \
             are not supported. For a full list of method limitations see \
             https://telepresence.io/reference/methods.html",
        );
    }
    if !also_proxy.is_empty() {
        runner.show(
            "Note: --also-proxy is not meaningful with -m inject-tcp. The inject-tcp method \
             sends all network traffic to the cluster.",
        );
    }
    Ok(Box::new(InjectTcp { command }))
}

/// Build the vpn-tcp method: verify sshuttle and the firewall tooling, then
/// grab (and hold) sudo.
pub async fn setup_vpn(
    runner: &Arc<Runner>,
    run: Option<Vec<String>>,
    also_proxy: Vec<String>,
) -> Result<Box<dyn OutboundMethod>, OutboundError> {
    let command = run.unwrap_or_else(default_shell);
    check_local_command(runner, &command[0])?;
    runner.require(&["sshuttle"], "Please install sshuttle (v0.78 or later)")?;
    match runner.platform() {
        telepresence_runner::Platform::Linux => {
            runner.require(
                &["conntrack", "iptables"],
                "Required for the vpn-tcp method",
            )?;
        }
        telepresence_runner::Platform::MacOs => {
            runner.require(&["pfctl"], "Required for the vpn-tcp method")?;
        }
    }
    runner.require_sudo().await?;
    if runner.platform() == telepresence_runner::Platform::Linux {
        // Quick iptables sanity check, post sudo.
        if let Err(exc) = runner
            .command(["sudo", "iptables", "--list"])
            .capture()
            .await
        {
            runner.show("Quick test of iptables failed:");
            runner.show(&format!("  {}", exc));
            runner.show(
                "The vpn-tcp method requires the use of iptables. If you're running \
                 Telepresence in a container, add network capabilities (docker run ... \
                 --cap-add=NET_ADMIN --cap-add=NET_BIND_SERVICE ...) or use a privileged \
                 container (docker run ... --privileged ...).",
            );
            return Err(OutboundError::Fatal("Unable to use iptables".to_string()));
        }
    }
    if runner.chatty() {
        runner.show(
            "Starting proxy with method 'vpn-tcp', which has the following limitations: \
             All processes are affected, only one telepresence can run per machine, and \
             you can't use other VPNs. You may need to add cloud hosts and headless \
             services with --also-proxy. For a full list of method limitations see \
             https://telepresence.io/reference/methods.html",
        );
    }
    Ok(Box::new(VpnTcp {
        command,
        also_proxy,
    }))
}

/// Build the container method: docker present, daemon local.
pub async fn setup_container(
    runner: &Arc<Runner>,
    docker_run: Vec<String>,
    also_proxy: &[String],
) -> Result<Box<dyn OutboundMethod>, OutboundError> {
    let docker = docker::require_docker(runner).await?;
    docker::check_local_docker(runner, docker).await?;
    if !also_proxy.is_empty() {
        runner.show(
            "Note: --also-proxy is no longer required with --docker-run. The container \
             method sends all network traffic to the cluster.",
        );
    }
    Ok(Box::new(ContainerMethod { docker, docker_run }))
}

fn default_shell() -> Vec<String> {
    vec!["bash".to_string(), "--norc".to_string()]
}
