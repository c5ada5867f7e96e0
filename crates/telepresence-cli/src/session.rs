use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use telepresence_kube::{Kube, KubeError};
use telepresence_outbound::{LaunchContext, OutboundError, OutboundMethod};
use telepresence_proxy::{
    get_pod_info, ImageConfig, OperationKind, PortMapping, PortMappingError, ProxyError,
    ProxyIntent, ProxyOperation,
};
use telepresence_runner::{ExitReason, Runner, RunnerError};
use telepresence_ssh::SshError;
use thiserror::Error;
use tracing::info;

use crate::args::{split_deployment_container, Args, Method};
use crate::{env_files, mount};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Kube(#[from] KubeError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error(transparent)]
    Outbound(#[from] OutboundError),
    #[error("{0}")]
    Expose(#[from] PortMappingError),
    #[error("Proxy to Kubernetes exited. This is typically due to a lost connection.")]
    SessionLost,
    #[error("{0}")]
    Usage(String),
}

impl SessionError {
    /// A critical subprocess dying maps to the dedicated exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::SessionLost => 3,
            SessionError::Runner(RunnerError::BackgroundCrash { .. }) => 3,
            _ => 1,
        }
    }
}

/// Run a whole session: set up the proxy, connect, launch the user command,
/// supervise until something exits. Returns the session's exit code; the
/// caller runs cleanup regardless.
pub async fn run_session(runner: &Arc<Runner>, args: &Args) -> Result<i32, SessionError> {
    // Record basic host facts for bug reports.
    let _ = runner.check_call(["uname", "-a"]).await;

    let expose = PortMapping::parse(&args.expose)?;
    let kube = Kube::discover(runner, args.context.as_deref(), args.namespace.as_deref()).await?;
    let images = ImageConfig::from_env(env!("CARGO_PKG_VERSION"));

    let mut operation = plan_operation(runner, &kube, args, expose)?;
    operation.check_preconditions(&kube)?;

    // Preflight everything that can fail before touching the cluster.
    telepresence_ssh::check_ssh(runner).await?;
    let method: Box<dyn OutboundMethod> = match args.method() {
        Method::InjectTcp => {
            telepresence_outbound::setup_inject(runner, args.run.clone(), &args.also_proxy).await?
        }
        Method::VpnTcp => {
            telepresence_outbound::setup_vpn(runner, args.run.clone(), args.also_proxy.clone())
                .await?
        }
        Method::Container => {
            telepresence_outbound::setup_container(
                runner,
                args.docker_run.clone().unwrap_or_default(),
                &args.also_proxy,
            )
            .await?
        }
    };

    // Cluster-side mutation; restore actions land on the cleanup stack.
    let remote_info = operation.act(runner, &kube, &images).await?;

    // Tunnel to the pod.
    let is_container_mode = args.method() == Method::Container;
    let tunnel = telepresence_ssh::connect(
        runner,
        &kube,
        &remote_info,
        is_container_mode,
        &operation.intent.expose,
    )
    .await?;

    // The pod's environment and filesystem facts.
    let pod_info = get_pod_info(runner, &kube, &remote_info).await?;
    let mut env = env_files::filtered_environment(&pod_info.env, &remote_info);

    // Remote volumes.
    let mount_dir = mount::mount_remote(runner, &tunnel.ssh, &args.mount, is_container_mode).await;
    if let Some(mount_dir) = &mount_dir {
        env.insert(
            "TELEPRESENCE_ROOT".to_string(),
            mount_dir.to_string_lossy().into_owned(),
        );
        if !pod_info.mountpoints.is_empty() {
            env.insert(
                "TELEPRESENCE_MOUNTS".to_string(),
                pod_info.mountpoints.join(":"),
            );
        }
    }

    env_files::write_env_files(runner, &env, args.env_json.as_deref(), args.env_file.as_deref());

    // Outbound interception plus the user command itself.
    let ctx = LaunchContext {
        runner,
        kube: &kube,
        remote_info: &remote_info,
        env,
        socks_port: tunnel.socks_port,
        ssh: &tunnel.ssh,
        mount_dir: mount_dir.as_deref(),
        pod_info: &pod_info,
        expose: &operation.intent.expose,
    };
    let user_process = method.launch(&ctx).await?;

    let finished = Arc::new(AtomicBool::new(false));
    if method.name() != "container" {
        // The container method registers its own docker-stop cleanup.
        let pid = user_process.id().unwrap_or(0) as i32;
        telepresence_outbound::terminate_on_cleanup(runner, pid, finished.clone());
    }

    info!("Startup complete.");
    match runner.wait_for_exit(user_process).await {
        ExitReason::UserExit(code) => {
            finished.store(true, Ordering::SeqCst);
            Ok(code)
        }
        ExitReason::Signal => Ok(0),
        ExitReason::SessionLost => {
            // torsocks does not survive a lost tunnel; best we can do is
            // shut down with the evidence.
            if let Some(notice) = runner.first_crash() {
                runner.show("\n");
                runner.show(&notice);
            }
            Err(SessionError::SessionLost)
        }
    }
}

/// Turn the CLI's deployment options into a proxy operation.
fn plan_operation(
    runner: &Arc<Runner>,
    kube: &Kube,
    args: &Args,
    expose: PortMapping,
) -> Result<ProxyOperation, SessionError> {
    let (kind, argument) = if let Some(name) = &args.swap_deployment {
        (OperationKind::Swap, name.clone())
    } else if let Some(name) = &args.deployment {
        (OperationKind::Existing, name.clone())
    } else {
        (
            OperationKind::New,
            args.new_deployment.clone().expect("normalize() ran"),
        )
    };
    let (name, container) = split_deployment_container(&argument);

    // minikube/minishift capture DNS in a way that loops queries back at the
    // proxy. A proxy pod we create gets a distinct nameserver to break the
    // loop, but an existing deployment cannot be reconfigured.
    let mut env = BTreeMap::new();
    if args.method() == Method::VpnTcp && kube.in_local_vm {
        if kind == OperationKind::Existing {
            return Err(SessionError::Usage(
                "vpn-tcp method doesn't work with minikube/minishift when using --deployment. \
                 Use --swap-deployment or --new-deployment instead."
                    .to_string(),
            ));
        }
        env.insert(
            "TELEPRESENCE_NAMESERVER".to_string(),
            telepresence_outbound::alternate_nameserver()?,
        );
        runner.write("Will tell the proxy to use a distinct nameserver (local VM)");
    }

    Ok(ProxyOperation::new(
        kind,
        ProxyIntent {
            name,
            container,
            expose,
            env,
            service_account: args.serviceaccount.clone(),
        },
    ))
}
