//! The cluster-side half of Telepresence: a SOCKSv5 server with the Tor
//! resolver extensions on TCP/9050 and a DNS repeater on UDP/9053 that
//! answers queries as a pod-local client would. Extra subcommands serve the
//! host side (`resolve`, `podinfo`) and the docker network container
//! (`proxy`, `wait`).

mod beacon;
mod dns;
mod namespace;
mod podinfo;
mod sidecar;
mod socks;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Telepresence in-cluster proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve SOCKS and DNS for a Telepresence session (the default).
    Run,
    /// Resolve hostnames as this pod sees them; prints a JSON list of
    /// address lists.
    Resolve { names: Vec<String> },
    /// Print this pod's environment and filesystem facts as JSON.
    Podinfo,
    /// Network-container mode: run sshuttle against the session tunnel.
    /// Takes the JSON config produced by the host side.
    Proxy { config: String },
    /// Wait (up to 30s) for the sibling proxy container's VPN to come up;
    /// exits 100 on success.
    Wait,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // One cooperative event loop; DNS lookups run on the blocking pool,
    // bounded so a resolution storm cannot exhaust the pod.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(50)
        .build()
        .context("failed to build runtime")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => runtime.block_on(run()),
        Commands::Resolve { names } => runtime.block_on(podinfo::resolve_names(&names)),
        Commands::Podinfo => podinfo::print_podinfo(),
        Commands::Proxy { config } => runtime.block_on(sidecar::proxy(&config)),
        Commands::Wait => runtime.block_on(sidecar::wait()),
    }
}

async fn run() -> anyhow::Result<()> {
    let namespace = namespace::resolve_namespace().context(
        "Failed to determine namespace. Enable serviceaccount access via \
         automountServiceAccountToken: true in your Deployment, or set the \
         TELEPRESENCE_CONTAINER_NAMESPACE env var directly or using the Downward API.",
    )?;
    info!("Pod's namespace is {:?}", namespace);

    let config = dns::DnsConfig::from_pod(namespace)?;
    let state = Arc::new(dns::DnsState::new(config));

    let socks_listener = tokio::net::TcpListener::bind(("0.0.0.0", 9050))
        .await
        .context("failed to bind SOCKS port 9050")?;
    let dns_socket = tokio::net::UdpSocket::bind(("0.0.0.0", 9053))
        .await
        .context("failed to bind DNS port 9053")?;

    tokio::spawn(beacon::poll_client());
    info!("Listening...");
    tokio::select! {
        result = socks::serve(socks_listener, state.clone()) => result,
        result = dns::serve(dns_socket, state) => result,
    }
}
