//! The authenticated tunnel between the workstation and the proxy pod:
//! `kubectl port-forward` to the pod's SSH listener, an `ssh` client on top
//! of it, and the port-forward primitives layered over that.

mod beacon;
mod connect;
mod expose;
mod ssh;

pub use beacon::launch_local_server;
pub use connect::{check_ssh, connect, Tunnel, MAC_LOOPBACK_IP};
pub use expose::expose_local_services;
pub use ssh::Ssh;

use telepresence_runner::RunnerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("SSH to the cluster failed to start. See logfile.")]
    SshNotStarting,
    #[error("Failed to start the liveness server: {0}")]
    Beacon(std::io::Error),
    #[error("No address found for the {0} interface")]
    MissingInterface(String),
    #[error("'ssh' is not the OpenSSH client, apparently.")]
    NotOpenSsh,
}

/// Find a local port that isn't in use. Racy by nature; the listener is
/// closed before the port is handed to a subprocess.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
