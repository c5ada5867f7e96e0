//! Cluster-side proxy setup: install, reuse, or swap a proxy pod into the
//! cluster, and describe the live proxy target.

mod deployment;
mod image;
mod manifest;
mod mapping;
mod operation;
mod podinfo;
mod remote;

pub use deployment::{
    container_name, merge_container_ports, new_swapped_deployment, swapped_deployment_name,
};
pub use image::ImageConfig;
pub use mapping::{PortMapping, PortMappingError};
pub use operation::{OperationKind, ProxyIntent, ProxyOperation};
pub use podinfo::{get_pod_info, PodInfo};
pub use remote::{wait_for_pod, RemoteInfo, ResourceIdent};

use telepresence_runner::RunnerError;
use thiserror::Error;

/// The label applied to every cluster object a session creates. Cleanup is
/// always by `telepresence=<session-id>` selector, never by name list.
pub const SESSION_LABEL: &str = "telepresence";

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("Failed to decode cluster response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Failed to find {kind} {name}:\n{output}")]
    ResourceNotFound {
        kind: &'static str,
        name: String,
        output: String,
    },
    #[error("Couldn't find container {0} in the Deployment.")]
    MissingContainer(String),
    #[error("Proxy pod isn't starting or can't be found: {0}")]
    PodNotReady(String),
    #[error(
        "The remote proxy container is running version {remote}, but this tool is \
         version {local}. Please make sure both are running the same version."
    )]
    VersionMismatch { remote: String, local: String },
    #[error("OpenShift does not support ports <1024.")]
    OpenShiftPrivilegedPorts,
    #[error("{0}")]
    Invalid(String),
}
