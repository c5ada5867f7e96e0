//! A thin typed wrapper over the cluster command-line tool.
//!
//! Cluster I/O goes through `kubectl` (or `oc` on OpenShift) subprocesses
//! composed by [`Kube::args`]; responses are always requested as JSON. The
//! local kubeconfig is only read to resolve the context and its default
//! namespace.

mod discover;

pub use discover::KubeError;

use telepresence_runner::Runner;

/// Which CLI drives the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeCli {
    Kubectl,
    Oc,
}

impl KubeCli {
    pub fn as_str(self) -> &'static str {
        match self {
            KubeCli::Kubectl => "kubectl",
            KubeCli::Oc => "oc",
        }
    }
}

/// Everything discovered about the target cluster at startup.
#[derive(Debug, Clone)]
pub struct Kube {
    pub cli: KubeCli,
    pub context: String,
    pub namespace: String,
    pub server: String,
    pub client_version: String,
    pub cluster_version: String,
    pub cluster_is_openshift: bool,
    /// The API server resolves to an RFC1918/loopback address, i.e. the
    /// cluster runs in a local VM (minikube, minishift). Triggers DNS-loop
    /// workarounds in the vpn-tcp method.
    pub in_local_vm: bool,
}

impl Kube {
    /// Compose an argv scoped to this cluster: `kubectl --context C
    /// --namespace N <rest...>`.
    pub fn args<I, S>(&self, rest: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![
            self.cli.as_str().to_string(),
            "--context".to_string(),
            self.context.clone(),
            "--namespace".to_string(),
            self.namespace.clone(),
        ];
        argv.extend(rest.into_iter().map(Into::into));
        argv
    }

    /// Fetch a resource as decoded JSON.
    pub async fn get_json(
        &self,
        runner: &Runner,
        resource_args: &[&str],
    ) -> Result<serde_json::Value, KubeError> {
        let mut args: Vec<String> = vec!["get".to_string()];
        args.extend(resource_args.iter().map(|s| s.to_string()));
        args.extend(["-o".to_string(), "json".to_string()]);
        let text = runner.get_output(self.args(args)).await?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Kube {
        Kube {
            cli: KubeCli::Kubectl,
            context: "minikube".to_string(),
            namespace: "default".to_string(),
            server: "https://192.168.49.2:8443".to_string(),
            client_version: "v1.29.0".to_string(),
            cluster_version: "v1.29.1".to_string(),
            cluster_is_openshift: false,
            in_local_vm: true,
        }
    }

    #[test]
    fn args_are_scoped_to_context_and_namespace() {
        let kube = sample();
        assert_eq!(
            kube.args(["get", "pods"]),
            vec!["kubectl", "--context", "minikube", "--namespace", "default", "get", "pods"]
        );
    }

    #[test]
    fn oc_cli_swaps_the_executable_only() {
        let mut kube = sample();
        kube.cli = KubeCli::Oc;
        assert_eq!(kube.args(Vec::<String>::new())[0], "oc");
    }
}
