use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::{PortMapping, ProxyError, SESSION_LABEL};

/// DNS labels (and thus object names) top out at 63 characters.
const MAX_NAME: usize = 63;

/// Name for the sibling Deployment that replaces the original during a swap:
/// `<original>-<session-id>`, with the original truncated to fit the limit.
pub fn swapped_deployment_name(original: &str, session_id: &str) -> String {
    let width = MAX_NAME - session_id.len() - 1;
    let prefix: String = original.chars().take(width).collect();
    format!("{}-{}", prefix, session_id)
}

/// Resolve the container to proxy: the requested name, or the first container
/// of the pod template when none was given.
pub fn container_name(deployment: &Value, requested: Option<&str>) -> Result<String, ProxyError> {
    if let Some(name) = requested {
        return Ok(name.to_string());
    }
    deployment["spec"]["template"]["spec"]["containers"][0]["name"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProxyError::MissingContainer("(first)".to_string()))
}

/// Merge the container's declared TCP ports into the expose mapping.
pub fn merge_container_ports(expose: &mut PortMapping, container: &Value) {
    let ports: Vec<u16> = container["ports"]
        .as_array()
        .map(|ports| {
            ports
                .iter()
                .filter(|port| port["protocol"].as_str().unwrap_or("TCP") == "TCP")
                .filter_map(|port| port["containerPort"].as_u64())
                .filter_map(|port| u16::try_from(port).ok())
                .collect()
        })
        .unwrap_or_default();
    expose.merge_automatic_ports(&ports);
}

/// Build the sibling Deployment that runs the proxy image in place of the
/// chosen container. Works on the raw JSON so every field of the user's
/// Deployment survives the round trip. Mutates `expose` to include the
/// container's own ports.
pub fn new_swapped_deployment(
    old_deployment: &Value,
    container_to_update: &str,
    session_id: &str,
    proxy_image: &str,
    expose: &mut PortMapping,
    deployment_env: &BTreeMap<String, String>,
    service_account: Option<&str>,
) -> Result<Value, ProxyError> {
    let mut deployment = old_deployment.clone();
    strip_server_bookkeeping(&mut deployment);

    deployment["spec"]["replicas"] = json!(1);
    label_object(&mut deployment["metadata"], session_id);
    label_object(&mut deployment["spec"]["template"]["metadata"], session_id);
    if let Some(account) = service_account {
        deployment["spec"]["template"]["spec"]["serviceAccountName"] = json!(account);
    }

    let containers = deployment["spec"]["template"]["spec"]["containers"]
        .as_array_mut()
        .ok_or_else(|| ProxyError::Invalid("Deployment has no containers".to_string()))?;
    for container in containers {
        if container["name"].as_str() != Some(container_to_update) {
            continue;
        }
        merge_container_ports(expose, container);
        let spec = container
            .as_object_mut()
            .expect("containers are JSON objects");
        spec.insert("image".to_string(), json!(proxy_image));
        // Tests use images that are never pushed to a registry.
        spec.insert("imagePullPolicy".to_string(), json!("IfNotPresent"));
        for unneeded in [
            "args",
            "startupProbe",
            "livenessProbe",
            "readinessProbe",
            "workingDir",
            "lifecycle",
        ] {
            spec.remove(unneeded);
        }
        spec.insert("command".to_string(), json!(["/usr/src/app/run.sh"]));
        // The proxy never writes a termination file.
        spec.insert(
            "terminationMessagePolicy".to_string(),
            json!("FallbackToLogsOnError"),
        );
        let env = spec
            .entry("env".to_string())
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .ok_or_else(|| ProxyError::Invalid("container env is not a list".to_string()))?;
        for (key, value) in deployment_env {
            env.push(json!({"name": key, "value": value}));
        }
        // Let the forwarder learn its namespace without k8s API access, so
        // automountServiceAccountToken: false keeps working.
        env.push(json!({
            "name": "TELEPRESENCE_CONTAINER_NAMESPACE",
            "valueFrom": {"fieldRef": {"fieldPath": "metadata.namespace"}},
        }));
        return Ok(deployment);
    }
    Err(ProxyError::MissingContainer(container_to_update.to_string()))
}

fn label_object(metadata: &mut Value, session_id: &str) {
    if metadata.is_null() {
        *metadata = json!({});
    }
    let metadata = metadata.as_object_mut().expect("metadata is an object");
    let labels = metadata
        .entry("labels".to_string())
        .or_insert_with(|| json!({}));
    labels[SESSION_LABEL] = json!(session_id);
}

/// Drop the fields the API server owns; creating a copied object with them
/// present is rejected or misleading.
fn strip_server_bookkeeping(deployment: &mut Value) {
    if let Some(root) = deployment.as_object_mut() {
        root.remove("status");
    }
    if let Some(metadata) = deployment["metadata"].as_object_mut() {
        for owned in [
            "creationTimestamp",
            "generation",
            "managedFields",
            "resourceVersion",
            "selfLink",
            "uid",
        ] {
            metadata.remove(owned);
        }
        if let Some(annotations) = metadata
            .get_mut("annotations")
            .and_then(Value::as_object_mut)
        {
            annotations.remove("deployment.kubernetes.io/revision");
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "hello",
                "resourceVersion": "12345",
                "uid": "aaaa-bbbb",
            },
            "spec": {
                "replicas": 3,
                "selector": {"matchLabels": {"app": "hello"}},
                "template": {
                    "metadata": {"labels": {"app": "hello"}},
                    "spec": {
                        "containers": [
                            {
                                "name": "nginxhttps",
                                "image": "ymqytw/nginxhttps:1.5",
                                "command": ["/home/auto-reload-nginx.sh"],
                                "args": ["-v"],
                                "workingDir": "/tmp",
                                "ports": [
                                    {"containerPort": 443, "protocol": "TCP"},
                                    {"containerPort": 80, "protocol": "TCP"},
                                    {"containerPort": 53, "protocol": "UDP"},
                                ],
                                "livenessProbe": {"httpGet": {"path": "/", "port": 80}},
                                "env": [{"name": "HI", "value": "there"}],
                            },
                            {"name": "sidecar", "image": "busybox"},
                        ],
                    },
                },
            },
            "status": {"replicas": 3},
        })
    }

    #[test]
    fn swap_rewrites_only_the_chosen_container() {
        let mut expose = PortMapping::parse(&["9090"]).unwrap();
        let swapped = new_swapped_deployment(
            &fixture(),
            "nginxhttps",
            "random_id_123",
            "datawire/telepresence-k8s-priv:0.109",
            &mut expose,
            &BTreeMap::new(),
            None,
        )
        .unwrap();

        assert_eq!(swapped["spec"]["replicas"], 1);
        assert_eq!(swapped["metadata"]["labels"][SESSION_LABEL], "random_id_123");
        assert_eq!(
            swapped["spec"]["template"]["metadata"]["labels"][SESSION_LABEL],
            "random_id_123"
        );
        assert!(swapped["metadata"].get("resourceVersion").is_none());
        assert!(swapped.get("status").is_none());

        let container = &swapped["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "datawire/telepresence-k8s-priv:0.109");
        assert_eq!(container["command"], json!(["/usr/src/app/run.sh"]));
        assert_eq!(container["terminationMessagePolicy"], "FallbackToLogsOnError");
        assert!(container.get("args").is_none());
        assert!(container.get("livenessProbe").is_none());
        assert!(container.get("workingDir").is_none());
        let env = container["env"].as_array().unwrap();
        assert_eq!(env[0], json!({"name": "HI", "value": "there"}));
        assert_eq!(
            env.last().unwrap()["name"],
            "TELEPRESENCE_CONTAINER_NAMESPACE"
        );

        // The sidecar is untouched.
        let sidecar = &swapped["spec"]["template"]["spec"]["containers"][1];
        assert_eq!(sidecar["image"], "busybox");

        // TCP container ports merged behind the explicit --expose entries.
        assert_eq!(
            expose.local_to_remote(),
            vec![(80, 80), (443, 443), (9090, 9090)]
        );
    }

    #[test]
    fn swap_rejects_unknown_containers() {
        let mut expose = PortMapping::default();
        let err = new_swapped_deployment(
            &fixture(),
            "missing",
            "id",
            "img",
            &mut expose,
            &BTreeMap::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ProxyError::MissingContainer(name) if name == "missing"));
    }

    #[test]
    fn swapped_names_stay_within_the_dns_label_limit() {
        let id = "0123456789abcdef0123456789abcdef";
        assert_eq!(id.len(), 32);
        let long_name = "d".repeat(62);
        let new_name = swapped_deployment_name(&long_name, id);
        assert_eq!(new_name.len(), 63);
        assert!(new_name.ends_with(id));

        let short = swapped_deployment_name("hello", id);
        assert_eq!(short, format!("hello-{}", id));
    }

    #[test]
    fn first_container_is_the_default() {
        assert_eq!(container_name(&fixture(), None).unwrap(), "nginxhttps");
        assert_eq!(
            container_name(&fixture(), Some("sidecar")).unwrap(),
            "sidecar"
        );
    }
}
