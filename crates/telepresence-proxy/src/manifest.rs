use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::{json, Value};

use crate::SESSION_LABEL;

fn session_labels(session_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(SESSION_LABEL.to_string(), session_id.to_string())])
}

/// The proxy Pod for the new-deployment operation.
pub fn proxy_pod(
    name: &str,
    session_id: &str,
    image: &str,
    env: &BTreeMap<String, String>,
    service_account: Option<&str>,
) -> Pod {
    let env: Vec<EnvVar> = env
        .iter()
        .map(|(key, value)| EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(session_labels(session_id)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: (!env.is_empty()).then_some(env),
                resources: Some(ResourceRequirements {
                    requests: Some(quantities(&[("cpu", "25m"), ("memory", "64Mi")])),
                    limits: Some(quantities(&[("cpu", "1"), ("memory", "256Mi")])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            service_account_name: service_account.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A ClusterIP Service exposing the proxy pod's remote ports as `{p: p}`.
pub fn proxy_service(name: &str, session_id: &str, remote_ports: &[u16]) -> Service {
    let ports: Vec<ServicePort> = remote_ports
        .iter()
        .map(|&port| ServicePort {
            name: Some(format!("port-{}", port)),
            port: i32::from(port),
            target_port: Some(IntOrString::Int(i32::from(port))),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(session_labels(session_id)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(session_labels(session_id)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Wrap the manifests in a `kind: List` so they apply in one call.
pub fn manifest_list(pod: &Pod, service: Option<&Service>) -> Value {
    // The typed structs don't carry apiVersion/kind; the CLI needs both.
    let mut items = vec![tagged(json!(pod), "Pod")];
    if let Some(service) = service {
        items.push(tagged(json!(service), "Service"));
    }
    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": items,
    })
}

fn tagged(mut manifest: Value, kind: &str) -> Value {
    let object = manifest.as_object_mut().expect("manifests are objects");
    object.insert("apiVersion".to_string(), Value::from("v1"));
    object.insert("kind".to_string(), Value::from(kind));
    manifest
}

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|&(key, value)| (key.to_string(), Quantity(value.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_carries_session_label_and_resources() {
        let pod = proxy_pod(
            "foo",
            "sessionid123",
            "datawire/telepresence-k8s:0.109",
            &BTreeMap::new(),
            None,
        );
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get(SESSION_LABEL),
            Some(&"sessionid123".to_string())
        );
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let resources = spec.containers[0].resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("25m".to_string())
        );
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("256Mi".to_string())
        );
    }

    #[test]
    fn list_includes_service_only_when_ports_are_exposed() {
        let pod = proxy_pod("foo", "id", "img", &BTreeMap::new(), None);
        let list = manifest_list(&pod, None);
        assert_eq!(list["items"].as_array().unwrap().len(), 1);
        assert_eq!(list["items"][0]["kind"], "Pod");
        assert_eq!(list["items"][0]["apiVersion"], "v1");

        let service = proxy_service("foo", "id", &[9090, 8080]);
        let list = manifest_list(&pod, Some(&service));
        assert_eq!(list["kind"], "List");
        assert_eq!(list["items"].as_array().unwrap().len(), 2);
        assert_eq!(list["items"][1]["spec"]["ports"][0]["port"], 9090);
        assert_eq!(list["items"][1]["spec"]["selector"][SESSION_LABEL], "id");
    }
}
