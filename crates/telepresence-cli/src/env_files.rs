use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use telepresence_proxy::RemoteInfo;
use telepresence_runner::Runner;

/// The environment the user command should see: the pod's variables with
/// the host-specific ones dropped, plus markers describing the session.
pub fn filtered_environment(
    pod_env: &HashMap<String, String>,
    remote_info: &RemoteInfo,
) -> HashMap<String, String> {
    let mut env = pod_env.clone();
    // The proxy image's own view of these would break the local machine.
    for key in ["HOME", "PATH", "HOSTNAME"] {
        env.remove(key);
    }
    env.insert(
        "TELEPRESENCE_POD".to_string(),
        remote_info.pod_name.clone(),
    );
    env.insert(
        "TELEPRESENCE_CONTAINER".to_string(),
        remote_info.container_name.clone(),
    );
    env
}

/// Render an env file as defined by docker-compose: `VAR=VAL` lines, no
/// quoting, which means values with newlines cannot be represented. Returns
/// the rendered file and the keys that had to be skipped.
pub fn serialize_as_env_file(env: &HashMap<String, String>) -> (String, Vec<String>) {
    let sorted: BTreeMap<&String, &String> = env.iter().collect();
    let mut rendered = String::new();
    let mut skipped = Vec::new();
    for (key, value) in sorted {
        if value.contains('\n') {
            skipped.push(key.clone());
        } else {
            rendered.push_str(&format!("{}={}\n", key, value));
        }
    }
    (rendered, skipped)
}

fn serialize_as_json(env: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = env.iter().collect();
    serde_json::to_string_pretty(&sorted).unwrap_or_else(|_| "{}".to_string())
}

/// Write the requested environment files. Failures are reported and
/// swallowed; a missing env file never takes the session down.
pub fn write_env_files(
    runner: &Runner,
    env: &HashMap<String, String>,
    env_json: Option<&Path>,
    env_file: Option<&Path>,
) {
    if let Some(path) = env_json {
        if let Err(exc) = std::fs::write(path, serialize_as_json(env)) {
            runner.show(&format!("Failed to write environment as JSON: {}", exc));
        }
    }
    if let Some(path) = env_file {
        let (data, skipped) = serialize_as_env_file(env);
        if let Err(exc) = std::fs::write(path, data) {
            runner.show(&format!("Failed to write environment as env file: {}", exc));
        } else if !skipped.is_empty() {
            runner.show(
                "Skipped these environment keys when writing env file because the associated \
                 values have newlines:",
            );
            for key in skipped {
                runner.show(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telepresence_proxy::ResourceIdent;

    fn remote_info() -> RemoteInfo {
        RemoteInfo {
            deployment: ResourceIdent {
                namespace: "default".to_string(),
                name: "foo".to_string(),
            },
            pod_name: "foo-12ab".to_string(),
            container_name: "foo".to_string(),
            image: "datawire/telepresence-k8s:0.1.0".to_string(),
        }
    }

    #[test]
    fn host_specific_keys_are_dropped_and_markers_added() {
        let pod_env: HashMap<String, String> = [
            ("HOME", "/root"),
            ("PATH", "/usr/bin"),
            ("HOSTNAME", "foo-12ab"),
            ("MYSERVICE_SERVICE_HOST", "10.96.0.5"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let env = filtered_environment(&pod_env, &remote_info());
        assert!(env.get("HOME").is_none());
        assert!(env.get("PATH").is_none());
        assert!(env.get("HOSTNAME").is_none());
        assert_eq!(env["MYSERVICE_SERVICE_HOST"], "10.96.0.5");
        assert_eq!(env["TELEPRESENCE_POD"], "foo-12ab");
        assert_eq!(env["TELEPRESENCE_CONTAINER"], "foo");
    }

    #[test]
    fn env_file_skips_values_with_newlines_and_sorts() {
        let env: HashMap<String, String> = [
            ("B_KEY", "two"),
            ("A_KEY", "one"),
            ("CERT", "line1\nline2"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let (rendered, skipped) = serialize_as_env_file(&env);
        assert_eq!(rendered, "A_KEY=one\nB_KEY=two\n");
        assert_eq!(skipped, vec!["CERT"]);
    }
}
