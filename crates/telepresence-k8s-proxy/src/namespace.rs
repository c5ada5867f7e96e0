use regex::Regex;
use tracing::info;

const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Which namespace is this pod running in? Tried in order: the environment
/// (Downward API), the mounted service account, and finally the `search`
/// line of resolv.conf.
pub fn resolve_namespace() -> Option<String> {
    if let Ok(namespace) = std::env::var("TELEPRESENCE_CONTAINER_NAMESPACE") {
        if !namespace.is_empty() {
            info!("Namespace from the process environment");
            return Some(namespace);
        }
    }
    if let Ok(namespace) = std::fs::read_to_string(NAMESPACE_PATH) {
        let namespace = namespace.trim().to_string();
        if !namespace.is_empty() {
            info!("Namespace from the service account");
            return Some(namespace);
        }
    }
    let resolv = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    let namespace = guess_namespace(&resolv)?;
    info!("Namespace guessed from /etc/resolv.conf");
    Some(namespace)
}

/// Find the `<namespace>.svc.<...>` element of a search line.
pub fn guess_namespace(resolv_conf: &str) -> Option<String> {
    let pattern = Regex::new(r"\s([a-z0-9-]+)\.svc(\.|\s|$)").expect("static pattern compiles");
    for line in resolv_conf.lines() {
        let line = line.trim();
        if !line.starts_with("search") {
            continue;
        }
        // Trailing space so an end-of-line match still has its delimiter.
        let padded = format!("{} ", line);
        if let Some(captures) = pattern.captures(&padded) {
            return Some(captures[1].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_parsed_from_the_search_line() {
        let resolv = "nameserver 10.96.0.10\nsearch myspace.svc.cluster.local svc.cluster.local cluster.local\noptions ndots:5\n";
        assert_eq!(guess_namespace(resolv).as_deref(), Some("myspace"));
    }

    #[test]
    fn missing_search_line_yields_nothing() {
        assert_eq!(guess_namespace("nameserver 10.96.0.10\n"), None);
        assert_eq!(guess_namespace("search example.com\n"), None);
    }
}
