use crate::PortMapping;

pub const REGISTRY_ENV: &str = "TELEPRESENCE_REGISTRY";
pub const VERSION_ENV: &str = "TELEPRESENCE_VERSION";
pub const OCP_IMAGE_ENV: &str = "TELEPRESENCE_USE_OCP_IMAGE";

/// Where proxy images come from and which tag they carry.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    registry: String,
    version: String,
}

impl ImageConfig {
    /// Image origin from the environment; the tag defaults to this tool's
    /// release version and may be overridden for test runs.
    pub fn from_env(tool_version: &str) -> ImageConfig {
        let registry =
            std::env::var(REGISTRY_ENV).unwrap_or_else(|_| "datawire".to_string());
        // Use the released image for dev builds like 0.109-7-gabcdef.
        let release = tool_version
            .split_once('-')
            .map_or(tool_version, |(release, _)| release);
        let version = std::env::var(VERSION_ENV).unwrap_or_else(|_| release.to_string());
        ImageConfig { registry, version }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn remote(&self) -> String {
        format!("{}/telepresence-k8s:{}", self.registry, self.version)
    }

    pub fn remote_privileged(&self) -> String {
        format!("{}/telepresence-k8s-priv:{}", self.registry, self.version)
    }

    pub fn remote_openshift(&self) -> String {
        format!("{}/telepresence-ocp:{}", self.registry, self.version)
    }

    /// Does this image reference one of our proxy images?
    pub fn is_proxy_image(&self, image: &str) -> bool {
        ["telepresence-k8s", "telepresence-k8s-priv", "telepresence-ocp"]
            .iter()
            .any(|name| {
                image
                    .rsplit('/')
                    .next()
                    .is_some_and(|last| last.split(':').next() == Some(*name))
            })
    }

    /// Pick the proxy image variant: OpenShift-specific, privileged (remote
    /// ports below 1024), or ordinary; honoring the user's override.
    pub fn select(
        &self,
        expose: &PortMapping,
        cluster_is_openshift: bool,
        warn: &mut dyn FnMut(String),
    ) -> String {
        let ocp_env = std::env::var(OCP_IMAGE_ENV).unwrap_or_default();
        self.select_with(&ocp_env, expose, cluster_is_openshift, warn)
    }

    fn select_with(
        &self,
        ocp_env: &str,
        expose: &PortMapping,
        cluster_is_openshift: bool,
        warn: &mut dyn FnMut(String),
    ) -> String {
        let normalized = ocp_env.to_lowercase();
        match normalized.as_str() {
            "true" | "on" | "yes" | "1" | "always" => return self.remote_openshift(),
            "false" | "off" | "no" | "0" | "never" => {
                // OpenShift image disallowed; fall through to the others.
            }
            "" | "auto" | "automatic" | "default" => {
                if cluster_is_openshift {
                    return self.remote_openshift();
                }
            }
            _ => {
                warn(format!(
                    "WARNING: Ignoring {} environment variable with value {:?}. \
                     Accepted values are YES or NO or AUTO. Using AUTO.",
                    OCP_IMAGE_ENV, ocp_env
                ));
                if cluster_is_openshift {
                    return self.remote_openshift();
                }
            }
        }
        if expose.has_privileged_ports() {
            return self.remote_privileged();
        }
        self.remote()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImageConfig {
        ImageConfig {
            registry: "datawire".to_string(),
            version: "0.109".to_string(),
        }
    }

    fn no_warn() -> impl FnMut(String) {
        |_message| {}
    }

    #[test]
    fn privileged_ports_pick_the_privileged_image() {
        let expose = PortMapping::parse(&["8080:80"]).unwrap();
        let image = config().select_with("", &expose, false, &mut no_warn());
        assert_eq!(image, "datawire/telepresence-k8s-priv:0.109");
    }

    #[test]
    fn openshift_cluster_picks_the_ocp_image_unless_refused() {
        let expose = PortMapping::default();
        let cfg = config();
        assert_eq!(
            cfg.select_with("auto", &expose, true, &mut no_warn()),
            "datawire/telepresence-ocp:0.109"
        );
        assert_eq!(
            cfg.select_with("no", &expose, true, &mut no_warn()),
            "datawire/telepresence-k8s:0.109"
        );
        assert_eq!(
            cfg.select_with("yes", &expose, false, &mut no_warn()),
            "datawire/telepresence-ocp:0.109"
        );
    }

    #[test]
    fn garbage_override_warns_and_uses_auto() {
        let expose = PortMapping::default();
        let mut warned = Vec::new();
        let image = config().select_with("maybe", &expose, false, &mut |m| warned.push(m));
        assert_eq!(image, "datawire/telepresence-k8s:0.109");
        assert_eq!(warned.len(), 1);
    }

    #[test]
    fn proxy_image_detection_matches_all_variants() {
        let cfg = config();
        assert!(cfg.is_proxy_image("datawire/telepresence-k8s:0.109"));
        assert!(cfg.is_proxy_image("quay.io/other/telepresence-ocp:0.110"));
        assert!(!cfg.is_proxy_image("nginx:latest"));
    }
}
