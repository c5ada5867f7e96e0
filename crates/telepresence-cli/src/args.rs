use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Inject a process-specific shared library that proxies TCP to the
    /// remote cluster.
    InjectTcp,
    /// Route TCP from all local processes to the remote cluster. Requires
    /// root.
    VpnTcp,
    /// Used with --docker-run.
    Container,
}

/// How the filesystem mount was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountArg {
    Disabled,
    /// Pick a random directory under /tmp.
    Auto,
    Path(PathBuf),
}

fn parse_mount(value: &str) -> Result<MountArg, String> {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return Ok(MountArg::Path(path));
    }
    match value.to_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(MountArg::Auto),
        "false" | "off" | "no" | "0" => Ok(MountArg::Disabled),
        _ => Err("Value must be true, false, or an absolute filesystem path".to_string()),
    }
}

/// Telepresence: local development proxied to a remote Kubernetes cluster.
#[derive(Parser, Debug)]
#[command(name = "telepresence", version, disable_help_subcommand = true)]
pub struct Args {
    /// Enables verbose logging for troubleshooting.
    #[arg(long)]
    pub verbose: bool,

    /// The path to write logs to. '-' means stdout.
    #[arg(long, default_value = "./telepresence.log")]
    pub logfile: String,

    /// Outbound interception method. Defaults to 'vpn-tcp', or 'container'
    /// when --docker-run is used.
    #[arg(long, short = 'm', value_enum)]
    pub method: Option<Method>,

    /// Create a new proxy deployment with this name, deleted on exit. The
    /// default when no deployment option is given, with a random name.
    #[arg(long, short = 'n', value_name = "DEPLOYMENT_NAME", group = "deployment_mode")]
    pub new_deployment: Option<String>,

    /// Swap out an existing deployment for the proxy, swap back on exit.
    /// Add :CONTAINER when the pod has more than one container.
    #[arg(
        long,
        short = 's',
        value_name = "DEPLOYMENT_NAME[:CONTAINER]",
        group = "deployment_mode"
    )]
    pub swap_deployment: Option<String>,

    /// The name of an existing deployment where the proxy image is already
    /// running.
    #[arg(
        long,
        short = 'd',
        value_name = "EXISTING_DEPLOYMENT_NAME",
        group = "deployment_mode"
    )]
    pub deployment: Option<String>,

    /// The Kubernetes context to use. Defaults to the current kubectl
    /// context.
    #[arg(long)]
    pub context: Option<String>,

    /// The Kubernetes namespace to use. Defaults to the context's default
    /// namespace.
    #[arg(long)]
    pub namespace: Option<String>,

    /// Port to expose to Kubernetes: local and remote port are the same
    /// unless given as LOCAL:REMOTE.
    #[arg(long, value_name = "PORT[:REMOTE_PORT]")]
    pub expose: Vec<String>,

    /// Additional IPs, IP ranges, or hostnames to proxy with vpn-tcp.
    #[arg(long, value_name = "CLOUD_HOSTNAME")]
    pub also_proxy: Vec<String>,

    /// Where to mount the remote filesystem ($TELEPRESENCE_ROOT): an
    /// absolute path, "true" for a random /tmp directory (the default), or
    /// "false" to disable mounting.
    #[arg(long, value_name = "PATH_OR_BOOLEAN", default_value = "true", value_parser = parse_mount)]
    pub mount: MountArg,

    /// Write the remote environment to this file as JSON.
    #[arg(long, value_name = "FILENAME")]
    pub env_json: Option<PathBuf>,

    /// Write the remote environment to this file as a docker-compose env
    /// file.
    #[arg(long, value_name = "FILENAME")]
    pub env_file: Option<PathBuf>,

    /// Run the proxy pod under this service account.
    #[arg(long, value_name = "SERVICE_ACCOUNT")]
    pub serviceaccount: Option<String>,

    /// Run a local shell that will be proxied to/from Kubernetes.
    #[arg(long, group = "command_mode")]
    pub run_shell: bool,

    /// Run the specified command with arguments, e.g. '--run python
    /// myapp.py'.
    #[arg(
        long,
        value_name = "COMMAND",
        num_args = 1..,
        allow_hyphen_values = true,
        group = "command_mode"
    )]
    pub run: Option<Vec<String>>,

    /// Run a Docker container, passing the arguments to 'docker run', e.g.
    /// '--docker-run -i -t ubuntu:16.04 /bin/bash'.
    #[arg(
        long,
        value_name = "DOCKER_RUN_ARG",
        num_args = 1..,
        allow_hyphen_values = true,
        group = "command_mode"
    )]
    pub docker_run: Option<Vec<String>>,

    #[arg(long, hide = true, value_name = "HOST:PORT")]
    pub probe_connect: Option<String>,
}

impl Args {
    /// Apply the defaulting rules that depend on combinations of options.
    pub fn normalize(&mut self) -> Result<(), String> {
        if self.method.is_none() {
            self.method = Some(if self.docker_run.is_some() {
                Method::Container
            } else {
                Method::VpnTcp
            });
        }
        if self.method == Some(Method::Container) && self.docker_run.is_none() {
            return Err("'--docker-run' is required when using '--method container'.".to_string());
        }
        if self.docker_run.is_some() && self.method != Some(Method::Container) {
            return Err("'--method container' is required when using '--docker-run'.".to_string());
        }
        if self.deployment.is_none()
            && self.new_deployment.is_none()
            && self.swap_deployment.is_none()
        {
            self.new_deployment = Some(telepresence_outbound::random_name());
        }
        Ok(())
    }

    pub fn method(&self) -> Method {
        self.method.expect("normalize() ran")
    }
}

/// `NAME[:CONTAINER]` as used by --swap-deployment.
pub fn split_deployment_container(argument: &str) -> (String, Option<String>) {
    match argument.split_once(':') {
        Some((deployment, container)) => (deployment.to_string(), Some(container.to_string())),
        None => (argument.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_run_implies_container_method() {
        let mut args =
            Args::parse_from(["telepresence", "--docker-run", "-i", "-t", "alpine", "sh"]);
        args.normalize().unwrap();
        assert_eq!(args.method(), Method::Container);
        assert_eq!(
            args.docker_run.unwrap(),
            vec!["-i", "-t", "alpine", "sh"]
        );
    }

    #[test]
    fn default_method_is_vpn_and_default_operation_is_new() {
        let mut args = Args::parse_from(["telepresence", "--run", "curl", "http://x/"]);
        args.normalize().unwrap();
        assert_eq!(args.method(), Method::VpnTcp);
        assert!(args.new_deployment.unwrap().starts_with("telepresence-"));
    }

    #[test]
    fn deployment_options_are_mutually_exclusive() {
        let result = Args::try_parse_from([
            "telepresence",
            "--new-deployment",
            "foo",
            "--swap-deployment",
            "bar",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn run_consumes_the_remainder_even_with_flags() {
        let args = Args::parse_from([
            "telepresence",
            "--run",
            "python",
            "-m",
            "http.server",
            "9090",
        ]);
        assert_eq!(
            args.run.unwrap(),
            vec!["python", "-m", "http.server", "9090"]
        );
    }

    #[test]
    fn swap_argument_splits_the_container_suffix() {
        assert_eq!(
            split_deployment_container("hello:nginxhttps"),
            ("hello".to_string(), Some("nginxhttps".to_string()))
        );
        assert_eq!(split_deployment_container("hello"), ("hello".to_string(), None));
    }

    #[test]
    fn mount_accepts_bool_or_absolute_path() {
        assert_eq!(parse_mount("true").unwrap(), MountArg::Auto);
        assert_eq!(parse_mount("false").unwrap(), MountArg::Disabled);
        assert_eq!(
            parse_mount("/mnt/pod").unwrap(),
            MountArg::Path(PathBuf::from("/mnt/pod"))
        );
        assert!(parse_mount("maybe").is_err());
    }
}
