use std::time::Duration;

use telepresence_runner::{Runner, RunnerError};

/// Argument assembly for `ssh` against the proxy pod's forwarded listener.
///
/// Host-key checking and known-hosts storage are disabled: the only
/// reachable peer is the port-forward this session just opened.
#[derive(Debug, Clone)]
pub struct Ssh {
    pub port: u16,
    pub user_at_host: String,
}

impl Ssh {
    pub fn new(port: u16) -> Ssh {
        Ssh::with_user_at_host(port, "telepresence@127.0.0.1")
    }

    pub fn with_user_at_host(port: u16, user_at_host: &str) -> Ssh {
        Ssh {
            port,
            user_at_host: user_at_host.to_string(),
        }
    }

    /// Arguments any ssh-compatible client needs to reach the pod.
    pub fn required_args(&self) -> Vec<String> {
        [
            // Ignore the user's ~/.ssh/config.
            "-F",
            "/dev/null",
            "-oStrictHostKeyChecking=no",
            "-oUserKnownHostsFile=/dev/null",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Command line for running `additional_args` on the remote side.
    pub fn command(
        &self,
        verbose: bool,
        additional_args: &[String],
        prepend_arguments: &[String],
    ) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        argv.extend(prepend_arguments.iter().cloned());
        argv.extend(self.required_args());
        argv.push(if verbose { "-vv" } else { "-q" }.to_string());
        argv.extend(["-p".to_string(), self.port.to_string(), self.user_at_host.clone()]);
        argv.extend(additional_args.iter().cloned());
        argv
    }

    /// Command line for long-lived port-forward sessions: no remote command,
    /// and a keepalive that gives up after ten unanswered one-second probes.
    pub fn bg_command(&self, verbose: bool, additional_args: &[String]) -> Vec<String> {
        let prepend: Vec<String> = [
            "-N",
            "-oServerAliveInterval=1",
            "-oServerAliveCountMax=10",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        self.command(verbose, additional_args, &prepend)
    }

    /// Can the SSH server be reached within 30 seconds? Each attempt runs
    /// `ssh ... /bin/true` with a five-second timeout.
    pub async fn wait(&self, runner: &Runner) -> Result<bool, RunnerError> {
        let probe = self.command(runner.verbose(), &["/bin/true".to_string()], &[]);
        let mut ticker = runner.loop_until(Duration::from_secs(30), Duration::from_millis(250));
        while ticker.next().await?.is_some() {
            let attempt = runner
                .command(probe.clone())
                .timeout(Duration::from_secs(5))
                .check()
                .await;
            if attempt.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_assembles_the_expected_argv() {
        let ssh = Ssh::new(40022);
        let argv = ssh.command(false, &["/bin/true".to_string()], &[]);
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-F",
                "/dev/null",
                "-oStrictHostKeyChecking=no",
                "-oUserKnownHostsFile=/dev/null",
                "-q",
                "-p",
                "40022",
                "telepresence@127.0.0.1",
                "/bin/true",
            ]
        );
    }

    #[test]
    fn bg_command_adds_keepalive_and_no_remote_command() {
        let ssh = Ssh::new(40022);
        let argv = ssh.bg_command(true, &["-L9999:127.0.0.1:9050".to_string()]);
        assert_eq!(argv[1], "-N");
        assert!(argv.contains(&"-oServerAliveInterval=1".to_string()));
        assert!(argv.contains(&"-oServerAliveCountMax=10".to_string()));
        assert!(argv.contains(&"-vv".to_string()));
        assert_eq!(argv.last().unwrap(), "-L9999:127.0.0.1:9050");
    }
}
