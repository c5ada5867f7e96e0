use std::sync::Arc;

use telepresence_runner::{LaunchOptions, Runner, RunnerError};

use crate::Ssh;

/// Create SSH tunnels from the remote proxy pod back to local services.
///
/// With `show_only` the messages are still displayed but no tunnel is
/// launched here; the container method builds the actual tunnels inside the
/// network container where these messages are not visible.
pub async fn expose_local_services(
    runner: &Arc<Runner>,
    ssh: &Ssh,
    port_numbers: &[(u16, u16)],
    show_only: bool,
) -> Result<(), RunnerError> {
    if port_numbers.is_empty() && runner.chatty() {
        runner.show(
            "No traffic is being forwarded from the remote Deployment to your local machine. \
             You can use the --expose option to specify which ports you want to forward.",
        );
    }
    let mut remote_forward_arguments = Vec::new();
    for &(local_port, remote_port) in port_numbers {
        if runner.chatty() {
            runner.show(&format!(
                "Forwarding remote port {} to local port {}.",
                remote_port, local_port
            ));
        }
        remote_forward_arguments.push("-R".to_string());
        remote_forward_arguments.push(format!("*:{}:127.0.0.1:{}", remote_port, local_port));
    }
    if !remote_forward_arguments.is_empty() && !show_only {
        runner
            .launch(
                "SSH port forward (exposed ports)",
                ssh.bg_command(runner.verbose(), &remote_forward_arguments),
                LaunchOptions::default(),
            )
            .await?;
    }
    Ok(())
}
