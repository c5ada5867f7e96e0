use std::path::PathBuf;
use std::sync::Arc;

use telepresence_runner::{Platform, Runner};
use telepresence_ssh::Ssh;

use crate::args::MountArg;

/// Mount the proxy pod's filesystem over sshfs. Mount failure is not fatal:
/// the session continues without remote volumes, with a clear warning.
///
/// `allow_all_users` is set for the container method, where the uid inside
/// the user's container is unknown; allow_other may need root, hence sudo.
pub async fn mount_remote(
    runner: &Arc<Runner>,
    ssh: &Ssh,
    mount: &MountArg,
    allow_all_users: bool,
) -> Option<PathBuf> {
    let mount_dir = match mount {
        MountArg::Disabled => return None,
        // Docker for Mac only shares some folders; /tmp is one of them.
        MountArg::Auto => PathBuf::from(format!("/tmp/tel-mount-{:08x}", rand::random::<u32>())),
        MountArg::Path(path) => path.clone(),
    };
    if let Err(exc) = std::fs::create_dir_all(&mount_dir) {
        runner.show(&format!("Unable to use mount path: {}", exc));
        return None;
    }
    if !runner.depend(&["sshfs"]).is_empty() {
        runner.show(
            "sshfs is not installed, so the remote filesystem will be unavailable in this \
             session.",
        );
        return None;
    }

    let mut argv: Vec<String> = Vec::new();
    if allow_all_users {
        argv.push("sudo".to_string());
    }
    argv.extend([
        "sshfs".to_string(),
        "-p".to_string(),
        ssh.port.to_string(),
        // Don't load the user's config file; it could break us.
        "-F".to_string(),
        "/dev/null".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
    ]);
    if allow_all_users {
        argv.extend(["-o".to_string(), "allow_other".to_string()]);
    }
    argv.push("telepresence@localhost:/".to_string());
    argv.push(mount_dir.to_string_lossy().into_owned());

    if let Err(exc) = runner.command(argv).capture().await {
        runner.show(
            "Mounting remote volumes failed, they will be unavailable in this session. If \
             you are running on Windows Subsystem for Linux then see \
             https://github.com/datawire/telepresence/issues/115, otherwise please report a \
             bug, attaching telepresence.log to the bug report: \
             https://github.com/datawire/telepresence/issues/new",
        );
        if let Some(output) = exc.command_output() {
            if !output.is_empty() {
                runner.show(&format!("\nMount error was: {}\n", output.trim()));
            }
        }
        return None;
    }

    let cleanup_runner = runner.clone();
    let cleanup_dir = mount_dir.clone();
    let sudo_prefix = allow_all_users;
    runner.add_cleanup("Unmount remote filesystem", move || async move {
        let dir = cleanup_dir.to_string_lossy().into_owned();
        let mut argv: Vec<String> = Vec::new();
        if sudo_prefix {
            argv.push("sudo".to_string());
        }
        match cleanup_runner.platform() {
            Platform::Linux => {
                argv.extend(["fusermount".to_string(), "-z".to_string(), "-u".to_string(), dir]);
                cleanup_runner.check_call(argv).await?;
            }
            Platform::MacOs => {
                argv.extend(["umount".to_string(), "-f".to_string(), dir]);
                cleanup_runner.command(argv).capture().await?;
            }
        }
        let _ = std::fs::remove_dir(&cleanup_dir);
        Ok(())
    });
    Some(mount_dir)
}
