use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use telepresence_runner::{Platform, Runner, RunnerError};

const NICE_FAILURE: &str = "#!/bin/sh
echo {} is not supported under Telepresence.
echo See https://telepresence.io/reference/limitations.html for details.
exit 55
";

/// Create replacement command-line tools that just error out, in a nice way.
pub fn make_unsupported_tools(commands: &[&str], destination: &Path) -> Result<(), RunnerError> {
    for command in commands {
        let path = destination.join(command);
        std::fs::write(&path, NICE_FAILURE.replace("{}", command))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Work around System Integrity Protection: macOS refuses library injection
/// into binaries under /bin, /sbin and /usr, so copy them somewhere
/// injectable. It's only ~100MB, this is fast enough.
fn make_sip_workaround_copy(protected: &[PathBuf], destination: &Path) -> Result<(), RunnerError> {
    for directory in protected {
        let Ok(entries) = std::fs::read_dir(directory) else {
            continue;
        };
        for entry in entries.flatten() {
            let target = destination.join(entry.file_name());
            if std::fs::copy(entry.path(), &target).is_err() {
                continue;
            }
            let _ = std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o775));
        }
    }
    Ok(())
}

/// Build the `$PATH` for the user process: stub tools first, the SIP copies
/// on macOS, then everything else.
///
/// `replace_dns_tools` is set for inject-tcp, where DNS is not proxied and
/// nslookup/dig/host would silently give wrong answers.
pub fn apply_workarounds(
    runner: &Runner,
    original_path: &str,
    replace_dns_tools: bool,
) -> Result<String, RunnerError> {
    let mut paths: Vec<String> = original_path.split(':').map(str::to_string).collect();

    if runner.platform() == Platform::MacOs {
        let protected_set = ["/bin", "/sbin", "/usr/sbin", "/usr/bin"];
        let protected: Vec<PathBuf> = paths
            .iter()
            .filter(|path| protected_set.contains(&path.as_str()))
            .map(PathBuf::from)
            .collect();
        let sip_bin = runner.make_temp("sip_bin")?;
        make_sip_workaround_copy(&protected, &sip_bin)?;
        paths.retain(|path| !protected_set.contains(&path.as_str()));
        paths.insert(0, sip_bin.to_string_lossy().into_owned());
    }

    let unsupported_bin = runner.make_temp("unsup_bin")?;
    let mut unsupported = vec!["ping", "traceroute"];
    if replace_dns_tools {
        unsupported.extend(["nslookup", "dig", "host"]);
    }
    make_unsupported_tools(&unsupported, &unsupported_bin)?;
    paths.insert(0, unsupported_bin.to_string_lossy().into_owned());

    Ok(paths.join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_tools_fail_with_a_known_exit_code() {
        let dir = std::env::temp_dir().join(format!("tel-unsup-{:08x}", rand::random::<u32>()));
        std::fs::create_dir_all(&dir).unwrap();
        make_unsupported_tools(&["ping"], &dir).unwrap();
        let script = std::fs::read_to_string(dir.join("ping")).unwrap();
        assert!(script.contains("ping is not supported under Telepresence."));
        assert!(script.contains("exit 55"));
        let mode = std::fs::metadata(dir.join("ping")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
