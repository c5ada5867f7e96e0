use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortMappingError {
    #[error("Invalid port specification {0:?}; use PORT or LOCAL:REMOTE")]
    Invalid(String),
    #[error("Local port {0} was given more than once")]
    DuplicateLocal(u16),
    #[error("Remote port {0} was given more than once")]
    DuplicateRemote(u16),
}

/// Maps local ports to remote exposed ports.
///
/// Entries arrive from two places: explicit `--expose L[:R]` options and the
/// container ports of a swapped Deployment. Remote ports are unique, and
/// explicit entries always win over automatic ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMapping {
    mapping: BTreeMap<u16, u16>,
}

impl PortMapping {
    /// Parse a list of `PORT` or `LOCAL:REMOTE` strings.
    pub fn parse<S: AsRef<str>>(port_strings: &[S]) -> Result<PortMapping, PortMappingError> {
        let mut result = PortMapping::default();
        for port_string in port_strings {
            let text = port_string.as_ref();
            let (local, remote) = match text.split_once(':') {
                Some((local, remote)) => (parse_port(text, local)?, parse_port(text, remote)?),
                None => {
                    let port = parse_port(text, text)?;
                    (port, port)
                }
            };
            if result.mapping.contains_key(&local) {
                return Err(PortMappingError::DuplicateLocal(local));
            }
            if result.remote().contains(&remote) {
                return Err(PortMappingError::DuplicateRemote(remote));
            }
            result.mapping.insert(local, remote);
        }
        Ok(result)
    }

    /// Merge container ports into the mapping as `p -> p` entries. Existing
    /// (explicit) entries win when the remote port is already taken.
    pub fn merge_automatic_ports(&mut self, ports: &[u16]) {
        let remote = self.remote();
        for &port in ports {
            if remote.contains(&port) {
                continue;
            }
            self.mapping.insert(port, port);
        }
    }

    pub fn remote(&self) -> BTreeSet<u16> {
        self.mapping.values().copied().collect()
    }

    pub fn local_to_remote(&self) -> Vec<(u16, u16)> {
        self.mapping.iter().map(|(&l, &r)| (l, r)).collect()
    }

    pub fn has_privileged_ports(&self) -> bool {
        self.remote().iter().any(|&port| port < 1024)
    }

    /// Render back to `--expose` argument form.
    pub fn to_strings(&self) -> Vec<String> {
        self.mapping
            .iter()
            .map(|(&local, &remote)| {
                if local == remote {
                    local.to_string()
                } else {
                    format!("{}:{}", local, remote)
                }
            })
            .collect()
    }
}

fn parse_port(whole: &str, part: &str) -> Result<u16, PortMappingError> {
    part.parse::<u16>()
        .ok()
        .filter(|&port| port != 0)
        .ok_or_else(|| PortMappingError::Invalid(whole.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_paired_ports() {
        let mapping = PortMapping::parse(&["8080", "9090:80"]).unwrap();
        assert_eq!(mapping.local_to_remote(), vec![(8080, 8080), (9090, 80)]);
        assert_eq!(
            mapping.remote().into_iter().collect::<Vec<_>>(),
            vec![80, 8080]
        );
    }

    #[test]
    fn rejects_bad_specifications() {
        assert_eq!(
            PortMapping::parse(&["eighty"]).unwrap_err(),
            PortMappingError::Invalid("eighty".to_string())
        );
        assert_eq!(
            PortMapping::parse(&["80:80:80"]).unwrap_err(),
            PortMappingError::Invalid("80:80:80".to_string())
        );
        assert_eq!(
            PortMapping::parse(&["8080:80", "9090:80"]).unwrap_err(),
            PortMappingError::DuplicateRemote(80)
        );
        assert_eq!(
            PortMapping::parse(&["8080:80", "8080:81"]).unwrap_err(),
            PortMappingError::DuplicateLocal(8080)
        );
    }

    #[test]
    fn explicit_entries_win_over_automatic_ports() {
        let mut mapping = PortMapping::parse(&["9090:80"]).unwrap();
        mapping.merge_automatic_ports(&[80, 8080]);
        assert_eq!(mapping.local_to_remote(), vec![(8080, 8080), (9090, 80)]);
    }

    #[test]
    fn privileged_means_remote_below_1024() {
        assert!(PortMapping::parse(&["8080:80"]).unwrap().has_privileged_ports());
        assert!(!PortMapping::parse(&["80:8080"]).unwrap().has_privileged_ports());
    }

    #[test]
    fn formatting_round_trips_the_arguments() {
        let args = ["443", "9090:80"];
        let mapping = PortMapping::parse(&args).unwrap();
        assert_eq!(mapping.to_strings(), vec!["443", "9090:80"]);
    }
}
