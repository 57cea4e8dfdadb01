//! Loads the allowlist from its YAML file and resolves it against the
//! currently registered containers.

use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::container::Container;
use crate::packet::Proto;
use crate::policy::{Communication, IpNet, NetParseError, Policy, ProcessRule, SocketRule};

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("reading policy file {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("malformed policy file")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Net(#[from] NetParseError),

    #[error("socket rule names both remote_ip and remote_container")]
    ConflictingRemote,

    #[error("remote container {0:?} is not running")]
    UnknownRemoteContainer(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<PolicyDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDoc {
    container: ContainerDoc,
    #[serde(default)]
    communications: Vec<CommunicationDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerDoc {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommunicationDoc {
    #[serde(default)]
    processes: Vec<ProcessDoc>,
    #[serde(default)]
    sockets: Vec<SocketDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessDoc {
    #[serde(default)]
    executable: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SocketDoc {
    protocol: String,
    #[serde(default)]
    remote_ip: Option<String>,
    #[serde(default)]
    remote_container: Option<ContainerDoc>,
    #[serde(default)]
    local_port: u16,
    #[serde(default)]
    remote_port: u16,
}

/// Reads and resolves the policy file. Rules naming a remote container are
/// pinned to that container's current addresses, so the result is only
/// valid for the given registry snapshot.
pub fn load(path: &Path, containers: &[Arc<Container>]) -> Result<Vec<Policy>, PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|source| PolicyError::ReadFile {
        source,
        path: path.display().to_string(),
    })?;
    let file: PolicyFile = serde_yaml::from_str(&text)?;

    let mut policies = Vec::with_capacity(file.policies.len());
    for doc in file.policies {
        let mut communications = Vec::with_capacity(doc.communications.len());
        for communication in doc.communications {
            let processes = communication
                .processes
                .into_iter()
                .map(|p| ProcessRule {
                    executable: p.executable,
                    path: p.path,
                })
                .collect();
            let mut sockets = Vec::new();
            for socket in communication.sockets {
                resolve_socket_rules(socket, containers, &mut sockets)?;
            }
            communications.push(Communication { processes, sockets });
        }
        policies.push(Policy {
            container: Container::selector(&doc.container.id, &doc.container.name),
            communications,
        });
    }
    Ok(policies)
}

fn resolve_socket_rules(
    doc: SocketDoc,
    containers: &[Arc<Container>],
    out: &mut Vec<SocketRule>,
) -> Result<(), PolicyError> {
    let protocol = parse_protocol(&doc.protocol)?;
    match (doc.remote_ip, doc.remote_container) {
        (Some(_), Some(_)) => Err(PolicyError::ConflictingRemote),
        (Some(ip), None) => {
            out.push(SocketRule {
                protocol,
                remote_net: Some(ip.parse()?),
                local_port: doc.local_port,
                remote_port: doc.remote_port,
            });
            Ok(())
        }
        (None, Some(remote)) => {
            let selector = Container::selector(&remote.id, &remote.name);
            let resolved = containers
                .iter()
                .find(|c| c.matches(&selector))
                .ok_or_else(|| {
                    PolicyError::UnknownRemoteContainer(selector.identity().to_owned())
                })?;
            // One host rule per address the remote currently holds.
            for address in &resolved.ip_addresses {
                out.push(SocketRule {
                    protocol,
                    remote_net: Some(IpNet::host(*address)),
                    local_port: doc.local_port,
                    remote_port: doc.remote_port,
                });
            }
            Ok(())
        }
        (None, None) => {
            out.push(SocketRule {
                protocol,
                remote_net: None,
                local_port: doc.local_port,
                remote_port: doc.remote_port,
            });
            Ok(())
        }
    }
}

fn parse_protocol(name: &str) -> Result<Proto, PolicyError> {
    match name.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Proto::Tcp),
        "udp" => Ok(Proto::Udp),
        "icmp" => Ok(Proto::Icmp4),
        "icmpv6" | "icmp6" => Ok(Proto::Icmp6),
        _ => Err(PolicyError::UnknownProtocol(name.to_owned())),
    }
}
