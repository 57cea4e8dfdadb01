//! Wire representations of the Engine API responses we consume.

use std::collections::HashMap;

use nix::unistd::Pid;
use serde::Deserialize;

use netcage_core::container::Container;

use crate::error::DockerError;

/// One element of `GET /containers/json`.
#[derive(Debug, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
}

/// The fields of `GET /containers/{id}/json` we care about.
#[derive(Debug, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "State")]
    pub state: ContainerState,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Pid", default)]
    pub pid: i32,
    #[serde(rename = "Running", default)]
    pub running: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, Network>,
}

#[derive(Debug, Deserialize)]
pub struct Network {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "GlobalIPv6Address", default)]
    pub global_ipv6_address: String,
}

impl ContainerInspect {
    /// Converts the inspection into the enforcement-side container record.
    /// Fails if the container is not running, since there is no PID to
    /// resolve processes under.
    pub fn into_container(self) -> Result<Container, DockerError> {
        if !self.state.running || self.state.pid == 0 {
            return Err(DockerError::ContainerNotRunning(self.id));
        }
        let mut container = Container::selector(self.id, self.name);
        container.pid = Pid::from_raw(self.state.pid);
        for network in self.network_settings.networks.values() {
            for address in [&network.ip_address, &network.global_ipv6_address] {
                if address.is_empty() {
                    continue;
                }
                if let Ok(parsed) = address.parse() {
                    container.ip_addresses.push(parsed);
                }
            }
        }
        Ok(container)
    }
}

/// One line of the `GET /events` feed.
#[derive(Debug, Deserialize)]
pub struct Event {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: Actor,
}

#[derive(Debug, Default, Deserialize)]
pub struct Actor {
    #[serde(rename = "ID", default)]
    pub id: String,
}
