//! Allowlist policy model: which processes of which containers may talk to
//! which remote endpoints.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::container::Container;
use crate::packet::Proto;
use crate::proc::Process;
use crate::socket::Socket;

pub mod engine;
pub mod loader;

pub use engine::PolicyEngine;
pub use loader::{PolicyError, load};

#[derive(Error, Debug)]
pub enum NetParseError {
    #[error("invalid IP network {0:?}")]
    Invalid(String),
}

/// An IP network in CIDR notation. A bare address parses as a host network
/// (/32 or /128).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    addr: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, NetParseError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(NetParseError::Invalid(format!("{addr}/{prefix}")));
        }
        Ok(IpNet { addr, prefix })
    }

    pub fn host(addr: IpAddr) -> Self {
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNet { addr, prefix }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_bits(u32::from(net) as u128, self.prefix, 32);
                mask_bits(u32::from(ip) as u128, self.prefix, 32) == mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_bits(u128::from(net), self.prefix, 128);
                mask_bits(u128::from(ip), self.prefix, 128) == mask
            }
            _ => false,
        }
    }
}

fn mask_bits(value: u128, prefix: u8, width: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    value >> u32::from(width - prefix)
}

impl FromStr for IpNet {
    type Err = NetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetParseError::Invalid(s.to_owned());
        match s.split_once('/') {
            Some((addr, prefix)) => IpNet::new(
                addr.parse().map_err(|_| invalid())?,
                prefix.parse().map_err(|_| invalid())?,
            ),
            None => Ok(IpNet::host(s.parse().map_err(|_| invalid())?)),
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Selects processes by executable name, image path, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRule {
    pub executable: String,
    pub path: String,
}

impl ProcessRule {
    /// Same decision rule as process identity: known paths on both sides are
    /// decisive, otherwise executable names decide.
    pub fn matches(&self, process: &Process) -> bool {
        if !self.path.is_empty() && !process.path.is_empty() {
            return self.path == process.path;
        }
        !self.executable.is_empty() && self.executable == process.executable
    }
}

/// Selects communications by protocol, remote network, and ports. Zero
/// ports and an absent network are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRule {
    pub protocol: Proto,
    pub remote_net: Option<IpNet>,
    pub local_port: u16,
    pub remote_port: u16,
}

impl SocketRule {
    pub fn matches(&self, socket: &Socket) -> bool {
        if self.protocol != socket.protocol {
            return false;
        }
        if self.local_port != 0 && self.local_port != socket.local_port {
            return false;
        }
        if self.remote_port != 0 && self.remote_port != socket.remote_port {
            return false;
        }
        match self.remote_net {
            Some(net) => net.contains(socket.remote_ip),
            None => true,
        }
    }
}

/// One permitted communication pattern: any listed process over any listed
/// socket shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communication {
    pub processes: Vec<ProcessRule>,
    pub sockets: Vec<SocketRule>,
}

impl Communication {
    pub fn permits(&self, process: &Process, socket: &Socket) -> bool {
        self.processes.iter().any(|rule| rule.matches(process))
            && self.sockets.iter().any(|rule| rule.matches(socket))
    }
}

/// The allowlist of one container.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Container selector; matched by ID prefix or name.
    pub container: Container,
    pub communications: Vec<Communication>,
}

impl Policy {
    pub fn permits(&self, container: &Container, process: &Process, socket: &Socket) -> bool {
        self.container.matches(container)
            && self
                .communications
                .iter()
                .any(|communication| communication.permits(process, socket))
    }
}
