//! Socket classification: which container a packet belongs to, which side
//! of the communication is the container's, and on which ports.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::container::Container;
use crate::packet::{IpPacket, Proto, Transport};

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("no registered container communicates as {src} -> {dst}")]
    ContainerNotFound { src: IpAddr, dst: IpAddr },
}

/// Which way the packet crosses the container boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A communication endpoint pair, normalized so `local_*` always refers to
/// the container side regardless of packet direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socket {
    pub protocol: Proto,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{protocol:{} local:{}:{} remote:{}:{}}}",
            self.protocol, self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// Finds the container whose address set contains one side of the packet
/// and derives the normalized socket. Pure function of the packet and the
/// registry snapshot; packets matching no container fail closed upstream.
pub fn classify(
    packet: &IpPacket,
    containers: &[Arc<Container>],
) -> Result<(Socket, Arc<Container>, Direction), ClassifyError> {
    let mut found = None;
    'scan: for container in containers {
        for address in &container.ip_addresses {
            if *address == packet.src {
                found = Some((container.clone(), Direction::Outbound));
                break 'scan;
            } else if *address == packet.dst {
                found = Some((container.clone(), Direction::Inbound));
                break 'scan;
            }
        }
    }
    let (container, direction) = found.ok_or(ClassifyError::ContainerNotFound {
        src: packet.src,
        dst: packet.dst,
    })?;

    let (local_ip, remote_ip) = match direction {
        Direction::Outbound => (packet.src, packet.dst),
        Direction::Inbound => (packet.dst, packet.src),
    };
    let (local_port, remote_port) = match packet.transport {
        Transport::Ports { src_port, dst_port } => match direction {
            Direction::Outbound => (src_port, dst_port),
            Direction::Inbound => (dst_port, src_port),
        },
        // Portless protocols (ICMP) leave both ends at zero.
        _ => (0, 0),
    };

    Ok((
        Socket {
            protocol: packet.proto,
            local_ip,
            remote_ip,
            local_port,
            remote_port,
        },
        container,
        direction,
    ))
}
