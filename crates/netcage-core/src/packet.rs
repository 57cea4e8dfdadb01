//! Decoding of the raw IP packets delivered by the netfilter queue.
//!
//! Only the headers needed to classify a communication are extracted: the
//! network layer addresses, the transport protocol and its ports, and the
//! ICMP echo identifier used for process disambiguation.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("packet truncated ({got} bytes, {want} needed)")]
    Truncated { got: usize, want: usize },
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
}

/// Transport protocol of a packet, from the IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp4,
    Icmp6,
    Other(u8),
}

impl Proto {
    fn from_ip_number(number: u8) -> Self {
        match number {
            1 => Proto::Icmp4,
            6 => Proto::Tcp,
            17 => Proto::Udp,
            58 => Proto::Icmp6,
            n => Proto::Other(n),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "TCP"),
            Proto::Udp => write!(f, "UDP"),
            Proto::Icmp4 => write!(f, "ICMPv4"),
            Proto::Icmp6 => write!(f, "ICMPv6"),
            Proto::Other(n) => write!(f, "IPPROTO({n})"),
        }
    }
}

/// Transport header fields relevant for classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Ports { src_port: u16, dst_port: u16 },
    Icmp { kind: u8, echo_id: Option<u16> },
    /// Unparsed transport (unknown protocol or non-leading fragment).
    Opaque,
}

/// A decoded IP packet.
#[derive(Debug, Clone)]
pub struct IpPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: Proto,
    pub transport: Transport,
}

impl IpPacket {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let first = *data.first().ok_or(PacketError::Truncated { got: 0, want: 1 })?;
        match first >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(PacketError::UnsupportedVersion(v)),
        }
    }

    pub fn echo_identifier(&self) -> Option<u16> {
        match self.transport {
            Transport::Icmp { echo_id, .. } => echo_id,
            _ => None,
        }
    }

    fn parse_v4(data: &[u8]) -> Result<Self, PacketError> {
        check_len(data, 20)?;
        let header_len = usize::from(data[0] & 0x0f) * 4;
        check_len(data, header_len)?;
        let proto = Proto::from_ip_number(data[9]);
        let src = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
        let dst = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
        let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1fff;
        let transport = if fragment_offset != 0 {
            // Transport headers live in the leading fragment only.
            Transport::Opaque
        } else {
            parse_transport(proto, &data[header_len..])
        };
        Ok(IpPacket {
            src,
            dst,
            proto,
            transport,
        })
    }

    fn parse_v6(data: &[u8]) -> Result<Self, PacketError> {
        check_len(data, 40)?;
        let src = IpAddr::V6(Ipv6Addr::from(
            <[u8; 16]>::try_from(&data[8..24]).unwrap(),
        ));
        let dst = IpAddr::V6(Ipv6Addr::from(
            <[u8; 16]>::try_from(&data[24..40]).unwrap(),
        ));

        let mut next_header = data[6];
        let mut offset = 40usize;
        loop {
            match next_header {
                // hop-by-hop, routing, destination options
                0 | 43 | 60 => {
                    check_len(data, offset + 2)?;
                    next_header = data[offset];
                    offset += (usize::from(data[offset + 1]) + 1) * 8;
                }
                // fragment header
                44 => {
                    check_len(data, offset + 8)?;
                    let frag_offset =
                        u16::from_be_bytes([data[offset + 2], data[offset + 3]]) >> 3;
                    let proto = Proto::from_ip_number(data[offset]);
                    let transport = if frag_offset != 0 {
                        Transport::Opaque
                    } else {
                        parse_transport(proto, &data[offset + 8..])
                    };
                    return Ok(IpPacket {
                        src,
                        dst,
                        proto,
                        transport,
                    });
                }
                _ => break,
            }
        }

        let proto = Proto::from_ip_number(next_header);
        check_len(data, offset)?;
        let transport = parse_transport(proto, &data[offset..]);
        Ok(IpPacket {
            src,
            dst,
            proto,
            transport,
        })
    }
}

fn parse_transport(proto: Proto, data: &[u8]) -> Transport {
    match proto {
        Proto::Tcp | Proto::Udp if data.len() >= 4 => Transport::Ports {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
        },
        Proto::Icmp4 if !data.is_empty() => Transport::Icmp {
            kind: data[0],
            // The identifier field is read for every ICMPv4 type: types
            // without one carry zeroes there, which never matches a NSpid.
            echo_id: (data.len() >= 6).then(|| u16::from_be_bytes([data[4], data[5]])),
        },
        Proto::Icmp6 if !data.is_empty() => Transport::Icmp {
            kind: data[0],
            // Echo request/reply are the only ICMPv6 types with an identifier.
            echo_id: (matches!(data[0], 128 | 129) && data.len() >= 6)
                .then(|| u16::from_be_bytes([data[4], data[5]])),
        },
        _ => Transport::Opaque,
    }
}

fn check_len(data: &[u8], want: usize) -> Result<(), PacketError> {
    if data.len() < want {
        return Err(PacketError::Truncated {
            got: data.len(),
            want,
        });
    }
    Ok(())
}
