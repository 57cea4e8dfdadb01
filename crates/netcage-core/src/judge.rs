//! End-to-end judgment of one queued packet.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::container::ContainerRegistry;
use crate::packet::IpPacket;
use crate::policy::PolicyEngine;
use crate::proc::ProcessResolver;
use crate::socket;

/// Final decision for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "ACCEPT"),
            Verdict::Drop => write!(f, "DROP"),
        }
    }
}

/// Runs the full pipeline for one packet: decode, attribute to a container,
/// resolve the owning process, evaluate policy.
///
/// Every failure along the way drops the packet; only a fully attributed
/// communication explicitly allowed by policy passes.
pub struct Judge {
    registry: Arc<ContainerRegistry>,
    resolver: ProcessResolver,
    engine: PolicyEngine,
}

impl Judge {
    pub fn new(registry: Arc<ContainerRegistry>, resolver: ProcessResolver, engine: PolicyEngine) -> Self {
        Judge {
            registry,
            resolver,
            engine,
        }
    }

    pub fn judge(&self, payload: &[u8]) -> Verdict {
        let started = Instant::now();

        let packet = match IpPacket::parse(payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("dropping undecodable packet: {err}");
                return Verdict::Drop;
            }
        };

        let snapshot = self.registry.snapshot();
        let (socket, container, direction) = match socket::classify(&packet, &snapshot) {
            Ok(classified) => classified,
            Err(err) => {
                warn!("dropping packet: {err} ({:?})", started.elapsed());
                return Verdict::Drop;
            }
        };

        let process = match self.resolver.resolve(&socket, &container, &packet) {
            Ok(process) => process,
            Err(err) => {
                warn!(
                    "dropping {direction:?} {socket} of {container}: {err} ({:?})",
                    started.elapsed()
                );
                return Verdict::Drop;
            }
        };

        let verdict = if self.engine.decide(&container, &process, &socket) {
            Verdict::Accept
        } else {
            Verdict::Drop
        };
        debug!(
            "{verdict} {direction:?} {socket} by {process} of {container} ({:?})",
            started.elapsed()
        );
        verdict
    }

    /// Forgets every memoized lookup and verdict. Called when the container
    /// set or the policy changes.
    pub fn flush_caches(&self) {
        self.resolver.flush_cache();
        self.engine.flush_cache();
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }
}
