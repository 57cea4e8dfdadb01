//! Docker Engine API client over the daemon's unix socket.
//!
//! Only the handful of endpoints needed to track container lifecycles is
//! covered: listing, inspection, and the event feed.

pub mod client;
pub mod dto;
pub mod error;

pub use client::{DockerClient, EventStream};
pub use error::DockerError;

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
pub const DEFAULT_PIDFILE: &str = "/var/run/docker.pid";
