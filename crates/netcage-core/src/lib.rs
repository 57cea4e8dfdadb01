//! Core engines of netcage: packet decoding, socket classification,
//! packet-to-process resolution over procfs and policy matching.
//!
//! Everything in this crate is synchronous; blocking procfs reads are meant
//! to run inside worker tasks of the daemon's event pipeline.

pub mod cache;
pub mod container;
pub mod judge;
pub mod packet;
pub mod policy;
pub mod proc;
pub mod socket;

pub use judge::{Judge, Verdict};
