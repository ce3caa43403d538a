//! Capture core for a fast-acquisition data archiver.
//!
//! The crate is split along the pipeline stages data flows through: a
//! sniffer device adapter fills a RAM ring buffer, a transform worker
//! drains a reserved reader of it into a disk writer, and the disk writer
//! applies the on-disk layout a separate planner computes. The
//! orchestrator ties the three worker threads together with a fixed
//! startup/shutdown order.

pub mod config;
pub mod error;
pub mod layout;
pub mod mask;
pub mod orchestrator;
pub mod ring_buffer;
pub mod sniffer;
pub mod transform;
pub mod writer;

pub use error::{Error, Result};
