//! Report queues
//!
//! Fixed-capacity rings of POD access reports shared with one client,
//! multiplexed per client with round-robin enqueue and FIFO pairing of
//! notification ports and consumer handles.

pub mod mux;
pub mod ring;

pub use mux::{QueueConsumer, ReportMultiplexer};
pub use ring::{queue_capacity_for_mib, ReportRing, SharedReportQueue};
