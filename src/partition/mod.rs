//! Keyspace partitioning.
//!
//! A job's UUID keyspace is cut into one contiguous slice per worker with
//! [`PartitionRange`]. The master uses the same range to route relay messages
//! to the worker that owns their destination.

pub mod range;

pub use range::PartitionRange;
