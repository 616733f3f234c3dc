//! Local process tracking crate.
//!
//! This crate holds the node-local half of cluster-wide process visibility:
//! which statements an instance is running, how far along they are, and the
//! signal a requester waits on while other instances report in. Higher layers
//! inject a `ProcessRegistry` and drive it through `ProcessEngine`.

pub mod process;
