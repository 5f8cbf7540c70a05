//! Core subsystems for the tb-agent daemon.
//!
//! The binary crate wires these together; everything long-lived lives here:
//! the gateway transport, the PTY session multiplexer, command signing and
//! audit, the cluster insight/remediation pipeline, and the scan/upload loop.

pub mod agent;
pub mod audit;
pub mod cluster;
pub mod commands;
pub mod gateway;
pub mod identity;
pub mod insights;
pub mod poller;
pub mod protocol;
pub mod pty;
pub mod remediation;
pub mod scan;
pub mod sessions;
pub mod signing;
pub mod upload;
