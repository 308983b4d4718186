//! hermes-sshappbackend/src/lib.rs
//! A distributed port-forwarding backend: a controller bootstraps an agent
//! binary onto a remote host over SSH, then mediates TCP/UDP traffic between
//! locally-dialed targets and ports the agent exposes on that host.

pub mod agent;
pub mod controller;
pub mod error;
pub mod logging;
pub mod session;
pub mod wire;
