//! hermes-sshappbackend/src/controller/mod.rs
//! The controller role: bootstraps the agent over SSH and mediates the
//! proxy registry and UDP translation cache against it (§4.E, §4.F, §4.H).

pub mod bootstrap;
pub mod registry;
pub mod udp_cache;
