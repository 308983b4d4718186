//! hermes-sshappbackend/src/agent/mod.rs
//! The agent role: the binary that runs on the remote host and answers the
//! controller's control-plane traffic (§4.E step 6, §4.G).

pub mod runtime;
