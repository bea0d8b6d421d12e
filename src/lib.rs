//! ANA CTF Instancer - per-team challenge sandboxes on top of Docker
//!
//! The binary in `main.rs` wires these modules together; everything here is
//! usable (and tested) without Redis or a Docker daemon.

pub mod challenges;
pub mod config;
pub mod error;
pub mod jobs;
pub mod redis_manager;
pub mod runtime;
pub mod sandbox;

#[cfg(test)]
pub(crate) mod testing;
