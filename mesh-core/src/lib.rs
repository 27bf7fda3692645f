//! Node-local primitives for the overlay mesh controller: the command
//! seam, address derivation, the peer table, and the compartment/tunnel/
//! reconciler operations built on top of them.
//!
//! This crate is deliberately orchestrator-agnostic — it knows nothing about
//! Kubernetes. `mesh-controller` adapts cluster objects into [`host::NodeView`]
//! and drives these primitives from its watch loop.

pub mod command;
pub mod compartment;
pub mod error;
pub mod host;
pub mod iface;
pub mod keys;
pub mod peer;
pub mod reconcile;
pub mod tunnel;

pub use error::{Error, Result};
