//! # Commands Module
//!
//! Command handlers for the driftstore binary:
//!
//! ## `serve`
//! Runs a single replication node:
//! - Binds the listen address and accepts peer connections
//! - Dials the configured bootstrap peers
//! - Persists stored values and replicates them to the mesh
//!
//! ## `demo`
//! Runs a three-node replication demonstration inside one process:
//! - Two seed nodes plus one node bootstrapping to both
//! - Stores a value, deletes the local copy, refetches it from the mesh

pub mod demo;
pub mod serve;
