//! End-to-end test support for the memory engine
//!
//! Provides a temp-database harness wiring the full stack (graph store,
//! relational store, pipeline, retriever, orchestrator) against a scripted
//! mock provider, so journey tests exercise real storage and ranking without
//! touching any network.

pub mod harness;
pub mod mocks;
