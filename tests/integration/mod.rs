//! Integration test suite for forgeplan.
//!
//! These tests drive the public API across module boundaries: loading a
//! plan, walking tasks through the queue, running the phase loop, and
//! reloading state from disk as a fresh process would.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Plan analysis and the full phase loop
//! - `recovery`: Checkpoints, rollback, and reload through `FileStore`
//! - `parallel_dispatch`: Concurrent execution with the level dispatcher
//! - `performance`: Planning cost on large graphs

mod fixtures;

mod parallel_dispatch;
mod performance;
mod recovery;
mod workflow_e2e;
