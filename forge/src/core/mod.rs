//! Deterministic, pure logic shared by the orchestration core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod controller;
pub mod playbook;
pub mod spec;
pub mod text;
pub mod types;
