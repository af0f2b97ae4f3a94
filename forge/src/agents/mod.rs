//! Agents that consult the reasoning oracle.

pub mod clarifier;
