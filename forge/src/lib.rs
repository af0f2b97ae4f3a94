//! PRD-to-code orchestration core.
//!
//! Takes a natural-language requirements document through clarification,
//! spec generation, bounded agent iterations with test validation, and either
//! success or escalation to a human. Outcomes are recorded so later runs can
//! reuse mined playbooks. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, the iteration
//!   controller, spec composition, playbook selection and mining). No I/O.
//! - **[`io`]**: Side-effecting collaborators (processes, SQLite, files, the
//!   reasoning oracle, event publishing). Each sits behind a trait so tests can
//!   script it.
//!
//! [`orchestrate`] ties them together for `forge run`; [`mine`] drives the
//! playbook mining pass.

pub mod active;
pub mod agents;
pub mod cancel;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mine;
pub mod orchestrate;
pub mod spec_builder;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
