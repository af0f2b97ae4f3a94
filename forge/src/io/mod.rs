//! Side-effecting collaborators: processes, files, SQLite, oracle, events.

pub mod config;
pub mod events;
pub mod executor;
pub mod init;
pub mod oracle;
pub mod process;
pub mod project_context;
pub mod prompt;
pub mod spec_store;
pub mod store;
pub mod validator;
