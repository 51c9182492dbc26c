//! I/O for planloop runs: files, processes, git and the terminal.

pub mod agent;
pub mod config;
pub mod git;
pub mod keyboard;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod run_log;
pub mod shell;
pub mod workflow_store;
