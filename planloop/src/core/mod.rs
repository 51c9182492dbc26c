//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod commit;
pub mod plan;
pub mod session;
pub mod stream;
pub mod template;
pub mod types;
pub mod workflow;
