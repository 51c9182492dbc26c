//! Plan-driven agent loop.
//!
//! `planloop` drives an external coding agent through a multi-phase markdown
//! plan, one phase per iteration, with a workflow of agent, shell and internal
//! steps applied to every phase. The architecture keeps a strict split:
//!
//! - **[`core`]**: pure logic (plan parsing, workflow validation, template
//!   rendering, stream decoding, session metering). No I/O.
//! - **[`io`]**: side effects (plan and workflow files, agent and shell
//!   processes, git, terminal input, run logs). Behind traits where tests
//!   need to substitute them.
//!
//! [`engine`] runs the phase/step state machine; [`session_driver`] runs one
//! agent process per agent step; [`control`] merges control signals with agent
//! output; [`events`] carries engine events to renderers without blocking.

pub mod control;
pub mod core;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod preview;
pub mod render;
pub mod session_driver;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
