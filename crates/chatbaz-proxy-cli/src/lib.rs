//! Support library for the `chatbaz-proxy` binary.
//!
//! Split out of the binary so the forwarding engine can be exercised by
//! integration tests.

pub mod commands;
pub mod engine;
pub mod logging;
