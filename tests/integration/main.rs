//! Integration test binary -- all integration tests consolidated into a single
//! binary to keep link times down.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod orchestrator_flow;
