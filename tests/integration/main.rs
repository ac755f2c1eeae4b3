//! Integration test binary -- every end-to-end scenario links into one
//! binary so the scripted engines and the pipeline are only built once.

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod helpers;

mod barge_in;
mod conversation_flow;
mod error_recovery;
mod streaming;
