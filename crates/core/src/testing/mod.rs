//! Shared test utilities for microbatch-core.
//!
//! Mock forward passes that let the decode loop, the rank workers and the
//! executor run without a real model.

mod mock_model;

pub use mock_model::{EchoModel, MockModelForward, ScriptedModel};
