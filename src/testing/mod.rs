//! Testing utilities and mock implementations
//!
//! This module provides mock implementations for testing the pipeline
//! without requiring external services like a scorer, a knowledge base or a
//! trace log.

pub mod mocks;

pub use mocks::*;
