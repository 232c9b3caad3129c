//! Integration tests for llm-caching
//!
//! These tests drive the caching runner end to end against scripted agents
//! and in-memory or failing stores, and exercise the command line tool.

// Test utilities and common setup
mod common;

mod cli_tests;
mod runner_tests;

// Re-export common utilities for use by test modules
pub use common::*;
