//! Integration tests for vigil-bot.
//!
//! These tests verify the interaction between components:
//! - Admission control in front of the paper exchange
//! - Exit rules driving real executions
//! - Durable state across controller restarts

pub mod common;
