//! Test support utilities for ACP integration tests
//!
//! This module provides mock agents and test helpers for integration testing.

pub mod mock_stdio_agent;

pub use mock_stdio_agent::{MockStdioAgent, MockStdioAgentConfig, AgentBehavior};
