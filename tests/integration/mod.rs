//! Integration test suite for Briareus.
//!
//! These tests drive full runs through the supervisor with scripted agent
//! handles, from decomposition to final output or failure report.
//!
//! # Test Categories
//!
//! - `scenarios`: End-to-end research/code/write runs
//! - `retry`: Retry, escalation and feedback propagation
//! - `cascade`: Planning errors and cascading failures
//! - `concurrency`: Dispatch limits, budget and cancellation
//! - `determinism`: Synthesis independent of completion order
//! - `resume`: Continuing runs from snapshots
//! - `process_agents`: Command-backed agents and planners
//!
//! # CI Compatibility
//!
//! Agents are in-process fakes or standard shell utilities (`echo`,
//! `cat`), so the suite needs no network or model access.


mod cascade;
mod determinism;
mod process_agents;
mod resume;
mod retry;
