//! Integration Tests Module
//!
//! End-to-end tests for deep-query: the orchestrator driving the step
//! executor against scripted model and query fakes, the response cache, the
//! SQL gate, and the HTTP step loop over a real socket.

// Scripted LlmProvider / QueryExecutor fakes shared by the suites
mod support;

// Orchestrator lifecycle, budget, cancellation and repair scenarios
mod orchestrator_test;

// Response cache properties and the single-shot path
mod cache_test;

// SQL safety gate properties
mod sql_guard_test;

// Orchestrator over HttpStepClient against a live router
mod http_loop_test;
