//! # codeloop
//!
//! Bounded plan/patch/critic orchestration core for autonomous code changes.
//!
//! This library provides:
//! - Per-lane conversation buffers with redaction, budgets, and summarization
//! - Context bundle assembly backed by a documentation index (docdex)
//! - An evidence gate, an architect planner, a builder, and a critic
//! - A bounded tool-call runner and a workspace mutual-exclusion lock
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │             Pipeline             │
//!        └────────────────┬─────────────────┘
//!                         │
//!        ┌────────────────┼─────────────────┐
//!        ▼                ▼                 ▼
//!  ┌───────────┐   ┌─────────────┐   ┌─────────────┐
//!  │ Librarian │   │  Architect  │   │ Builder ⇄   │
//!  │ (context) │   │  (planner)  │   │ Critic loop │
//!  └───────────┘   └─────────────┘   └─────────────┘
//! ```
//!
//! ## Run Flow
//! 1. Acquire the workspace lock
//! 2. Assemble a context bundle and score it with the evidence gate
//! 3. Plan, then build and critique until PASS or the retry budget runs out
//! 4. Hand a passed patch to the configured applier and record the run
//!
//! ## Modules
//! - `context`: lanes, redaction, file loading, bundle assembly
//! - `agents`: architect, builder, critic phases
//! - `patch`: builder output normalization, parsing, interpretation
//! - `runner`: bounded tool-call loop
//! - `workspace_lock`: run-level mutual exclusion and shutdown handling

pub mod agents;
pub mod config;
pub mod context;
pub mod cost;
pub mod docdex;
pub mod evidence;
pub mod logging;
pub mod memory;
pub mod patch;
pub mod pipeline;
pub mod provider;
pub mod runner;
pub mod tools;
pub mod util;
pub mod validation;
pub mod workspace_lock;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineOutcome, PipelineReport};
pub use workspace_lock::WorkspaceLock;
