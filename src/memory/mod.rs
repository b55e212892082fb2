//! Exemplar memory used as few-shot guidance.
//!
//! ```text
//!  PASS ──► GoldenSetStore (golden_set.jsonl, capped)
//!       └─► RunHistoryIndexer (runs/*.json) ──► docdex index ──► find_similar
//! ```
//!
//! Both stores rank results by token overlap with the query.

mod golden;
mod history;

pub use golden::{GoldenSetEntry, GoldenSetStore};
pub use history::{HistoryExample, RunHistoryIndexer, RunSummary};
