//! Builder output handling.
//!
//! Model output is an opaque string until it passes through here:
//! [`normalize_patch_output`] recovers the JSON payload from fences, prose and
//! prefixes, [`parse_patch_output`] turns it into typed [`PatchOperation`]s or a
//! specific [`PatchParseError`], and [`PatchInterpreter`] asks the model to
//! reformat output that fails to parse.

mod interpreter;
mod normalize;
mod parse;

pub use interpreter::{Interpretation, PatchInterpreter};
pub use normalize::normalize_patch_output;
pub use parse::{parse_patch_output, touched_files, PatchFormat, PatchOperation, PatchParseError};
