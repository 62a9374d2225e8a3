//! Idle and prompt heuristics.
//!
//! `content` matches prompt text in a tool's output and runs inside the
//! wrapper. `census` inspects terminal foreground process groups and runs in
//! the controller. Both feed the same lifecycle signals.

pub mod census;
pub mod content;

pub use census::{Activity, ForegroundClassifier, ProcessTable, PsCensus};
pub use content::{ContentMatcher, ContentSignal};
