//! Routing: alias resolution and upstream key selection.
//!
//! The model router turns a client-visible alias into the ordered candidate
//! list the dispatch engine walks; the key selector picks one healthy
//! credential per candidate and tracks per-key health locally.

mod aliases;
mod keys;

pub use aliases::{Candidate, ModelRouter};
pub use keys::{KeySelector, KeyVerdict, SelectionStrategy};
