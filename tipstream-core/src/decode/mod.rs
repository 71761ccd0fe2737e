//! Partial-document decoding.
//!
//! ```text
//! stream increment ─► buffer.push_str ─► decode / decode_lenient (pure)
//!                                              │ Some(doc)
//!                                        TipMerger::merge (caller-owned)
//!                                              │ changed
//!                                        publish partial
//! ```

pub mod merge;
pub mod partial;

pub use merge::TipMerger;
pub use partial::{decode, decode_lenient};
