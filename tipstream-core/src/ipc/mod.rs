//! Types serialised to subscribers and status observers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize`; subscribers
//! receive them as UTF-8 JSON text.

pub mod events;
