//! Core traits for the switchboard.
//!
//! - `events`: observability sink seam (EventEmitter)

pub mod events;

pub use events::*;
