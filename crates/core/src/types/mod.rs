//! Core type definitions for the switchboard.
//!
//! Broken down by pipeline stage.

pub mod chat;
pub mod context;
pub mod decision;
pub mod identity;
pub mod upstream;

pub use chat::*;
pub use context::*;
pub use decision::*;
pub use identity::*;
pub use upstream::*;
