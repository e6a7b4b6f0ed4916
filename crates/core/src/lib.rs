#![deny(unused)]
//! Core types, traits, and error definitions for the switchboard.
//!
//! This crate provides the building blocks shared by the governance and
//! gateway layers: the error taxonomy, layered configuration, the request
//! data model and the observability event envelope.

pub mod config;
pub mod error;
pub mod events;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use events::*;
pub use traits::*;
pub use types::*;
