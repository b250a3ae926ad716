//! Common utilities and types shared across Relay components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
