//! Common types shared across the Kiro gateway workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
