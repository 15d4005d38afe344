//! Shared types for the token broker workspace

mod clock;
mod error;
mod secret;

pub use clock::now_secs;
pub use error::{Error, Result};
pub use secret::Secret;
