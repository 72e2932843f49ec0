//! `gits-core`: configuration, shared identifiers and the top-level error type.

pub mod bundle;
pub mod config;
pub mod error;
pub mod types;

pub use bundle::ContentBundle;
pub use error::{ErrorClass, GitsError, Result};
pub use types::{JobId, OwnerId};
