//! Ergonomic result alias for the core crate.

use crate::errors::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
