//! GDS Common - Shared types and utilities
//!
//! This crate provides the value model, scope and rank addressing, the key
//! dictionary, error definitions, configuration and the wire buffer used by
//! both storage backends.

pub mod codec;
pub mod compress;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod keys;
pub mod logging;
pub mod types;

pub use codec::{ModexKeyFormat, WireBuffer};
pub use config::{GdsConfig, HashConfig, LoggingConfig, ShmemConfig, VmHoleKind};
pub use dictionary::{KeyDictionary, KeyId};
pub use error::{Error, Result};
pub use types::*;
