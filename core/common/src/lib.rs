//! Common utilities and types shared across cabinetry modules.
//!
//! This module provides the error taxonomy, resource identity types and
//! naming rules used by the cloud backends and the platform core.

pub mod error;
pub mod lookup;
pub mod naming;
pub mod types;

pub use error::{Error, ProviderError, Result};
pub use lookup::{classify, Lookup};
pub use types::{ResourceDescriptor, ResourceKind};
