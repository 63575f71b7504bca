//! Cloud provider abstraction for cabinetry.
//!
//! This module provides the collaborator traits the platform core depends on
//! (control plane, blob containers, vault secrets, credentials), an
//! in-process backend for tests and local runs, the Azure REST backend, and
//! a registry for resolving a backend by name.
//!
//! # Design Principles
//! - Provider codes pass through untouched: backends never decide what a
//!   rejection means
//! - Async operations: every remote call is async
//! - Secrets (tokens, account keys) are zeroized on drop and redacted in debug output

pub mod api;
pub mod azure;
pub mod credential;
pub mod memory;
pub mod registry;
pub mod sas;

pub use api::{
    AccountKey, BlobApi, CloudBackend, ManagementApi, ResourceGroup, RoleAssignment,
    RoleAssignmentRequest, SasPermissions, SecretApi, StorageAccount, StorageAccountParams,
    Subscription, Vault, VaultParams,
};
pub use credential::{
    principal_id_from_token, AccessToken, ChainedCredential, StaticTokenCredential,
    TokenCredential,
};
pub use memory::{Call, MemoryCloud, Operation, MEMORY_PRINCIPAL_ID};
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
