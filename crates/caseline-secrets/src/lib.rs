//! Caseline secret access.
//!
//! Credentials and runtime configuration live in an external secret-management
//! service that rotates them on its own schedule. This crate provides:
//!
//! - [`SecretStore`]: the fetch contract consumed from that service, with an
//!   in-process ([`MemorySecretStore`]) and a file-backed
//!   ([`FileSecretStore`]) implementation.
//! - [`CredentialCache`]: TTL cache with single-flight fetches, stale
//!   fallback and invalidation for rotation.
//! - [`SecretsHealth`]: process-wide reachability summary used to detect
//!   degraded operation.

pub mod cache;
pub mod error;
pub mod health;
pub mod secret;
pub mod store;

pub use cache::{CacheStats, CredentialCache, DEFAULT_DEGRADATION_WINDOW, EntryStats};
pub use error::{SecretsError, SecretsResult};
pub use health::{HealthSummary, SecretsHealth};
pub use secret::SecretValue;
pub use store::{FileSecretStore, MemorySecretStore, SecretStore};
