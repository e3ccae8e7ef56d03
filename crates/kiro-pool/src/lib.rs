//! Account pool and token lifecycle for the Kiro upstream
//!
//! Manages multiple upstream credentials with round-robin selection,
//! quarantine on failure, per-token health tracking with exponential
//! backoff, and proactive background refresh. The credential store is the
//! source of truth for token material; this crate owns the runtime state.
//!
//! Account lifecycle:
//! 1. Records load from a `CredentialStore` into the ordered pool
//! 2. A request binds to an account via `AuthManager::get_access_token`
//! 3. Expiring tokens are refreshed inline, serialized by the manager mutex
//! 4. Refresh failures quarantine the account and rotate to the next one
//! 5. Quarantine expires (or every account fails) and selection resumes
//! 6. The optional background refresher keeps tokens warm between requests

pub mod binding;
pub mod error;
pub mod health;
pub mod manager;
pub mod pool;
pub mod refresh;

pub use binding::RequestBinding;
pub use error::{Error, Result};
pub use health::TokenHealth;
pub use manager::{AccessGrant, AuthManager, ManagerConfig};
pub use pool::{Account, AccountPool};
pub use refresh::{RefresherHandle, spawn_refresher};
