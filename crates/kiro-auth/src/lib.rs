//! Kiro upstream authentication library
//!
//! Provides credential records, credential stores, and the two token
//! refresh protocols spoken by the Kiro upstream. This crate is a
//! standalone library with no dependency on the gateway binary — it can be
//! tested and used independently.
//!
//! Credential flow:
//! 1. A store backend (`FileStore`, `KvStore`, `DocStore`) loads
//!    `CredentialRecord`s at startup
//! 2. The pool layer refreshes access tokens via `token::refresh_record()`
//!    before they expire
//! 3. Refreshed material is written back through `CredentialStore::save()`

pub mod error;
pub mod fingerprint;
pub mod record;
pub mod store;
pub mod token;

pub use error::{Error, Result};
pub use fingerprint::machine_fingerprint;
pub use record::{AuthMethod, CredentialRecord};
pub use store::{CredentialStore, DocStore, EnvStore, FileStore, KvStore, StoreKind};
pub use token::{DeviceOauthWire, TokenResponse, refresh_record};
