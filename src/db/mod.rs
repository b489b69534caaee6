//! Database layer: backend resolution, scoped sessions, and contact storage.
//!
//! This module provides:
//! - Backend selection between a local SQLite file and Cloud SQL for MySQL
//! - The Cloud SQL Auth Proxy child process for the remote backend
//! - Schema creation and first-run seeding
//! - Scoped sessions with commit-or-rollback semantics
//! - The `ContactStore` operations used by the HTTP layer

pub mod error;
pub mod migrations;
pub mod proxy;
pub mod repo;
pub mod resolver;
pub mod session;

pub use error::StoreError;
pub use repo::{ContactRepository, ContactStore};
pub use resolver::{resolve, ResolveError};
pub use session::{BackendKind, Engine, Session};
