pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;

pub use config::Config;
pub use db::{resolve, ContactRepository, ContactStore, Engine, Session, StoreError};
pub use domain::{Contact, NewContact};
pub use error::AppError;
