//! Domain types for the contacts service.

pub mod contact;

pub use contact::{Contact, NewContact, ADDRESS_MAX_CHARS, NAME_MAX_CHARS};
