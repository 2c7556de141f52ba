//! `orderflow-core`: shared primitives for the order-processing platform.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns):
//! identifiers and validated contact values that travel inside job payloads.

pub mod error;
pub mod id;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{OrderId, UserId};
pub use value_object::{EmailAddress, PhoneNumber, ValueObject};
