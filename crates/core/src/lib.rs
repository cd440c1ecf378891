//! `orderflow-core`: order domain building blocks.
//!
//! This crate contains **pure domain** primitives (no transport concerns).

pub mod error;
pub mod event;
pub mod reference;

pub use error::{DomainError, DomainResult};
pub use event::OrderReceived;
pub use reference::{ORDERS_URI_PREFIX, OrderReference};
