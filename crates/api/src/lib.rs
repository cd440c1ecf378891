//! HTTP surface and service wiring for the `order-received` pipeline.

pub mod app;
pub mod handler;
