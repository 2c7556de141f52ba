//! Ops HTTP surface over the coordination infrastructure.

pub mod app;
pub mod middleware;
pub mod shutdown;
