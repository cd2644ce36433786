//! Courier service: configuration, startup wiring and the health/intake
//! HTTP server.
//!
//! The binary in `main.rs` wires these together with the delivery engine
//! from `courier-delivery`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod limiter;
pub mod server;

pub use config::{Config, LogFormat};
pub use server::{create_router, AppState};
