//! Waylay - intercepting HTTP(S) proxy engine
//!
//! Man-in-the-middles browser traffic with per-host certificates, records
//! every exchange byte for byte, lets an operator hold and edit traffic in
//! flight, and runs completion-tracked bulk request campaigns.

pub mod app;
pub mod ca;
pub mod encoding;
pub mod error;
pub mod fuzzer;
pub mod http;
pub mod project;
pub mod proxy;
pub mod scripting;

pub use error::*;
