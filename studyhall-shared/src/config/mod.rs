//! # Configuration
//!
//! Sectioned server configuration with file, environment, and CLI
//! override layers.

pub mod server;
