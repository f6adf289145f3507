//! Shared wire models, stream event types, and server configuration for
//! the Studyhall real-time messaging platform.

pub mod config;
pub mod models;
