//! Studyhall messaging server: SSE delivery, chat membership, and
//! presence for the learning platform.

pub mod app_state;
pub mod db;
pub mod handlers;
pub mod http;
pub mod middleware;
pub mod realtime;
pub mod routes;
pub mod server;
pub mod services;
