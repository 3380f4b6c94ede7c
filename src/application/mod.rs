//! Application layer: HTTP surface, request services and background actors.

pub mod actors;
pub mod handlers;
pub mod http;
pub mod services;
