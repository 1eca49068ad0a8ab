#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod hub;
pub mod registry;
pub mod sessions;
pub mod store;

#[cfg(test)]
mod chat_flow_tests;
