//! # HTTP Server
//!
//! Transport adapter: every method and every path is handed to the
//! [`RequestDispatcher`](crate::dispatch::RequestDispatcher).

pub mod config;
pub mod server;

pub use config::HttpServerConfig;
pub use server::{into_http_response, HttpServer};
