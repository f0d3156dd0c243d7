pub mod cache;
pub mod cli;
pub mod converter;
pub mod mapper;
pub mod message_tracing;
pub mod models;
pub mod pid;
pub mod providers;
pub mod router;
pub mod server;
pub mod transcoder;
