pub mod api;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod engine;
pub mod publisher;
pub mod source;
