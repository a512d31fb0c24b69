pub mod amount;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod notification;
pub mod pgqueue;
pub mod queue;
pub mod retry;
pub mod store;
pub mod types;
