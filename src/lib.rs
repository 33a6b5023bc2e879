pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
