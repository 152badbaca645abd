pub mod api;
pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod event;
pub mod forwarder;
pub mod metrics;
pub mod receive;
pub mod ring;
pub mod router;
pub mod server;
