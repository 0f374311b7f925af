//! Library crate for wrt-scan-rs: target parsing, the probing engine, the
//! live event stream and the client-side result table.
pub mod client;
pub mod coordinator;
pub mod error;
pub mod export;
pub mod http_probe;
pub mod netdetect;
pub mod probe;
pub mod projection;
pub mod publisher;
pub mod reconciler;
pub mod server;
pub mod targets;
pub mod types;
