pub mod codec;
pub mod config;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod tools;
pub mod transcript;

pub use config::GatewayConfig;
pub use server::McpServer;
