pub mod broker;
pub mod client;
pub mod config;
pub mod http;
pub mod identity;
pub mod protocol;
pub mod rooms;
pub mod server;

pub use broker::ChatBroker;
pub use config::ServerConfig;
pub use identity::{IdentityResolver, JwtIdentityResolver, TokenIssuer};
pub use server::{start, start_with_telemetry, ServerHandle};
