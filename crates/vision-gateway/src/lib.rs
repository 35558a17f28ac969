pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod ingest;
pub mod lanes;
pub mod persistence;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod typing;

pub use auth::{JwtVerifier, TokenVerifier};
pub use config::GatewayConfig;
pub use dispatcher::{Dispatcher, Exclude};
pub use ingest::Ingested;
pub use lanes::LaneGuard;
pub use registry::SessionId;
