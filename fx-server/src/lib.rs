//! fxchange rendezvous server: UDP host around the registry dispatcher.

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::RegistryServer;
