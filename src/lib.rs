// Library modules
pub mod broker_client;
pub mod broker_manager;
pub mod command;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod identity;
pub mod parser;
pub mod stats;
pub mod token;
pub mod token_service;
pub mod topics;

// Re-export commonly used types
pub use config::Config;
pub use device::DeviceLink;
pub use error::BridgeError;
pub use identity::NodeIdentity;
