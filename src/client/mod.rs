pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod protocol_client;
pub mod registry;
pub mod sender;
pub mod sweeper;
