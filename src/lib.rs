pub mod adapters;
pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod logging;
pub mod types;
pub mod voice;
