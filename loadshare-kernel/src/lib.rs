pub mod allocation;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod group;
pub mod health;
pub mod http;
pub mod mdns;
pub mod models;
pub mod registry;
pub mod state;
pub mod status;
