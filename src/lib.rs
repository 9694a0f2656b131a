pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod redis_client;
pub mod relay;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod websocket;
