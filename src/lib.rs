pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod devices;
pub mod error;
pub mod events;
pub mod ids;
pub mod lock;
pub mod messages;
pub mod models;
pub mod online;
pub mod otp;
pub mod pubsub;
pub mod push;
pub mod push_client;
pub mod routes;
pub mod schema;
pub mod settings;
pub mod sse;
pub mod state;
pub mod users;
pub mod webhooks;
pub mod workers;
