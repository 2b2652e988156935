//! Database connection management for the coordination store.

pub mod connection;

pub use connection::DatabaseConnection;
