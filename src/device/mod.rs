pub mod connection;
pub mod constants;
pub mod driver;
pub mod notifications;
pub mod operations;
pub mod resolver;
pub mod types;
