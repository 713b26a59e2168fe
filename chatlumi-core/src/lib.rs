pub mod config;
pub mod db;
pub mod error;
pub mod facebook;
pub mod models;
pub mod webhook;

pub use config::ChatLumiConfig;
pub use error::ChatLumiError;
pub use facebook::{GraphClient, GraphError};
