pub mod auth;
pub mod http;
pub mod router;
pub mod subsystems;
