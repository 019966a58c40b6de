pub mod collector;
pub mod dispatch;
pub mod handler;
pub mod hop;
pub mod server;
