pub mod auth;
pub mod backoff;
pub mod error_code;
pub mod reorder_buffer;
pub mod session;
pub mod session_manager;
