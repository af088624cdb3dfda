pub mod buffer_pool;
pub mod received_data;
