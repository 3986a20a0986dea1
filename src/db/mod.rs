mod buffer;
mod connection;
pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use buffer::ReadingBuffer;
pub use connection::Database;
