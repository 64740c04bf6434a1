pub mod chat_stream;
pub mod cors;
pub mod health;
