//! Concrete LLM provider clients.

pub mod http_pool;
pub mod mock;
pub mod remote_chat;
