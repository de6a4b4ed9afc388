pub mod bootstrap;
pub mod coordinator;
pub mod countdown;
pub mod history_cache;
pub mod service;
