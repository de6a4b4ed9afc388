pub mod config;
pub mod connection;
pub mod error;
pub mod history_cache_repository;
pub mod logging;
pub mod offline_history;
pub mod remote_api;
pub mod state_repository;
pub mod storage;
