pub mod app;
pub mod auth;
pub mod config;
pub mod error;
pub mod inference;
pub mod scans;
pub mod state;
pub mod storage;
