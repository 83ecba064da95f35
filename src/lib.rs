pub mod api;
pub mod auth;
pub mod config;
pub mod conversion;
pub mod ledger;
pub mod queries;
pub mod sqlite_storage;
pub mod storage;

pub use remitdesk_core::models;
