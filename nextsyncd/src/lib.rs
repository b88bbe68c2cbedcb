pub mod accounts;
pub mod conditions;
pub mod config;
pub mod daemon;
pub mod notify;
pub mod storage;
pub mod transfer;
