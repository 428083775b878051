pub mod config;
pub mod error;
pub mod replay;
pub mod report;
