pub mod app;
pub mod collate;
pub mod config;
pub mod digest;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod matcher;
pub mod output;
pub mod recipe;
pub mod record;
pub mod scan;
pub mod transport;
pub mod upload;
