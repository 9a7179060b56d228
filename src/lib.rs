pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod hasher;
pub mod images;
pub mod logging;
pub mod models;
pub mod search;
pub mod selector;
pub mod service;
pub mod store;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use models::{AggregateRow, NewQuote, Quote, QuoteId};
pub use service::{ImageUpload, IngestRequest, QuoteService, Retrieval, SearchOutcome};
