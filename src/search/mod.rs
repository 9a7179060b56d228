//! Search module - tokenizer adapter, tag extraction and keyword search / 搜索模块
//!
//! Architecture principles / 架构原则：
//! - Search only resolves candidate sets, it never picks or mutates records
//! - Tokenizer is a swappable black box (jieba by default) / 分词器可替换
//! - Tags are derived once at ingestion and searched alongside the text fields

pub mod engine;
pub mod tags;
pub mod tokenizer;

pub use engine::{BulkMatch, SearchEngine, SearchMatches, SearchPhase};
pub use tags::TagExtractor;
pub use tokenizer::{JiebaTokenizer, Tokenizer, WhitespaceTokenizer};
