//! Tag extraction / 标签提取
//!
//! Cuts ingestion text into a deduplicated set of searchable tags, dropping
//! punctuation and common function words. Short texts are also kept whole,
//! since they under-tokenize and the literal string is a useful tag.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::tokenizer::Tokenizer;

/// Punctuation removed from token output / 需要去除的标点符号
const PUNCTUATION: &str = ".,!?:;。，！？：；%$\n []()（）《》<>「」'-_+=*&^#@~`";

/// Common function words / 停用词
const STOPWORDS: &[&str] = &[
    "的", "了", "是", "在", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "上",
    "也", "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "好", "自己", "这",
];

/// Texts up to this many characters are also kept as a tag / 短文本阈值
pub const SHORT_TEXT_CHARS: usize = 10;

/// Tag extractor / 标签提取器
#[derive(Clone)]
pub struct TagExtractor {
    tokenizer: Arc<dyn Tokenizer>,
}

impl TagExtractor {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Extract tags from text / 从文本提取标签
    pub fn extract(&self, text: Option<&str>) -> BTreeSet<String> {
        let text = match text {
            Some(t) if !t.is_empty() => t,
            _ => return BTreeSet::new(),
        };

        let tokens = match self.tokenizer.cut(text) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Tokenizer failed, falling back to no tokens: {}", e);
                Vec::new()
            }
        };

        let mut tags: BTreeSet<String> = tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty() && !is_removed(t))
            .map(str::to_string)
            .collect();

        if text.chars().count() <= SHORT_TEXT_CHARS {
            let whole = text.trim();
            if !whole.is_empty() && !is_removed(whole) {
                tags.insert(whole.to_string());
            }
        }

        tags
    }

    /// Tokens of a single search term, filtered the same way as tags / 搜索词分词
    pub fn term_tokens(&self, term: &str) -> Vec<String> {
        self.extract(Some(term)).into_iter().collect()
    }
}

/// Stopword or single punctuation character / 停用词或标点
fn is_removed(word: &str) -> bool {
    if STOPWORDS.contains(&word) {
        return true;
    }
    let mut chars = word.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => PUNCTUATION.contains(c),
        _ => false,
    }
}
