//! Search engine - two-phase keyword resolution over quote text / 搜索引擎
//!
//! Architecture principle: only returns candidate sets, picking one is the
//! selector's job / 只返回候选集合，挑选由选择器负责
//! - Phase 1: whole query as a case-insensitive substring of the text fields / 精确匹配
//! - Phase 2: per-term token fallback, AND across terms, text or tags per term / 分词模糊匹配
//! - Bulk match: OR across raw keywords, no tokenization (drives deletion) / 批量匹配

use std::sync::Arc;

use super::tags::TagExtractor;
use crate::error::{Error, Result};
use crate::models::Quote;
use crate::store::{QuoteQuery, RecordStore, TextMatch};

/// Which phase produced the matches / 命中阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    /// Empty or whitespace-only query, nothing searched / 空查询
    Skipped,
    Exact,
    Fuzzy,
}

/// Search result set / 搜索结果
#[derive(Debug, Clone)]
pub struct SearchMatches {
    pub phase: SearchPhase,
    pub quotes: Vec<Quote>,
}

impl SearchMatches {
    fn skipped() -> Self {
        Self {
            phase: SearchPhase::Skipped,
            quotes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// Filters for administrative bulk matching / 批量匹配条件
#[derive(Debug, Clone, Default)]
pub struct BulkMatch {
    /// `None` scans every group / 为空时跨群组
    pub group_id: Option<String>,
    /// OR-combined raw keywords / 关键词（OR）
    pub keywords: Vec<String>,
    pub uploader_user_id: Option<String>,
    pub quoted_user_id: Option<String>,
}

impl BulkMatch {
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    pub fn with_keywords<S: AsRef<str>>(mut self, keywords: &[S]) -> Self {
        self.keywords = keywords.iter().map(|k| k.as_ref().to_string()).collect();
        self
    }

    pub fn with_uploader(mut self, user_id: impl Into<String>) -> Self {
        self.uploader_user_id = Some(user_id.into());
        self
    }

    pub fn with_quoted_user(mut self, user_id: impl Into<String>) -> Self {
        self.quoted_user_id = Some(user_id.into());
        self
    }
}

/// Search engine / 搜索引擎
#[derive(Clone)]
pub struct SearchEngine {
    store: Arc<dyn RecordStore>,
    tags: TagExtractor,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn RecordStore>, tags: TagExtractor) -> Self {
        Self { store, tags }
    }

    /// Resolve a query to candidates (AND across terms) / 搜索语录候选
    pub async fn search(
        &self,
        group_id: &str,
        raw_query: &str,
        user_filter: Option<&str>,
    ) -> Result<SearchMatches> {
        let query = raw_query.trim();
        if query.is_empty() {
            return Ok(SearchMatches::skipped());
        }
        let scope = QuoteQuery::group(group_id).with_quoted_user(user_filter);

        tracing::debug!("Search phase 1 (exact) for '{}' in group {}", query, group_id);
        let exact = self
            .store
            .filter(&scope.clone().with_text(TextMatch::phrase(query)))
            .await?;
        if !exact.is_empty() {
            tracing::debug!("Exact match found {} quotes", exact.len());
            return Ok(SearchMatches {
                phase: SearchPhase::Exact,
                quotes: exact,
            });
        }

        tracing::debug!("No exact match, falling back to token search");
        let text = self.fuzzy_condition(query);
        let candidates = self.store.filter(&scope.with_text(text.clone())).await?;
        let total = candidates.len();

        // Stores may return a superset for the tag part; re-check in process
        let quotes: Vec<Quote> = candidates.into_iter().filter(|q| text.matches(q)).collect();
        tracing::debug!("Token search: {} candidates, {} after tag check", total, quotes.len());

        Ok(SearchMatches {
            phase: SearchPhase::Fuzzy,
            quotes,
        })
    }

    /// One clause per term: the term itself or any of its tokens / 每个词一个条件
    fn fuzzy_condition(&self, query: &str) -> TextMatch {
        let mut text = TextMatch::default().with_tags();
        for term in query.split_whitespace() {
            let mut needles = vec![term.to_string()];
            for token in self.tags.term_tokens(term) {
                if !needles.contains(&token) {
                    needles.push(token);
                }
            }
            text = text.and_any(&needles);
        }
        text
    }

    /// Match any keyword for bulk operations (OR) / 批量匹配（OR）
    pub async fn bulk_match(&self, filter: &BulkMatch) -> Result<Vec<Quote>> {
        let keywords: Vec<&str> = filter
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();

        if filter.group_id.is_none()
            && keywords.is_empty()
            && filter.uploader_user_id.is_none()
            && filter.quoted_user_id.is_none()
        {
            return Err(Error::InvalidInput(
                "bulk match needs a group, a keyword or a user filter".to_string(),
            ));
        }

        let mut query = QuoteQuery {
            group_id: filter.group_id.clone(),
            ..Default::default()
        }
        .with_uploader(filter.uploader_user_id.as_deref())
        .with_quoted_user(filter.quoted_user_id.as_deref());
        if !keywords.is_empty() {
            query = query.with_text(TextMatch::any_of(&keywords));
        }

        let quotes = self.store.filter(&query).await?;
        tracing::info!(
            "Bulk match found {} quotes (group: {:?}, keywords: {:?})",
            quotes.len(),
            filter.group_id,
            keywords
        );
        Ok(quotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewQuote;
    use crate::search::tokenizer::{Tokenizer, WhitespaceTokenizer};
    use crate::store::{MemoryStore, SqliteStore};

    /// Splits text into single characters, like a CJK segmenter on unknown words
    struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn cut(&self, text: &str) -> anyhow::Result<Vec<String>> {
            Ok(text.chars().map(|c| c.to_string()).collect())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: SearchEngine,
    }

    fn fixture_with(tokenizer: Arc<dyn Tokenizer>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let engine = SearchEngine::new(store.clone(), TagExtractor::new(tokenizer));
        Fixture { store, engine }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(WhitespaceTokenizer))
    }

    impl Fixture {
        async fn add(
            &self,
            group: &str,
            ocr: Option<&str>,
            recorded: Option<&str>,
            tags: &[&str],
        ) -> Quote {
            let n = self.store.len();
            self.store
                .create(NewQuote {
                    group_id: group.to_string(),
                    image_path: format!("{}/{}.png", group, n),
                    ocr_text: ocr.map(str::to_string),
                    recorded_text: recorded.map(str::to_string),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    quoted_user_id: Some(format!("user{}", n % 2)),
                    ..Default::default()
                })
                .await
                .unwrap()
        }
    }

    fn ids(quotes: &[Quote]) -> Vec<i64> {
        quotes.iter().map(|q| q.id).collect()
    }

    #[tokio::test]
    async fn test_exact_phase_wins() {
        let f = fixture();
        let both = f.add("g", Some("hello world"), None, &[]).await;
        f.add("g", Some("hello"), None, &[]).await;

        let matches = f.engine.search("g", "hello world", None).await.unwrap();
        assert_eq!(matches.phase, SearchPhase::Exact);
        assert_eq!(ids(&matches.quotes), vec![both.id]);
    }

    #[tokio::test]
    async fn test_no_match() {
        let f = fixture();
        f.add("g", Some("hello world"), None, &[]).await;
        let matches = f.engine.search("g", "goodbye", None).await.unwrap();
        assert!(matches.is_empty());
        assert_eq!(matches.phase, SearchPhase::Fuzzy);
    }

    #[tokio::test]
    async fn test_blank_query_skipped() {
        let f = fixture();
        f.add("g", Some("hello"), None, &[]).await;
        let matches = f.engine.search("g", "   \t", None).await.unwrap();
        assert_eq!(matches.phase, SearchPhase::Skipped);
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_and_semantics_over_text_and_tags() {
        let f = fixture();
        let text_both = f.add("g", Some("beta then alpha"), None, &[]).await;
        let text_and_tag = f.add("g", None, Some("alpha only"), &["Beta"]).await;
        f.add("g", Some("alpha alone"), None, &[]).await;
        f.add("g", None, Some("just beta"), &[]).await;

        let matches = f.engine.search("g", "alpha beta", None).await.unwrap();
        assert_eq!(matches.phase, SearchPhase::Fuzzy);
        assert_eq!(ids(&matches.quotes), vec![text_both.id, text_and_tag.id]);
    }

    #[tokio::test]
    async fn test_fuzzy_phase_on_sqlite() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = SearchEngine::new(
            store.clone(),
            TagExtractor::new(Arc::new(WhitespaceTokenizer)),
        );
        let add = |path: &str, ocr: Option<&str>, recorded: Option<&str>, tags: &[&str]| {
            NewQuote {
                group_id: "g".to_string(),
                image_path: path.to_string(),
                ocr_text: ocr.map(str::to_string),
                recorded_text: recorded.map(str::to_string),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            }
        };
        let text_and_tag = store
            .create(add("a.png", Some("alpha text"), None, &["Beta"]))
            .await
            .unwrap();
        store
            .create(add("b.png", Some("alpha only"), None, &[]))
            .await
            .unwrap();
        store
            .create(add("c.png", None, Some("beta"), &[]))
            .await
            .unwrap();
        let text_both = store
            .create(add("d.png", Some("ALPHA and beta"), None, &[]))
            .await
            .unwrap();
        store
            .create(NewQuote {
                group_id: "h".to_string(),
                ..add("e.png", Some("alpha beta elsewhere"), None, &[])
            })
            .await
            .unwrap();

        // No record holds the whole phrase, so the token phase answers
        let matches = engine.search("g", "alpha BETA", None).await.unwrap();
        assert_eq!(matches.phase, SearchPhase::Fuzzy);
        assert_eq!(ids(&matches.quotes), vec![text_and_tag.id, text_both.id]);

        // A tag that only contains the term still counts
        let matches = engine.search("g", "alpha bet", None).await.unwrap();
        assert_eq!(ids(&matches.quotes), vec![text_and_tag.id, text_both.id]);
    }

    #[tokio::test]
    async fn test_case_insensitive_and_scoped() {
        let f = fixture();
        let a = f.add("g", Some("Hello World"), None, &[]).await;
        f.add("other", Some("hello world"), None, &[]).await;

        let matches = f.engine.search("g", "HELLO", None).await.unwrap();
        assert_eq!(ids(&matches.quotes), vec![a.id]);

        // a.quoted_user_id is user0
        let filtered = f.engine.search("g", "hello", Some("user1")).await.unwrap();
        assert!(filtered.is_empty());
        let filtered = f.engine.search("g", "hello", Some("user0")).await.unwrap();
        assert_eq!(ids(&filtered.quotes), vec![a.id]);
    }

    #[tokio::test]
    async fn test_token_fallback() {
        let f = fixture_with(Arc::new(CharTokenizer));
        let q = f.add("g", Some("今天吃火锅"), None, &[]).await;

        // Whole term is absent, its character tokens are present
        let matches = f.engine.search("g", "火锅店", None).await.unwrap();
        assert_eq!(matches.phase, SearchPhase::Fuzzy);
        assert_eq!(ids(&matches.quotes), vec![q.id]);
    }

    #[tokio::test]
    async fn test_bulk_match_is_union() {
        let f = fixture();
        let a = f.add("g", Some("contains a-word"), None, &[]).await;
        let b = f.add("g", None, Some("contains b-word"), &[]).await;
        f.add("g", Some("neither"), None, &[]).await;
        f.add("other", Some("a-word elsewhere"), None, &[]).await;

        let found = f
            .engine
            .bulk_match(&BulkMatch::group("g").with_keywords(&["a-word", "b-word"]))
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_bulk_match_filters() {
        let f = fixture();
        let a = f.add("g", Some("word"), None, &[]).await;
        let b = f.add("g", Some("word"), None, &[]).await;
        let c = f.add("h", Some("word"), None, &[]).await;
        f.add("g", None, None, &["word"]).await;

        // Tags never count for bulk matching
        let found = f
            .engine
            .bulk_match(&BulkMatch::group("g").with_keywords(&["word"]))
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![a.id, b.id]);

        let found = f
            .engine
            .bulk_match(&BulkMatch::group("g").with_keywords(&["WORD"]).with_quoted_user("user0"))
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![a.id]);

        let cross = BulkMatch {
            keywords: vec!["word".to_string()],
            quoted_user_id: Some("user0".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&f.engine.bulk_match(&cross).await.unwrap()), vec![a.id, c.id]);

        assert!(f.engine.bulk_match(&BulkMatch::default()).await.is_err());
    }
}
