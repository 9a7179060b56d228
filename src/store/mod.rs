//! Record store - persistence contract for quotes / 语录存储
//!
//! The engine only talks to storage through [`RecordStore`]. Two
//! implementations are provided:
//! - `SqliteStore`: sqlx + SQLite (WAL), used in production / 生产使用
//! - `MemoryStore`: in-process map, used by tests and embedders / 内存实现

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::{AggregateRow, NewQuote, Quote, QuoteId, UserField};
use crate::search::tokenizer::fold;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Case-insensitive substring condition over the text fields / 文本子串匹配条件
///
/// Conjunctive normal form: every clause must hold, a clause holds when any
/// of its needles is contained in `ocr_text` or `recorded_text` (and, when
/// `include_tags` is set, in any single tag). Needles are stored case-folded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMatch {
    pub clauses: Vec<Vec<String>>,
    pub include_tags: bool,
}

impl TextMatch {
    /// Whole phrase must appear / 整句匹配
    pub fn phrase(phrase: &str) -> Self {
        Self {
            clauses: vec![vec![fold(phrase)]],
            include_tags: false,
        }
    }

    /// Any of the keywords may appear / 任意关键词匹配（OR）
    pub fn any_of<S: AsRef<str>>(keywords: &[S]) -> Self {
        Self {
            clauses: vec![keywords.iter().map(|k| fold(k.as_ref())).collect()],
            include_tags: false,
        }
    }

    /// Add a clause (AND) whose needles are OR-combined / 追加一个条件（AND）
    pub fn and_any<S: AsRef<str>>(mut self, needles: &[S]) -> Self {
        self.clauses
            .push(needles.iter().map(|n| fold(n.as_ref())).collect());
        self
    }

    pub fn with_tags(mut self) -> Self {
        self.include_tags = true;
        self
    }

    /// Evaluate against a quote in process / 在内存中判断是否匹配
    pub fn matches(&self, quote: &Quote) -> bool {
        let ocr = quote.ocr_text.as_deref().map(fold).unwrap_or_default();
        let recorded = quote.recorded_text.as_deref().map(fold).unwrap_or_default();
        let tags: Vec<String> = if self.include_tags {
            quote.tags.iter().map(|t| fold(t)).collect()
        } else {
            Vec::new()
        };

        self.clauses.iter().all(|needles| {
            needles.iter().any(|needle| {
                (quote.ocr_text.is_some() && ocr.contains(needle.as_str()))
                    || (quote.recorded_text.is_some() && recorded.contains(needle.as_str()))
                    || tags.iter().any(|t| t.contains(needle.as_str()))
            })
        })
    }
}

/// Result ordering / 排序方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QuoteOrder {
    #[default]
    IdAsc,
    IdDesc,
    /// Most viewed first, ties by id / 按查看次数降序
    ViewsDesc,
}

/// Filtered query over quotes / 语录查询条件
///
/// `None` fields do not constrain. `group_id = None` is an explicit
/// cross-group scan.
#[derive(Debug, Clone, Default)]
pub struct QuoteQuery {
    pub group_id: Option<String>,
    pub quoted_user_id: Option<String>,
    pub uploader_user_id: Option<String>,
    pub image_hash: Option<String>,
    /// Exact match on recorded text / 记录文本精确匹配
    pub recorded_text: Option<String>,
    /// Case-insensitive suffix of the image path / 图片路径后缀（忽略大小写）
    pub image_path_suffix: Option<String>,
    /// Uploader or quoted user is one of these / 上传者或被记录者属于该列表
    pub involving_users: Option<Vec<String>>,
    pub text: Option<TextMatch>,
    pub order: QuoteOrder,
    pub limit: Option<usize>,
}

impl QuoteQuery {
    /// Query scoped to one group / 限定群组的查询
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: Some(group_id.into()),
            ..Default::default()
        }
    }

    /// Cross-group query / 跨群组查询
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_quoted_user(mut self, user_id: Option<&str>) -> Self {
        self.quoted_user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_uploader(mut self, user_id: Option<&str>) -> Self {
        self.uploader_user_id = user_id.map(str::to_string);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.image_hash = Some(hash.into());
        self
    }

    pub fn with_recorded_text(mut self, text: impl Into<String>) -> Self {
        self.recorded_text = Some(text.into());
        self
    }

    pub fn with_path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.image_path_suffix = Some(suffix.into());
        self
    }

    pub fn involving(mut self, users: Vec<String>) -> Self {
        self.involving_users = Some(users);
        self
    }

    pub fn with_text(mut self, text: TextMatch) -> Self {
        self.text = Some(text);
        self
    }

    pub fn order_by(mut self, order: QuoteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate every field except ordering and limit / 在内存中判断条件
    pub fn matches(&self, quote: &Quote) -> bool {
        fn eq(want: &Option<String>, have: &Option<String>) -> bool {
            match want {
                Some(w) => have.as_deref() == Some(w.as_str()),
                None => true,
            }
        }

        if let Some(group) = &self.group_id {
            if &quote.group_id != group {
                return false;
            }
        }
        if !eq(&self.quoted_user_id, &quote.quoted_user_id)
            || !eq(&self.uploader_user_id, &quote.uploader_user_id)
            || !eq(&self.image_hash, &quote.image_hash)
            || !eq(&self.recorded_text, &quote.recorded_text)
        {
            return false;
        }
        if let Some(suffix) = &self.image_path_suffix {
            if !fold(&quote.image_path).ends_with(&fold(suffix)) {
                return false;
            }
        }
        if let Some(users) = &self.involving_users {
            let hit = |u: &Option<String>| u.as_ref().map_or(false, |u| users.contains(u));
            if !hit(&quote.uploader_user_id) && !hit(&quote.quoted_user_id) {
                return false;
            }
        }
        match &self.text {
            Some(text) => text.matches(quote),
            None => true,
        }
    }
}

/// Quote persistence interface / 语录存储接口
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a quote; unique violations map to `Error::Conflict` / 创建语录
    async fn create(&self, quote: NewQuote) -> Result<Quote>;

    async fn get(&self, id: QuoteId) -> Result<Option<Quote>>;

    /// Delete by id, `false` when nothing was deleted / 删除语录
    async fn delete(&self, id: QuoteId) -> Result<bool>;

    /// Filtered fetch / 条件查询
    async fn filter(&self, query: &QuoteQuery) -> Result<Vec<Quote>>;

    /// First match of a query / 查询第一条
    async fn first(&self, query: &QuoteQuery) -> Result<Option<Quote>> {
        let query = query.clone().with_limit(1);
        Ok(self.filter(&query).await?.into_iter().next())
    }

    /// Replace the tag set / 更新标签
    async fn update_tags(&self, id: QuoteId, tags: &BTreeSet<String>) -> Result<bool>;

    /// Add one to the view counter / 查看次数加一
    async fn increment_view_count(&self, id: QuoteId) -> Result<bool>;

    /// Count quotes per user in a group, most first / 按用户统计数量
    async fn count_by(
        &self,
        group_id: &str,
        field: UserField,
        limit: usize,
    ) -> Result<Vec<AggregateRow>>;
}
