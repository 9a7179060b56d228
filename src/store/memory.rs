//! In-memory record store / 内存语录存储

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{QuoteOrder, QuoteQuery, RecordStore};
use crate::error::{Error, Result};
use crate::models::{AggregateRow, NewQuote, Quote, QuoteId, UserField};

#[derive(Default)]
struct Inner {
    quotes: BTreeMap<QuoteId, Quote>,
    next_id: QuoteId,
}

/// Record store backed by a map, same constraints as the SQLite schema / 内存存储
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, new: NewQuote) -> Result<Quote> {
        let mut inner = self.inner.write();

        for existing in inner.quotes.values() {
            if existing.image_path == new.image_path {
                return Err(Error::Conflict(format!(
                    "image path already stored: {}",
                    new.image_path
                )));
            }
            if new.image_hash.is_some()
                && existing.group_id == new.group_id
                && existing.image_hash == new.image_hash
            {
                return Err(Error::Conflict(format!(
                    "image hash already stored in group {}",
                    new.group_id
                )));
            }
        }

        inner.next_id += 1;
        let quote = Quote {
            id: inner.next_id,
            group_id: new.group_id,
            image_path: new.image_path,
            image_hash: new.image_hash,
            ocr_text: new.ocr_text,
            recorded_text: new.recorded_text,
            tags: new.tags,
            quoted_user_id: new.quoted_user_id,
            uploader_user_id: new.uploader_user_id,
            created_at: Utc::now(),
            view_count: 0,
        };
        inner.quotes.insert(quote.id, quote.clone());
        Ok(quote)
    }

    async fn get(&self, id: QuoteId) -> Result<Option<Quote>> {
        Ok(self.inner.read().quotes.get(&id).cloned())
    }

    async fn delete(&self, id: QuoteId) -> Result<bool> {
        Ok(self.inner.write().quotes.remove(&id).is_some())
    }

    async fn filter(&self, query: &QuoteQuery) -> Result<Vec<Quote>> {
        let inner = self.inner.read();
        let mut quotes: Vec<Quote> = inner
            .quotes
            .values()
            .filter(|q| query.matches(q))
            .cloned()
            .collect();

        match query.order {
            QuoteOrder::IdAsc => {}
            QuoteOrder::IdDesc => quotes.reverse(),
            QuoteOrder::ViewsDesc => {
                quotes.sort_by(|a, b| b.view_count.cmp(&a.view_count).then(a.id.cmp(&b.id)))
            }
        }
        if let Some(limit) = query.limit {
            quotes.truncate(limit);
        }
        Ok(quotes)
    }

    async fn update_tags(&self, id: QuoteId, tags: &BTreeSet<String>) -> Result<bool> {
        match self.inner.write().quotes.get_mut(&id) {
            Some(quote) => {
                quote.tags = tags.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_view_count(&self, id: QuoteId) -> Result<bool> {
        match self.inner.write().quotes.get_mut(&id) {
            Some(quote) => {
                quote.view_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_by(
        &self,
        group_id: &str,
        field: UserField,
        limit: usize,
    ) -> Result<Vec<AggregateRow>> {
        let inner = self.inner.read();
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for quote in inner.quotes.values().filter(|q| q.group_id == group_id) {
            if let Some(user) = field.value(quote) {
                *counts.entry(user).or_default() += 1;
            }
        }

        let mut rows: Vec<AggregateRow> = counts
            .into_iter()
            .map(|(user_id, count)| AggregateRow {
                user_id: user_id.to_string(),
                count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.user_id.cmp(&b.user_id)));
        rows.truncate(limit);
        Ok(rows)
    }
}
