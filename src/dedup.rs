//! Duplicate gate / 重复检测
//!
//! Checked before a quote is created. Hash first, then (when the hash is
//! absent or unknown) exact recorded text plus quoted user, both scoped to
//! the group. The check and the following create are not atomic; the
//! SQLite unique index on (group, hash) catches the race.

use std::sync::Arc;

use crate::error::Result;
use crate::models::Quote;
use crate::store::{QuoteQuery, RecordStore};

/// Identity of an ingestion candidate / 待入库语录的身份信息
#[derive(Debug, Clone, Copy, Default)]
pub struct Candidate<'a> {
    pub group_id: &'a str,
    pub image_hash: Option<&'a str>,
    pub recorded_text: Option<&'a str>,
    pub quoted_user_id: Option<&'a str>,
}

/// Outcome of a duplicate check / 检测结果
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    New,
    /// Same image hash in the group / 同群组同哈希
    SameImage(Quote),
    /// Same recorded text about the same user / 同文本同用户
    SameText(Quote),
}

impl DuplicateCheck {
    pub fn is_new(&self) -> bool {
        matches!(self, DuplicateCheck::New)
    }

    pub fn existing(&self) -> Option<&Quote> {
        match self {
            DuplicateCheck::New => None,
            DuplicateCheck::SameImage(q) | DuplicateCheck::SameText(q) => Some(q),
        }
    }

    pub fn into_existing(self) -> Option<Quote> {
        match self {
            DuplicateCheck::New => None,
            DuplicateCheck::SameImage(q) | DuplicateCheck::SameText(q) => Some(q),
        }
    }
}

#[derive(Clone)]
pub struct DuplicateGate {
    store: Arc<dyn RecordStore>,
}

impl DuplicateGate {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn check(&self, candidate: &Candidate<'_>) -> Result<DuplicateCheck> {
        let group = QuoteQuery::group(candidate.group_id);

        if let Some(hash) = candidate.image_hash.filter(|h| !h.is_empty()) {
            if let Some(existing) = self.store.first(&group.clone().with_hash(hash)).await? {
                tracing::debug!(
                    "Duplicate image in group {}: quote {}",
                    candidate.group_id,
                    existing.id
                );
                return Ok(DuplicateCheck::SameImage(existing));
            }
        }

        if let (Some(text), Some(user)) = (candidate.recorded_text, candidate.quoted_user_id) {
            let query = group.with_recorded_text(text).with_quoted_user(Some(user));
            if let Some(existing) = self.store.first(&query).await? {
                tracing::debug!(
                    "Duplicate text in group {}: quote {}",
                    candidate.group_id,
                    existing.id
                );
                return Ok(DuplicateCheck::SameText(existing));
            }
        }

        Ok(DuplicateCheck::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewQuote;
    use crate::store::MemoryStore;

    async fn seeded() -> (Arc<MemoryStore>, DuplicateGate, Quote, Quote) {
        let store = Arc::new(MemoryStore::new());
        let image = store
            .create(NewQuote {
                group_id: "g".to_string(),
                image_path: "a.png".to_string(),
                image_hash: Some("hash-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let text = store
            .create(NewQuote {
                group_id: "g".to_string(),
                image_path: "b.png".to_string(),
                recorded_text: Some("said something".to_string()),
                quoted_user_id: Some("42".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let gate = DuplicateGate::new(store.clone());
        (store, gate, image, text)
    }

    #[tokio::test]
    async fn test_same_hash_is_duplicate() {
        let (_, gate, image, _) = seeded().await;
        let check = gate
            .check(&Candidate {
                group_id: "g",
                image_hash: Some("hash-a"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(check, DuplicateCheck::SameImage(image));
        assert!(!check.is_new());
    }

    #[tokio::test]
    async fn test_hash_is_group_scoped() {
        let (_, gate, _, _) = seeded().await;
        let check = gate
            .check(&Candidate {
                group_id: "other",
                image_hash: Some("hash-a"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(check.is_new());
    }

    #[tokio::test]
    async fn test_text_and_user_must_both_match() {
        let (_, gate, _, text) = seeded().await;
        let same = Candidate {
            group_id: "g",
            recorded_text: Some("said something"),
            quoted_user_id: Some("42"),
            ..Default::default()
        };
        assert_eq!(gate.check(&same).await.unwrap().existing(), Some(&text));

        let other_user = Candidate {
            quoted_user_id: Some("7"),
            ..same
        };
        assert!(gate.check(&other_user).await.unwrap().is_new());

        let no_user = Candidate {
            quoted_user_id: None,
            ..same
        };
        assert!(gate.check(&no_user).await.unwrap().is_new());
    }

    #[tokio::test]
    async fn test_hash_checked_before_text() {
        let (store, gate, image, text) = seeded().await;
        let both = Candidate {
            group_id: "g",
            image_hash: Some("hash-a"),
            recorded_text: Some("said something"),
            quoted_user_id: Some("42"),
        };
        assert_eq!(gate.check(&both).await.unwrap(), DuplicateCheck::SameImage(image));

        // Unknown hash falls through to the text check
        let fresh = Candidate {
            image_hash: Some("fresh-hash"),
            ..both
        };
        assert_eq!(gate.check(&fresh).await.unwrap(), DuplicateCheck::SameText(text));
        assert_eq!(store.len(), 2);
    }
}
