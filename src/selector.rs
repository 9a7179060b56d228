//! Anti-repeat selector / 防重复随机选择器
//!
//! Picks one quote from a candidate set while avoiding the quotes most
//! recently returned for the same selection key.
//! - Per-key FIFO window of the last N ids / 每个键保存最近 N 条
//! - Whole keys expire after a TTL, key count is capped / 键过期与数量上限
//! - One mutex, held only while computing the pick / 锁只在选择期间持有

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SelectorConfig;
use crate::models::{Quote, QuoteId};

/// Scope of the recency history: group + user filter + optional query / 选择键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectionKey {
    pub group_id: String,
    pub user_filter: Option<String>,
    pub query: Option<String>,
}

impl SelectionKey {
    pub fn random(group_id: &str, user_filter: Option<&str>) -> Self {
        Self {
            group_id: group_id.to_string(),
            user_filter: user_filter.map(str::to_string),
            query: None,
        }
    }

    pub fn search(group_id: &str, user_filter: Option<&str>, query: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            user_filter: user_filter.map(str::to_string),
            query: Some(query.to_string()),
        }
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.group_id,
            self.user_filter.as_deref().unwrap_or("all")
        )?;
        if let Some(query) = &self.query {
            write!(f, "_{}", query)?;
        }
        Ok(())
    }
}

struct KeyHistory {
    ids: VecDeque<QuoteId>,
    touched: Instant,
}

/// Anti-repeat selector / 防重复选择器
pub struct AntiRepeatSelector {
    history_size: usize,
    ttl: Duration,
    max_keys: usize,
    history: Mutex<HashMap<SelectionKey, KeyHistory>>,
}

impl AntiRepeatSelector {
    pub fn new(history_size: usize, ttl: Duration, max_keys: usize) -> Self {
        Self {
            history_size,
            ttl,
            max_keys: max_keys.max(1),
            history: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(
            config.history_size,
            Duration::from_secs(config.history_ttl_secs),
            config.max_keys,
        )
    }

    /// Pick one candidate and remember it / 选择一条并记录
    ///
    /// # Panics
    ///
    /// Panics if `candidates` is empty; callers check for "no records" first.
    pub fn select<'a>(&self, key: &SelectionKey, candidates: &'a [Quote]) -> &'a Quote {
        assert!(
            !candidates.is_empty(),
            "AntiRepeatSelector::select called with no candidates"
        );

        let now = Instant::now();
        let mut history = self.history.lock();
        self.expire(&mut history, now);

        let entry = history.entry(key.clone()).or_insert_with(|| KeyHistory {
            ids: VecDeque::with_capacity(self.history_size + 1),
            touched: now,
        });

        let unseen: Vec<&Quote> = candidates
            .iter()
            .filter(|q| !entry.ids.contains(&q.id))
            .collect();

        let mut rng = rand::thread_rng();
        let picked = if unseen.is_empty() {
            tracing::debug!("All candidates for {} shown recently, picking from all", key);
            &candidates[rng.gen_range(0..candidates.len())]
        } else {
            unseen[rng.gen_range(0..unseen.len())]
        };

        entry.ids.push_back(picked.id);
        while entry.ids.len() > self.history_size {
            entry.ids.pop_front();
        }
        entry.touched = now;

        if history.len() > self.max_keys {
            let oldest = history
                .iter()
                .min_by_key(|(_, h)| h.touched)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                history.remove(&oldest);
            }
        }

        picked
    }

    /// Ids recently returned for a key, oldest first / 最近返回的ID
    pub fn recent(&self, key: &SelectionKey) -> Vec<QuoteId> {
        let mut history = self.history.lock();
        self.expire(&mut history, Instant::now());
        history
            .get(key)
            .map(|h| h.ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live keys / 当前键数量
    pub fn key_count(&self) -> usize {
        let mut history = self.history.lock();
        self.expire(&mut history, Instant::now());
        history.len()
    }

    fn expire(&self, history: &mut HashMap<SelectionKey, KeyHistory>, now: Instant) {
        history.retain(|_, h| now.duration_since(h.touched) < self.ttl);
    }
}
