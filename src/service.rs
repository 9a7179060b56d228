//! Quote service - ingestion, retrieval and maintenance / 语录服务
//!
//! Stitches the tag extractor, duplicate gate, search engine and anti-repeat
//! selector together over one record store and one image store. Built once
//! and shared by `Arc`.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::dedup::{Candidate, DuplicateGate};
use crate::error::{Error, Result};
use crate::hasher::{hash_or_none, ContentHasher, ImageHasher};
use crate::images::{ImageStore, LocalImageStore};
use crate::models::{tag_source, AggregateRow, NewQuote, Quote, QuoteId, UserField};
use crate::search::{BulkMatch, JiebaTokenizer, SearchEngine, TagExtractor, Tokenizer};
use crate::selector::{AntiRepeatSelector, SelectionKey};
use crate::store::{QuoteOrder, QuoteQuery, RecordStore, SqliteStore};

/// Outcome of a retrieval / 获取结果
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    /// First pick had its image / 直接命中
    Found(Quote),
    /// Picks with missing images were purged before this one / 清理失效记录后命中
    Healed { quote: Quote, purged: Vec<QuoteId> },
    /// Nothing matched the filters / 没有匹配的语录
    NoMatch,
    /// Every pick within the budget had a missing image / 重试次数用尽
    Exhausted { purged: Vec<QuoteId> },
}

impl Retrieval {
    pub fn quote(&self) -> Option<&Quote> {
        match self {
            Retrieval::Found(quote) | Retrieval::Healed { quote, .. } => Some(quote),
            _ => None,
        }
    }

    pub fn into_quote(self) -> Option<Quote> {
        match self {
            Retrieval::Found(quote) | Retrieval::Healed { quote, .. } => Some(quote),
            _ => None,
        }
    }

    /// Ids deleted because their image was gone / 被清理的记录ID
    pub fn purged(&self) -> &[QuoteId] {
        match self {
            Retrieval::Healed { purged, .. } | Retrieval::Exhausted { purged } => purged,
            _ => &[],
        }
    }
}

/// Keyword retrieval that may fall back to a random pick / 关键词获取（可回退随机）
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub retrieval: Retrieval,
    /// The keyword found nothing usable and a random quote was drawn instead
    pub fell_back: bool,
}

/// Fields of a quote whose image is already stored / 已有图片的入库请求
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub group_id: String,
    pub image_path: String,
    pub image_hash: Option<String>,
    pub ocr_text: Option<String>,
    pub recorded_text: Option<String>,
    pub quoted_user_id: Option<String>,
    pub uploader_user_id: Option<String>,
}

/// A quote arriving as raw image bytes / 以图片数据入库的请求
#[derive(Debug, Clone, Default)]
pub struct ImageUpload {
    pub group_id: String,
    pub image: Vec<u8>,
    pub ocr_text: Option<String>,
    pub recorded_text: Option<String>,
    pub quoted_user_id: Option<String>,
    pub uploader_user_id: Option<String>,
}

/// Quote service / 语录服务
pub struct QuoteService {
    store: Arc<dyn RecordStore>,
    images: Arc<dyn ImageStore>,
    hasher: Arc<dyn ImageHasher>,
    tags: TagExtractor,
    gate: DuplicateGate,
    search: SearchEngine,
    selector: AntiRepeatSelector,
    heal_attempts: usize,
}

impl QuoteService {
    /// Service with default selector and retrieval settings / 使用默认设置创建服务
    pub fn new(
        store: Arc<dyn RecordStore>,
        images: Arc<dyn ImageStore>,
        hasher: Arc<dyn ImageHasher>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let defaults = AppConfig::default();
        let tags = TagExtractor::new(tokenizer);
        Self {
            gate: DuplicateGate::new(store.clone()),
            search: SearchEngine::new(store.clone(), tags.clone()),
            selector: AntiRepeatSelector::from_config(&defaults.selector),
            heal_attempts: defaults.retrieval.heal_attempts,
            store,
            images,
            hasher,
            tags,
        }
    }

    pub fn with_selector(mut self, selector: AntiRepeatSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_heal_attempts(mut self, attempts: usize) -> Self {
        self.heal_attempts = attempts.max(1);
        self
    }

    /// Production wiring: SQLite store, local images, jieba / 按配置创建服务
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let data_dir = config.get_data_dir();
        if !data_dir.exists() {
            tokio::fs::create_dir_all(&data_dir).await?;
            tracing::info!("Created data directory: {:?}", data_dir);
        }

        let store = SqliteStore::connect(&config.get_database_url()).await?;
        let images = LocalImageStore::new(data_dir, config.images.dir.clone());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(images),
            Arc::new(ContentHasher),
            Arc::new(JiebaTokenizer::new()),
        )
        .with_selector(AntiRepeatSelector::from_config(&config.selector))
        .with_heal_attempts(config.retrieval.heal_attempts))
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn selector(&self) -> &AntiRepeatSelector {
        &self.selector
    }

    // ---- ingestion / 入库 ----

    /// Check a candidate against existing quotes / 查重
    pub async fn find_duplicate(&self, candidate: &Candidate<'_>) -> Result<Option<Quote>> {
        Ok(self.gate.check(candidate).await?.into_existing())
    }

    /// Tag, dedup and create; returns the quote and whether it is new / 入库
    pub async fn ingest(&self, request: IngestRequest) -> Result<(Quote, bool)> {
        let image_path = self.images.normalize(&request.image_path);
        tracing::info!(
            "Ingesting quote - group: {}, path: {}, quoted: {:?}, uploader: {:?}",
            request.group_id,
            image_path,
            request.quoted_user_id,
            request.uploader_user_id
        );

        if let Some(existing) = self.duplicate_of(&request).await? {
            tracing::warn!(
                "Duplicate quote in group {}, existing id {}",
                request.group_id,
                existing.id
            );
            return Ok((existing, false));
        }

        let source = tag_source(request.ocr_text.as_deref(), request.recorded_text.as_deref());
        let tags = self.tags.extract(source);

        let new_quote = NewQuote {
            group_id: request.group_id.clone(),
            image_path: image_path.clone(),
            image_hash: request.image_hash.clone(),
            ocr_text: request.ocr_text.clone(),
            recorded_text: request.recorded_text.clone(),
            tags,
            quoted_user_id: request.quoted_user_id.clone(),
            uploader_user_id: request.uploader_user_id.clone(),
        };

        match self.store.create(new_quote).await {
            Ok(quote) => {
                tracing::info!("Quote {} added to group {}", quote.id, quote.group_id);
                Ok((quote, true))
            }
            Err(Error::Conflict(msg)) => {
                // Lost a race with a concurrent ingestion of the same content
                if let Some(existing) = self.duplicate_of(&request).await? {
                    tracing::warn!("Concurrent duplicate in group {}: {}", request.group_id, msg);
                    return Ok((existing, false));
                }
                // The path is unique across groups; only our own record counts
                let same_path = self
                    .store
                    .filter(&QuoteQuery::all().with_path_suffix(image_path.as_str()))
                    .await?
                    .into_iter()
                    .find(|q| q.image_path == image_path);
                match same_path {
                    Some(existing) if existing.group_id == request.group_id => {
                        Ok((existing, false))
                    }
                    Some(existing) => {
                        tracing::warn!(
                            "Image {} already belongs to quote {} in group {}",
                            image_path,
                            existing.id,
                            existing.group_id
                        );
                        Err(Error::Conflict(msg))
                    }
                    None => Err(Error::Conflict(msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn duplicate_of(&self, request: &IngestRequest) -> Result<Option<Quote>> {
        self.find_duplicate(&Candidate {
            group_id: &request.group_id,
            image_hash: request.image_hash.as_deref(),
            recorded_text: request.recorded_text.as_deref(),
            quoted_user_id: request.quoted_user_id.as_deref(),
        })
        .await
    }

    /// Hash, dedup, store the image and create / 以图片数据入库
    ///
    /// The image file is written only when the quote is new.
    pub async fn ingest_image(&self, upload: ImageUpload) -> Result<(Quote, bool)> {
        let image_hash = hash_or_none(self.hasher.as_ref(), &upload.image);

        let existing = self
            .find_duplicate(&Candidate {
                group_id: &upload.group_id,
                image_hash: image_hash.as_deref(),
                recorded_text: upload.recorded_text.as_deref(),
                quoted_user_id: upload.quoted_user_id.as_deref(),
            })
            .await?;
        if let Some(existing) = existing {
            tracing::warn!(
                "Duplicate image in group {}, existing id {}",
                upload.group_id,
                existing.id
            );
            return Ok((existing, false));
        }

        let saved = self.images.save(&upload.group_id, &upload.image).await?;
        let image_path = saved.path.clone();
        let result = self
            .ingest(IngestRequest {
                group_id: upload.group_id,
                image_path: image_path.clone(),
                image_hash,
                ocr_text: upload.ocr_text,
                recorded_text: upload.recorded_text,
                quoted_user_id: upload.quoted_user_id,
                uploader_user_id: upload.uploader_user_id,
            })
            .await;

        // A file that was already there may belong to another record
        let keep_file = saved.existed
            || matches!(&result, Ok((quote, _)) if quote.image_path == image_path);
        if !keep_file {
            if let Err(e) = self.images.remove(&image_path).await {
                tracing::warn!("Failed to remove unused image {}: {}", image_path, e);
            }
        }
        result
    }

    // ---- retrieval / 获取 ----

    /// Random quote of a group, optionally about one user / 随机获取语录
    pub async fn random(&self, group_id: &str, user_filter: Option<&str>) -> Result<Retrieval> {
        tracing::info!("Random quote - group: {}, user: {:?}", group_id, user_filter);
        let candidates = self
            .store
            .filter(&QuoteQuery::group(group_id).with_quoted_user(user_filter))
            .await?;
        if candidates.is_empty() {
            tracing::info!("No quotes in group {} (user: {:?})", group_id, user_filter);
            return Ok(Retrieval::NoMatch);
        }
        self.deliver(SelectionKey::random(group_id, user_filter), candidates)
            .await
    }

    /// Quote matching a keyword query / 按关键词获取语录
    pub async fn search(
        &self,
        group_id: &str,
        query: &str,
        user_filter: Option<&str>,
    ) -> Result<Retrieval> {
        tracing::info!(
            "Search quote - group: {}, query: '{}', user: {:?}",
            group_id,
            query,
            user_filter
        );
        let matches = self.search.search(group_id, query, user_filter).await?;
        if matches.is_empty() {
            return Ok(Retrieval::NoMatch);
        }
        let key = SelectionKey::search(group_id, user_filter, query.trim());
        self.deliver(key, matches.quotes).await
    }

    /// Keyword retrieval falling back to a random quote of the same scope / 搜索失败时随机
    pub async fn search_or_random(
        &self,
        group_id: &str,
        query: &str,
        user_filter: Option<&str>,
    ) -> Result<SearchOutcome> {
        if query.trim().is_empty() {
            return Ok(SearchOutcome {
                retrieval: self.random(group_id, user_filter).await?,
                fell_back: false,
            });
        }

        let searched = self.search(group_id, query, user_filter).await?;
        let purged = match searched {
            Retrieval::NoMatch => Vec::new(),
            Retrieval::Exhausted { purged } => purged,
            found => {
                return Ok(SearchOutcome {
                    retrieval: found,
                    fell_back: false,
                })
            }
        };

        tracing::info!("Nothing usable for '{}' in group {}, picking at random", query, group_id);
        let retrieval = match self.random(group_id, user_filter).await? {
            Retrieval::Found(quote) if !purged.is_empty() => Retrieval::Healed { quote, purged },
            Retrieval::Healed { quote, purged: more } => Retrieval::Healed {
                quote,
                purged: purged.into_iter().chain(more).collect(),
            },
            Retrieval::NoMatch if !purged.is_empty() => Retrieval::Exhausted { purged },
            Retrieval::Exhausted { purged: more } => Retrieval::Exhausted {
                purged: purged.into_iter().chain(more).collect(),
            },
            other => other,
        };
        Ok(SearchOutcome {
            retrieval,
            fell_back: true,
        })
    }

    /// Select, confirm the image, heal on missing images, count the view / 选择并投递
    async fn deliver(&self, key: SelectionKey, mut candidates: Vec<Quote>) -> Result<Retrieval> {
        let mut purged = Vec::new();

        for _ in 0..self.heal_attempts.max(1) {
            if candidates.is_empty() {
                break;
            }
            let chosen = self.selector.select(&key, &candidates).clone();

            if self.images.exists(&chosen.image_path).await {
                let quote = self.record_view(chosen).await;
                tracing::info!("Delivering quote {} ({})", quote.id, quote.image_path);
                return Ok(if purged.is_empty() {
                    Retrieval::Found(quote)
                } else {
                    Retrieval::Healed { quote, purged }
                });
            }

            tracing::warn!(
                "Image missing for quote {} ({}), deleting record",
                chosen.id,
                chosen.image_path
            );
            self.store.delete(chosen.id).await?;
            candidates.retain(|q| q.id != chosen.id);
            purged.push(chosen.id);
        }

        tracing::warn!("No usable quote for {} after purging {:?}", key, purged);
        Ok(Retrieval::Exhausted { purged })
    }

    async fn record_view(&self, mut quote: Quote) -> Quote {
        match self.store.increment_view_count(quote.id).await {
            Ok(true) => quote.view_count += 1,
            Ok(false) => {
                tracing::warn!("Quote {} vanished before its view was counted", quote.id)
            }
            Err(e) => {
                tracing::warn!("Failed to increment view count of quote {}: {}", quote.id, e)
            }
        }
        quote
    }

    // ---- lookups / 查询 ----

    /// Quote whose image file name ends with `basename` / 按文件名查找语录
    ///
    /// An exact file name match wins over a longer name sharing the suffix.
    /// A blank basename finds nothing.
    pub async fn find_by_basename(&self, group_id: &str, basename: &str) -> Result<Option<Quote>> {
        let basename = basename.trim();
        if basename.is_empty() {
            tracing::debug!("Blank file name lookup in group {}", group_id);
            return Ok(None);
        }

        let mut matches = self
            .store
            .filter(&QuoteQuery::group(group_id).with_path_suffix(basename))
            .await?;
        let exact = matches
            .iter()
            .position(|q| q.image_basename().eq_ignore_ascii_case(basename));
        let found = match exact {
            Some(i) => Some(matches.swap_remove(i)),
            None => matches.into_iter().next(),
        };
        match &found {
            Some(q) => tracing::info!("Found quote {} for file {}", q.id, basename),
            None => tracing::info!("No quote in group {} for file {}", group_id, basename),
        }
        Ok(found)
    }

    /// Most recently added quote of a group / 最后一条语录
    pub async fn last_quote(&self, group_id: &str) -> Result<Option<Quote>> {
        self.store
            .first(&QuoteQuery::group(group_id).order_by(QuoteOrder::IdDesc))
            .await
    }

    /// Every quote of every group / 所有语录
    pub async fn all_quotes(&self) -> Result<Vec<Quote>> {
        let quotes = self.store.filter(&QuoteQuery::all()).await?;
        tracing::info!("Loaded all quotes: {}", quotes.len());
        Ok(quotes)
    }

    /// Bulk match for administrative deletion / 批量匹配
    pub async fn bulk_match(&self, filter: &BulkMatch) -> Result<Vec<Quote>> {
        self.search.bulk_match(filter).await
    }

    // ---- tags / 标签 ----

    pub async fn add_tags<S: AsRef<str>>(&self, quote: &Quote, tags: &[S]) -> Result<Quote> {
        let mut updated = quote.tags.clone();
        updated.extend(
            tags.iter()
                .map(|t| t.as_ref().trim())
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
        self.set_tags(quote, updated).await
    }

    pub async fn remove_tags<S: AsRef<str>>(&self, quote: &Quote, tags: &[S]) -> Result<Quote> {
        let removed: HashSet<&str> = tags.iter().map(|t| t.as_ref().trim()).collect();
        let updated: BTreeSet<String> = quote
            .tags
            .iter()
            .filter(|t| !removed.contains(t.as_str()))
            .cloned()
            .collect();
        self.set_tags(quote, updated).await
    }

    async fn set_tags(&self, quote: &Quote, tags: BTreeSet<String>) -> Result<Quote> {
        if !self.store.update_tags(quote.id, &tags).await? {
            return Err(Error::NotFound(format!("quote {}", quote.id)));
        }
        tracing::info!("Quote {} tags updated: {:?}", quote.id, tags);
        Ok(Quote {
            tags,
            ..quote.clone()
        })
    }

    // ---- deletion / 删除 ----

    /// Delete a record and release its image / 删除语录及图片
    ///
    /// Image removal failures are logged; the record is deleted regardless.
    pub async fn delete_quote(&self, quote: &Quote) -> Result<bool> {
        match self.images.remove(&quote.image_path).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!("Image already missing: {}", quote.image_path),
            Err(e) => tracing::warn!("Failed to remove image {}: {}", quote.image_path, e),
        }
        let deleted = self.store.delete(quote.id).await?;
        if deleted {
            tracing::info!("Quote {} deleted from group {}", quote.id, quote.group_id);
        }
        Ok(deleted)
    }

    pub async fn delete_by_basename(&self, group_id: &str, basename: &str) -> Result<bool> {
        if basename.trim().is_empty() {
            return Err(Error::InvalidInput("file name to delete is empty".to_string()));
        }
        match self.find_by_basename(group_id, basename).await? {
            Some(quote) => self.delete_quote(&quote).await,
            None => {
                tracing::warn!(
                    "Quote to delete not found - group: {}, file: {}",
                    group_id,
                    basename
                );
                Ok(false)
            }
        }
    }

    /// Delete every quote given, returns how many records went away / 批量删除
    pub async fn bulk_delete(&self, quotes: &[Quote]) -> Result<usize> {
        let mut deleted = 0;
        for quote in quotes {
            if self.delete_quote(quote).await? {
                deleted += 1;
            }
        }
        tracing::info!("Bulk delete removed {}/{} quotes", deleted, quotes.len());
        Ok(deleted)
    }

    // ---- statistics / 统计 ----

    /// Most viewed quotes / 最热门语录
    pub async fn hottest(&self, group_id: &str, limit: usize) -> Result<Vec<Quote>> {
        let quotes = self
            .store
            .filter(
                &QuoteQuery::group(group_id)
                    .order_by(QuoteOrder::ViewsDesc)
                    .with_limit(limit),
            )
            .await?;
        for (rank, quote) in quotes.iter().enumerate() {
            let kind = if quote.is_image_only() { "image" } else { "text" };
            tracing::debug!(
                "Hottest #{} in group {}: quote {} ({}), {} views",
                rank + 1,
                group_id,
                quote.id,
                kind,
                quote.view_count
            );
        }
        Ok(quotes)
    }

    pub async fn top_uploaders(&self, group_id: &str, limit: usize) -> Result<Vec<AggregateRow>> {
        self.store.count_by(group_id, UserField::Uploader, limit).await
    }

    pub async fn top_quoted(&self, group_id: &str, limit: usize) -> Result<Vec<AggregateRow>> {
        self.store.count_by(group_id, UserField::Quoted, limit).await
    }

    /// Quotes uploaded by or about users no longer in the group / 已退群用户的语录
    pub async fn quotes_from_departed(
        &self,
        group_id: &str,
        current_members: &HashSet<String>,
    ) -> Result<Vec<Quote>> {
        let quotes = self.store.filter(&QuoteQuery::group(group_id)).await?;
        let mut departed: Vec<String> = quotes
            .iter()
            .flat_map(|q| [q.uploader_user_id.as_ref(), q.quoted_user_id.as_ref()])
            .flatten()
            .filter(|u| !current_members.contains(*u))
            .cloned()
            .collect();
        departed.sort();
        departed.dedup();

        if departed.is_empty() {
            tracing::info!("No quotes from departed users in group {}", group_id);
            return Ok(Vec::new());
        }
        tracing::info!("Group {} has {} departed users with quotes", group_id, departed.len());

        self.store
            .filter(&QuoteQuery::group(group_id).involving(departed))
            .await
    }
}
