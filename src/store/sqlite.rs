//! SQLite record store
//!
//! - WAL 模式 + busy_timeout，支持并发读写
//! - 文本字段保存小写副本，用 instr 做不区分大小写的子串匹配
//! - 标签以 JSON 数组保存，标签匹配通过 json_each 展开

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use super::{QuoteOrder, QuoteQuery, RecordStore, TextMatch};
use crate::db;
use crate::error::{Error, Result};
use crate::models::{AggregateRow, NewQuote, Quote, QuoteId, UserField};
use crate::search::tokenizer::fold;

/// Any tag element containing the needle / 标签元素包含关键词
const TAG_CLAUSE: &str =
    "EXISTS (SELECT 1 FROM json_each(quotes.tags_lower) t WHERE instr(t.value, ?) > 0)";

const SELECT_COLUMNS: &str = "id, group_id, image_path, image_hash, ocr_text, recorded_text, \
    tags, quoted_user_id, uploader_user_id, created_at, view_count";

/// SQLite 语录存储
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// 使用现有连接池（需自行调用 init）
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// 连接数据库并初始化表结构
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let db = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { db };
        store.init().await?;
        tracing::info!("Quote database opened: {}", database_url);
        Ok(store)
    }

    /// 内存数据库，单连接（多个连接会各自得到独立的数据库）
    pub async fn in_memory() -> Result<Self> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { db };
        store.init().await?;
        Ok(store)
    }

    /// 初始化表结构
    pub async fn init(&self) -> Result<()> {
        db::run_migrations(&self.db).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.db.close().await;
    }
}

/// 标签转 JSON（原样 + 小写）
fn tags_json(tags: &BTreeSet<String>) -> Result<(String, String)> {
    let lower: Vec<String> = tags.iter().map(|t| fold(t)).collect();
    Ok((serde_json::to_string(tags)?, serde_json::to_string(&lower)?))
}

fn row_to_quote(row: &SqliteRow) -> Result<Quote> {
    let tags: String = row.try_get("tags")?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Serialization(format!("bad created_at {}: {}", created_at, e)))?
        .with_timezone(&Utc);

    Ok(Quote {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        image_path: row.try_get("image_path")?,
        image_hash: row.try_get("image_hash")?,
        ocr_text: row.try_get("ocr_text")?,
        recorded_text: row.try_get("recorded_text")?,
        tags: serde_json::from_str(&tags)?,
        quoted_user_id: row.try_get("quoted_user_id")?,
        uploader_user_id: row.try_get("uploader_user_id")?,
        created_at,
        view_count: row.try_get("view_count")?,
    })
}

/// 唯一约束冲突映射为 Conflict
fn map_unique(e: sqlx::Error, what: &str) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Conflict(format!("{}: {}", what, db.message()))
        }
        _ => Error::Database(e),
    }
}

/// 文本条件 -> SQL 片段 + 参数
fn text_clauses(text: &TextMatch, clauses: &mut Vec<String>, params: &mut Vec<String>) {
    for needles in &text.clauses {
        if needles.is_empty() {
            clauses.push("0".to_string());
            continue;
        }
        let mut parts = Vec::with_capacity(needles.len());
        for needle in needles {
            parts.push("instr(ocr_text_lower, ?) > 0".to_string());
            parts.push("instr(recorded_text_lower, ?) > 0".to_string());
            params.push(needle.clone());
            params.push(needle.clone());
            if text.include_tags {
                parts.push(TAG_CLAUSE.to_string());
                params.push(needle.clone());
            }
        }
        clauses.push(format!("({})", parts.join(" OR ")));
    }
}

/// 查询条件 -> WHERE 子句 + 参数
fn build_where(query: &QuoteQuery) -> (String, Vec<String>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<String> = Vec::new();

    let equals = [
        ("group_id", &query.group_id),
        ("quoted_user_id", &query.quoted_user_id),
        ("uploader_user_id", &query.uploader_user_id),
        ("image_hash", &query.image_hash),
        ("recorded_text", &query.recorded_text),
    ];
    for (column, value) in equals {
        if let Some(value) = value {
            clauses.push(format!("{} = ?", column));
            params.push(value.clone());
        }
    }

    if let Some(suffix) = &query.image_path_suffix {
        let suffix = fold(suffix);
        clauses.push(
            "substr(image_path_lower, length(image_path_lower) - length(?) + 1) = ?".to_string(),
        );
        params.push(suffix.clone());
        params.push(suffix);
    }

    if let Some(users) = &query.involving_users {
        if users.is_empty() {
            clauses.push("0".to_string());
        } else {
            let marks = vec!["?"; users.len()].join(", ");
            clauses.push(format!(
                "(uploader_user_id IN ({marks}) OR quoted_user_id IN ({marks}))"
            ));
            params.extend(users.iter().cloned());
            params.extend(users.iter().cloned());
        }
    }

    if let Some(text) = &query.text {
        text_clauses(text, &mut clauses, &mut params);
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (sql, params)
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create(&self, new: NewQuote) -> Result<Quote> {
        let created_at = Utc::now();
        let (tags, tags_lower) = tags_json(&new.tags)?;

        let result = sqlx::query(
            r#"
            INSERT INTO quotes (
                group_id, image_path, image_path_lower, image_hash,
                ocr_text, ocr_text_lower, recorded_text, recorded_text_lower,
                tags, tags_lower, quoted_user_id, uploader_user_id, created_at, view_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&new.group_id)
        .bind(&new.image_path)
        .bind(fold(&new.image_path))
        .bind(&new.image_hash)
        .bind(&new.ocr_text)
        .bind(new.ocr_text.as_deref().map(fold))
        .bind(&new.recorded_text)
        .bind(new.recorded_text.as_deref().map(fold))
        .bind(&tags)
        .bind(&tags_lower)
        .bind(&new.quoted_user_id)
        .bind(&new.uploader_user_id)
        .bind(created_at.to_rfc3339())
        .execute(&self.db)
        .await
        .map_err(|e| map_unique(e, "quote already stored"))?;

        Ok(Quote {
            id: result.last_insert_rowid(),
            group_id: new.group_id,
            image_path: new.image_path,
            image_hash: new.image_hash,
            ocr_text: new.ocr_text,
            recorded_text: new.recorded_text,
            tags: new.tags,
            quoted_user_id: new.quoted_user_id,
            uploader_user_id: new.uploader_user_id,
            created_at,
            view_count: 0,
        })
    }

    async fn get(&self, id: QuoteId) -> Result<Option<Quote>> {
        let sql = format!("SELECT {} FROM quotes WHERE id = ?", SELECT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(row_to_quote).transpose()
    }

    async fn delete(&self, id: QuoteId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM quotes WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn filter(&self, query: &QuoteQuery) -> Result<Vec<Quote>> {
        let (where_sql, params) = build_where(query);
        let order = match query.order {
            QuoteOrder::IdAsc => "id ASC",
            QuoteOrder::IdDesc => "id DESC",
            QuoteOrder::ViewsDesc => "view_count DESC, id ASC",
        };
        let mut sql = format!(
            "SELECT {} FROM quotes{} ORDER BY {}",
            SELECT_COLUMNS, where_sql, order
        );
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut q = sqlx::query(&sql);
        for param in &params {
            q = q.bind(param);
        }
        let rows = q.fetch_all(&self.db).await?;
        rows.iter().map(row_to_quote).collect()
    }

    async fn update_tags(&self, id: QuoteId, tags: &BTreeSet<String>) -> Result<bool> {
        let (tags, tags_lower) = tags_json(tags)?;
        let result = sqlx::query("UPDATE quotes SET tags = ?, tags_lower = ? WHERE id = ?")
            .bind(&tags)
            .bind(&tags_lower)
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increment_view_count(&self, id: QuoteId) -> Result<bool> {
        let result = sqlx::query("UPDATE quotes SET view_count = view_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_by(
        &self,
        group_id: &str,
        field: UserField,
        limit: usize,
    ) -> Result<Vec<AggregateRow>> {
        let column = field.column();
        let sql = format!(
            "SELECT {column} AS user_id, COUNT(*) AS cnt FROM quotes \
             WHERE group_id = ? AND {column} IS NOT NULL \
             GROUP BY {column} ORDER BY cnt DESC, user_id ASC LIMIT ?"
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(group_id)
            .bind(limit as i64)
            .fetch_all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, count)| AggregateRow { user_id, count })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_quote(group: &str, path: &str) -> NewQuote {
        NewQuote {
            group_id: group.to_string(),
            image_path: path.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut new = new_quote("g1", "quote/images/ABC.png");
        new.ocr_text = Some("Привет мир".to_string());
        new.tags = ["привет".to_string(), "мир".to_string()].into_iter().collect();
        let created = store.create(new).await.unwrap();

        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.tags, created.tags);
        assert_eq!(fetched.ocr_text.as_deref(), Some("Привет мир"));
        assert_eq!(fetched.view_count, 0);
        assert!(store.get(created.id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_path_and_hash() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create(new_quote("g", "a.png")).await.unwrap();
        let err = store.create(new_quote("g", "a.png")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut hashed = new_quote("g", "b.png");
        hashed.image_hash = Some("abcd".to_string());
        store.create(hashed.clone()).await.unwrap();
        hashed.image_path = "c.png".to_string();
        assert!(matches!(store.create(hashed).await, Err(Error::Conflict(_))));

        // NULL hashes never conflict
        store.create(new_quote("g", "d.png")).await.unwrap();
        store.create(new_quote("g", "e.png")).await.unwrap();
    }

    #[tokio::test]
    async fn test_text_match_case_insensitive_unicode() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut a = new_quote("g", "a.png");
        a.ocr_text = Some("Привет Мир".to_string());
        let a = store.create(a).await.unwrap();
        let mut b = new_quote("g", "b.png");
        b.recorded_text = Some("hello".to_string());
        b.tags = ["Alpha".to_string()].into_iter().collect();
        let b = store.create(b).await.unwrap();

        let found = store
            .filter(&QuoteQuery::group("g").with_text(TextMatch::phrase("МИР")))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, a.id);

        // Tags only count when asked for
        let text = TextMatch::phrase("alpha");
        assert!(store
            .filter(&QuoteQuery::group("g").with_text(text.clone()))
            .await
            .unwrap()
            .is_empty());
        let found = store
            .filter(&QuoteQuery::group("g").with_text(text.with_tags()))
            .await
            .unwrap();
        assert_eq!(found[0].id, b.id);
    }

    #[tokio::test]
    async fn test_filters_and_ordering() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut ids = Vec::new();
        for (i, user) in ["u1", "u2", "u1"].iter().enumerate() {
            let mut q = new_quote("g", &format!("quote/images/{}.PNG", i));
            q.quoted_user_id = Some(user.to_string());
            ids.push(store.create(q).await.unwrap().id);
        }
        store.create(new_quote("other", "x.png")).await.unwrap();

        let by_user = store
            .filter(&QuoteQuery::group("g").with_quoted_user(Some("u1")))
            .await
            .unwrap();
        assert_eq!(by_user.len(), 2);

        let by_suffix = store
            .first(&QuoteQuery::group("g").with_path_suffix("1.png"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_suffix.id, ids[1]);

        store.increment_view_count(ids[2]).await.unwrap();
        store.increment_view_count(ids[2]).await.unwrap();
        store.increment_view_count(ids[0]).await.unwrap();
        let hottest = store
            .filter(&QuoteQuery::group("g").order_by(QuoteOrder::ViewsDesc).with_limit(2))
            .await
            .unwrap();
        assert_eq!(hottest.iter().map(|q| q.id).collect::<Vec<_>>(), vec![ids[2], ids[0]]);

        let last = store
            .first(&QuoteQuery::group("g").order_by(QuoteOrder::IdDesc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, ids[2]);

        let involving = store
            .filter(&QuoteQuery::group("g").involving(vec!["u2".to_string()]))
            .await
            .unwrap();
        assert_eq!(involving.len(), 1);

        assert_eq!(store.filter(&QuoteQuery::all()).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_tags_delete_and_counts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut q = new_quote("g", "a.png");
        q.uploader_user_id = Some("up".to_string());
        let q = store.create(q).await.unwrap();

        let tags: BTreeSet<String> = ["x".to_string(), "y".to_string()].into_iter().collect();
        assert!(store.update_tags(q.id, &tags).await.unwrap());
        assert_eq!(store.get(q.id).await.unwrap().unwrap().tags, tags);

        let rows = store.count_by("g", UserField::Uploader, 5).await.unwrap();
        assert_eq!(rows, vec![AggregateRow { user_id: "up".to_string(), count: 1 }]);

        assert!(store.delete(q.id).await.unwrap());
        assert!(!store.delete(q.id).await.unwrap());
        assert!(!store.increment_view_count(q.id).await.unwrap());
    }
}
