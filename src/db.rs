use sqlx::SqlitePool;

use crate::error::Result;

/// Run database migrations / 运行数据库迁移
///
/// `*_lower` columns hold case-folded copies used for substring matching,
/// SQLite's own `lower()` only folds ASCII. / 小写副本列用于子串匹配
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quotes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id TEXT NOT NULL,
            image_path TEXT NOT NULL UNIQUE,
            image_path_lower TEXT NOT NULL,
            image_hash TEXT,
            ocr_text TEXT,
            ocr_text_lower TEXT,
            recorded_text TEXT,
            recorded_text_lower TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            tags_lower TEXT NOT NULL DEFAULT '[]',
            quoted_user_id TEXT,
            uploader_user_id TEXT,
            created_at TEXT NOT NULL,
            view_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quotes_group ON quotes(group_id)")
        .execute(pool)
        .await?;

    // NULL hashes never collide in a SQLite unique index
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_quotes_group_hash ON quotes(group_id, image_hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_quotes_quoted ON quotes(group_id, quoted_user_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_quotes_uploader ON quotes(group_id, uploader_user_id)",
    )
    .execute(pool)
    .await?;

    tracing::debug!("Quote tables ready");
    Ok(())
}
