use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Store-assigned quote identifier / 语录ID
pub type QuoteId = i64;

/// A stored quote / 语录记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub group_id: String,
    /// Image path relative to the data directory / 图片路径（相对数据目录）
    pub image_path: String,
    /// Perceptual hash of the image, duplicate detection only / 图片哈希值
    pub image_hash: Option<String>,
    /// OCR text of an uploaded image / OCR识别文本
    pub ocr_text: Option<String>,
    /// Text of a recorded chat message / 记录的文本
    pub recorded_text: Option<String>,
    pub tags: BTreeSet<String>,
    /// User the quote is about / 被记录用户
    pub quoted_user_id: Option<String>,
    /// User who submitted the quote / 上传者
    pub uploader_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub view_count: i64,
}

impl Quote {
    /// Pure image quote: no text and no tags, only reachable by random pick / 纯图片语录
    pub fn is_image_only(&self) -> bool {
        self.ocr_text.as_deref().map_or(true, str::is_empty)
            && self.recorded_text.as_deref().map_or(true, str::is_empty)
            && self.tags.is_empty()
    }

    /// File name part of the image path / 图片文件名
    pub fn image_basename(&self) -> &str {
        self.image_path
            .rsplit(|c: char| c == '/' || c == '\\')
            .next()
            .unwrap_or(&self.image_path)
    }
}

/// Tag source: non-empty OCR text first, then non-empty recorded text / 标签来源
pub fn tag_source<'a>(
    ocr_text: Option<&'a str>,
    recorded_text: Option<&'a str>,
) -> Option<&'a str> {
    ocr_text
        .filter(|t| !t.is_empty())
        .or(recorded_text.filter(|t| !t.is_empty()))
}

/// Fields for creating a quote / 创建语录的字段
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewQuote {
    pub group_id: String,
    pub image_path: String,
    pub image_hash: Option<String>,
    pub ocr_text: Option<String>,
    pub recorded_text: Option<String>,
    pub tags: BTreeSet<String>,
    pub quoted_user_id: Option<String>,
    pub uploader_user_id: Option<String>,
}

/// One row of a count-by-user statistic / 统计行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub user_id: String,
    pub count: i64,
}

/// User column a statistic groups by / 统计分组字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserField {
    Uploader,
    Quoted,
}

impl UserField {
    pub fn column(&self) -> &'static str {
        match self {
            UserField::Uploader => "uploader_user_id",
            UserField::Quoted => "quoted_user_id",
        }
    }

    pub fn value<'a>(&self, quote: &'a Quote) -> Option<&'a str> {
        match self {
            UserField::Uploader => quote.uploader_user_id.as_deref(),
            UserField::Quoted => quote.quoted_user_id.as_deref(),
        }
    }
}
