//! Image resources behind quotes / 语录图片资源
//!
//! Records store image paths relative to the data directory (posix
//! separators). Absolute paths written by older versions are used as-is.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Result of saving an image / 图片保存结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    /// Stored path, relative to the data directory / 相对路径
    pub path: String,
    /// The file was already there before this save / 文件在保存前已存在
    pub existed: bool,
}

/// Backing image storage / 图片存储接口
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist image bytes under an optional name prefix / 保存图片
    ///
    /// An existing file with the same name is left untouched and reported
    /// through [`SavedImage::existed`].
    async fn save(&self, prefix: &str, data: &[u8]) -> Result<SavedImage>;

    /// Path in stored form: posix separators, relative to the data
    /// directory where possible / 规范化为存储路径
    fn normalize(&self, path: &str) -> String {
        path.trim().replace('\\', "/")
    }

    /// Whether the image behind a stored path exists / 图片是否存在
    async fn exists(&self, path: &str) -> bool;

    /// Remove an image, `false` when it was already gone / 删除图片
    async fn remove(&self, path: &str) -> Result<bool>;
}

/// Local filesystem image store / 本地图片存储
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    /// Data directory, stored paths are relative to it / 数据目录
    root: PathBuf,
    /// Images directory relative to root / 图片目录（相对数据目录）
    images_dir: String,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>, images_dir: impl Into<String>) -> Self {
        let images_dir: String = images_dir.into();
        Self {
            root: root.into(),
            images_dir: images_dir.replace('\\', "/").trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored path to an absolute one / 解析为绝对路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }

        // Reject traversal out of the data directory / 禁止越出数据目录
        let parts: Vec<&str> = path
            .split(&['/', '\\'][..])
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        if parts.iter().any(|p| *p == "..") {
            return Err(Error::InvalidInput(format!(
                "image path escapes data directory: {}",
                path
            )));
        }
        Ok(self.root.join(parts.join("/")))
    }

    /// File name derived from content: `[prefix_]md5hex.png` / 按内容生成文件名
    pub fn file_name(prefix: &str, data: &[u8]) -> String {
        let prefix: String = prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if prefix.is_empty() {
            format!("{:x}.png", md5::compute(data))
        } else {
            format!("{}_{:x}.png", prefix, md5::compute(data))
        }
    }

    /// Strip the data directory prefix from a path, posix separators / 转为相对数据目录的路径
    pub fn relative_to_root(&self, path: &str) -> String {
        let path = path.trim().replace('\\', "/");
        let root = self.root.to_string_lossy().replace('\\', "/");
        let root = root.trim_end_matches('/');
        let root = root.strip_prefix("./").unwrap_or(root);
        let path_rel = path.strip_prefix("./").unwrap_or(&path);

        if root.is_empty() || root == "." {
            return path_rel.to_string();
        }
        match path_rel.strip_prefix(root) {
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
            _ => path_rel.to_string(),
        }
    }

    fn relative_path(&self, file_name: &str) -> String {
        if self.images_dir.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.images_dir, file_name)
        }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn save(&self, prefix: &str, data: &[u8]) -> Result<SavedImage> {
        if data.is_empty() {
            return Err(Error::InvalidInput("empty image data".to_string()));
        }
        let relative = self.relative_path(&Self::file_name(prefix, data));
        let absolute = self.resolve(&relative)?;

        // Same name means same bytes, keep whatever is already there
        if tokio::fs::metadata(&absolute).await.map_or(false, |m| m.is_file()) {
            tracing::debug!("Image already stored: {:?}", absolute);
            return Ok(SavedImage {
                path: relative,
                existed: true,
            });
        }

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&absolute, data).await?;
        tracing::debug!("Image saved: {:?}", absolute);
        Ok(SavedImage {
            path: relative,
            existed: false,
        })
    }

    fn normalize(&self, path: &str) -> String {
        self.relative_to_root(path)
    }

    async fn exists(&self, path: &str) -> bool {
        let absolute = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Cannot resolve image path {}: {}", path, e);
                return false;
            }
        };
        match tokio::fs::metadata(&absolute).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("Checking image {:?} failed: {}", absolute, e);
                false
            }
        }
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        let absolute = self.resolve(path)?;
        match tokio::fs::remove_file(&absolute).await {
            Ok(()) => {
                tracing::info!("Image removed: {:?}", absolute);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_exists_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "quote/images");

        let saved = store.save("123", b"image-bytes").await.unwrap();
        let path = saved.path.clone();
        assert!(!saved.existed);
        assert!(path.starts_with("quote/images/123_"));
        assert!(path.ends_with(".png"));
        assert!(store.exists(&path).await);

        // Same bytes land on the same file, which is reported as existing
        let again = store.save("123", b"image-bytes").await.unwrap();
        assert_eq!(again.path, path);
        assert!(again.existed);
        assert_ne!(store.save("456", b"image-bytes").await.unwrap().path, path);

        assert!(store.remove(&path).await.unwrap());
        assert!(!store.exists(&path).await);
        assert!(!store.remove(&path).await.unwrap());
    }

    #[test]
    fn test_resolve() {
        let store = LocalImageStore::new("/data", "/quote/images/");
        assert_eq!(
            store.resolve("quote/images/a.png").unwrap(),
            PathBuf::from("/data/quote/images/a.png")
        );
        assert_eq!(store.resolve("/abs/a.png").unwrap(), PathBuf::from("/abs/a.png"));
        assert!(store.resolve("../etc/passwd").is_err());
        assert_eq!(store.relative_path("a.png"), "quote/images/a.png");
    }

    #[test]
    fn test_relative_to_root() {
        let store = LocalImageStore::new("data", "quote/images");
        assert_eq!(store.normalize("data\\quote\\images\\a.png"), "quote/images/a.png");
        assert_eq!(store.normalize("./data/quote/images/a.png"), "quote/images/a.png");
        assert_eq!(store.normalize("quote/images/a.png"), "quote/images/a.png");
        // Only a whole leading component is stripped
        assert_eq!(store.normalize("database/a.png"), "database/a.png");

        let absolute = LocalImageStore::new("/srv/data/", "quote/images");
        assert_eq!(absolute.normalize("/srv/data/quote/images/a.png"), "quote/images/a.png");
        assert_eq!(absolute.normalize("/elsewhere/a.png"), "/elsewhere/a.png");
    }

    #[test]
    fn test_file_name_is_md5() {
        assert_eq!(LocalImageStore::file_name("", b""), "d41d8cd98f00b204e9800998ecf8427e.png");
        assert_eq!(
            LocalImageStore::file_name("../g1", b""),
            "g1_d41d8cd98f00b204e9800998ecf8427e.png"
        );
    }
}
