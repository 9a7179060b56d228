//! Image hash adapter / 图片哈希适配器
//!
//! Any image -> fixed-format string function can be plugged in (a perceptual
//! hash in production). Equal strings are treated as the same image.

use sha2::{Digest, Sha256};

/// Image fingerprint capability / 图片指纹能力
pub trait ImageHasher: Send + Sync {
    fn hash(&self, image: &[u8]) -> anyhow::Result<String>;
}

/// Content hash: SHA-256 over the raw bytes, hex encoded / 内容哈希
///
/// Only byte-identical images collide. Used when no perceptual hasher is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ImageHasher for ContentHasher {
    fn hash(&self, image: &[u8]) -> anyhow::Result<String> {
        if image.is_empty() {
            anyhow::bail!("empty image data");
        }
        Ok(hex::encode(Sha256::digest(image)))
    }
}

/// Hash with failure degraded to "no hash" / 计算哈希，失败时返回 None
pub fn hash_or_none(hasher: &dyn ImageHasher, image: &[u8]) -> Option<String> {
    match hasher.hash(image) {
        Ok(hash) if !hash.is_empty() => Some(hash),
        Ok(_) => {
            tracing::warn!("Image hasher returned an empty hash, skipping hash check");
            None
        }
        Err(e) => {
            tracing::warn!("Image hashing failed, skipping hash check: {}", e);
            None
        }
    }
}
