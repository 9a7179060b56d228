//! Tokenizer adapter - word segmentation behind a swappable trait / 分词适配器
//!
//! - Default implementation uses jieba-rs (Chinese-English mixed text) / 默认使用 jieba
//! - `WhitespaceTokenizer` splits on whitespace only, deterministic / 按空白切分
//!
//! Tokenizers only cut text. Stopword and punctuation filtering lives in
//! the tag extractor. / 停用词过滤在标签提取器中完成

use jieba_rs::Jieba;
use once_cell::sync::Lazy;

/// Global jieba instance, the dictionary is loaded once / 全局 jieba 分词器实例
static JIEBA: Lazy<Jieba> = Lazy::new(Jieba::new);

/// Word segmentation capability / 分词能力
pub trait Tokenizer: Send + Sync {
    /// Cut text into tokens / 对文本进行分词
    fn cut(&self, text: &str) -> anyhow::Result<Vec<String>>;
}

/// jieba-rs tokenizer / jieba 分词器
#[derive(Debug, Clone, Copy)]
pub struct JiebaTokenizer {
    hmm: bool,
}

impl JiebaTokenizer {
    pub fn new() -> Self {
        Self { hmm: true }
    }

    /// Disable HMM new-word discovery / 关闭 HMM 新词发现
    pub fn without_hmm() -> Self {
        Self { hmm: false }
    }
}

impl Default for JiebaTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for JiebaTokenizer {
    fn cut(&self, text: &str) -> anyhow::Result<Vec<String>> {
        Ok(JIEBA
            .cut(text, self.hmm)
            .into_iter()
            .map(str::to_string)
            .collect())
    }
}

/// Whitespace tokenizer / 空白分词器
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn cut(&self, text: &str) -> anyhow::Result<Vec<String>> {
        Ok(text.split_whitespace().map(str::to_string).collect())
    }
}

/// Case-fold text for substring matching / 转小写用于子串匹配
pub fn fold(text: &str) -> String {
    text.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jieba_chinese() {
        let tokens = JiebaTokenizer::new().cut("我们中出了一个叛徒").unwrap();
        assert!(!tokens.is_empty());
        assert_eq!(tokens.concat(), "我们中出了一个叛徒");
    }

    #[test]
    fn test_jieba_mixed() {
        let tokens = JiebaTokenizer::new().cut("测试 hello").unwrap();
        assert!(tokens.iter().any(|t| t == "hello"));
    }

    #[test]
    fn test_whitespace() {
        let tokens = WhitespaceTokenizer.cut("  alpha beta\tgamma ").unwrap();
        assert_eq!(tokens, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_fold() {
        assert_eq!(fold("Hello 世界"), "hello 世界");
    }
}
