//! 内容指纹
//!
//! 32 位滚动哈希（`h = h * 31 + unit`，按 UTF-16 码元计算），输出 8 位小写十六进制。
//! 只用于两件事：判断内容是否变化（省掉无意义的同步）、传输后的完整性回显。
//!
//! # 已知限制
//!
//! 32 位空间存在碰撞：两段不同内容可能得到相同哈希，此时"内容未变"的判断会掩盖真实差异。
//! 因此哈希相等从不作为丢弃本地编辑的依据，版本号才是权威。它也不是安全原语。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 标题/正文/摘要之间的分隔符（单元分隔符，正常文本中不会出现）
const FIELD_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// 校验外部传入的哈希格式（8 位小写十六进制）
    pub fn is_well_formed(s: &str) -> bool {
        s.len() == 8 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

pub struct ContentHasher;

impl ContentHasher {
    /// 对单段文本求哈希（先规范化）
    pub fn hash_str(text: &str) -> ContentHash {
        let normalized = Self::normalize(text);
        ContentHash(format!("{:08x}", Self::rolling_hash(&normalized)))
    }

    /// 文章指纹：标题、正文、摘要以分隔符拼接后求哈希
    pub fn hash_article(title: &str, content: &str, summary: &str) -> ContentHash {
        let mut joined = String::with_capacity(title.len() + content.len() + summary.len() + 2);
        joined.push_str(&Self::normalize(title));
        joined.push(FIELD_SEPARATOR);
        joined.push_str(&Self::normalize(content));
        joined.push(FIELD_SEPARATOR);
        joined.push_str(&Self::normalize(summary));
        ContentHash(format!("{:08x}", Self::rolling_hash(&joined)))
    }

    /// 换行统一为 LF，去掉末尾空白
    pub fn normalize(text: &str) -> String {
        let unified = if text.contains('\r') {
            text.replace("\r\n", "\n").replace('\r', "\n")
        } else {
            text.to_string()
        };
        unified.trim_end().to_string()
    }

    fn rolling_hash(text: &str) -> u32 {
        text.encode_utf16()
            .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
    }
}
