//! 中英文混合分词与文本归一化
//!
//! 含 CJK 字符的文本交给 jieba-rs 搜索引擎模式，其余按非字母数字切分并去掉英文停用词。
//! normalize_text 供精确问句匹配与候选去重使用。

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use jieba_rs::Jieba;

static JIEBA: OnceLock<Jieba> = OnceLock::new();

/// 只保留对检索无区分度的高频词
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "in", "is", "it", "of", "on", "or", "the",
    "to", "was", "with",
];

const CJK_RANGES: &[(char, char)] = &[
    ('\u{4E00}', '\u{9FFF}'),
    ('\u{3400}', '\u{4DBF}'),
    ('\u{F900}', '\u{FAFF}'),
    ('\u{3040}', '\u{309F}'),
    ('\u{30A0}', '\u{30FF}'),
];

fn is_cjk(c: char) -> bool {
    CJK_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&c))
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// 英文词至少两个字符；CJK 词保留单字
fn keep_token(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if is_cjk(first) => true,
        Some(first) => first.is_alphanumeric() && chars.next().is_some() && !is_stopword(token),
        None => false,
    }
}

/// 分词结果保持原顺序，可含重复词
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let raw: Vec<String> = if contains_cjk(text) {
        JIEBA
            .get_or_init(Jieba::new)
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .collect()
    } else {
        text.split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .collect()
    };
    raw.into_iter().filter(|t| keep_token(t)).collect()
}

pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 词频表与总词数（BM25 建索引用）
pub fn term_counts(text: &str) -> (HashMap<String, usize>, usize) {
    let tokens = tokenize(text);
    let total = tokens.len();
    let mut counts = HashMap::new();
    for t in tokens {
        *counts.entry(t).or_insert(0) += 1;
    }
    (counts, total)
}

/// 合并空白、转小写、去掉句末标点
pub fn normalize_text(text: &str) -> String {
    let lowered = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    lowered
        .trim_end_matches(['?', '!', '.', '。', '？', '！', '，', ',', ';', '；'])
        .trim()
        .to_string()
}
