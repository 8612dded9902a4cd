//! 检索联邦：把查询并发分发到所有检索源，合并为一个候选集
//!
//! 每个检索源一个任务（JoinSet + Semaphore 限制并发），全部结束后才返回；
//! 单个源失败或超时只记录日志并丢弃该源结果。这里不做重排与截断。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::RetrievalSection;
use crate::core::RetrievalError;
use crate::retrieval::{Candidate, CandidateSource};

/// 联邦检索参数
#[derive(Debug, Clone)]
pub struct FederatorConfig {
    pub top_k_per_source: usize,
    pub source_timeout: Duration,
    pub max_concurrency: usize,
}

impl FederatorConfig {
    pub fn from_section(section: &RetrievalSection) -> Self {
        Self {
            top_k_per_source: section.per_source_top_k,
            source_timeout: Duration::from_secs(section.source_timeout_secs),
            max_concurrency: section.max_concurrency,
        }
    }
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self::from_section(&RetrievalSection::default())
    }
}

/// 持有一组检索源的联邦检索器
pub struct Federator {
    sources: Vec<Arc<dyn CandidateSource>>,
    config: FederatorConfig,
}

impl Federator {
    pub fn new(sources: Vec<Arc<dyn CandidateSource>>, config: FederatorConfig) -> Self {
        Self { sources, config }
    }

    pub fn sources(&self) -> &[Arc<dyn CandidateSource>] {
        &self.sources
    }

    pub fn config(&self) -> &FederatorConfig {
        &self.config
    }

    pub async fn federate(&self, query: &str) -> Vec<Candidate> {
        federate(query, &self.sources, &self.config).await
    }
}

/// 并发查询所有检索源并合并结果
pub async fn federate(
    query: &str,
    sources: &[Arc<dyn CandidateSource>],
    config: &FederatorConfig,
) -> Vec<Candidate> {
    if sources.is_empty() {
        return Vec::new();
    }

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let query: Arc<str> = Arc::from(query);
    let mut tasks = JoinSet::new();

    for (idx, source) in sources.iter().cloned().enumerate() {
        let semaphore = semaphore.clone();
        let query = query.clone();
        let top_k = config.top_k_per_source;
        let limit = config.source_timeout;
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let start = Instant::now();
            let result = match timeout(limit, source.fetch(&query, top_k)).await {
                Ok(r) => r,
                Err(_) => Err(RetrievalError::Timeout(limit.as_secs())),
            };
            (idx, source.name().to_string(), start.elapsed(), result)
        });
    }

    let mut per_source: Vec<(usize, String, Vec<Candidate>)> = Vec::with_capacity(sources.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, name, elapsed, Ok(candidates))) => {
                tracing::debug!(
                    source = %name,
                    hits = candidates.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "candidate source done"
                );
                per_source.push((idx, name, candidates));
            }
            Ok((_, name, elapsed, Err(e))) => {
                tracing::warn!(
                    source = %name,
                    error = %e,
                    duration_ms = elapsed.as_millis() as u64,
                    "candidate source failed, dropping its contribution"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "candidate source task aborted");
            }
        }
    }

    // 合并顺序固定为配置顺序，便于复现
    per_source.sort_by_key(|(idx, _, _)| *idx);
    merge_candidates(per_source.into_iter().map(|(_, name, c)| (name, c)))
}

/// 拼接各源结果：按 (归一化文本, 来源字段) 尽力去重，保留先出现者；id 冲突时追加源名
fn merge_candidates(groups: impl IntoIterator<Item = (String, Vec<Candidate>)>) -> Vec<Candidate> {
    let mut seen_keys = HashSet::new();
    let mut seen_ids = HashSet::new();
    let mut merged = Vec::new();

    for (source_name, candidates) in groups {
        for mut candidate in candidates {
            if !seen_keys.insert(candidate.dedup_key()) {
                continue;
            }
            if seen_ids.contains(&candidate.id) {
                let base = format!("{}@{}", candidate.id, source_name);
                let mut id = base.clone();
                let mut n = 1;
                while seen_ids.contains(&id) {
                    id = format!("{}#{}", base, n);
                    n += 1;
                }
                candidate.id = id;
            }
            seen_ids.insert(candidate.id.clone());
            merged.push(candidate);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::SearchBy;
    use async_trait::async_trait;

    struct FixedSource {
        name: String,
        hits: Vec<Candidate>,
    }

    #[async_trait]
    impl CandidateSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self, _query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
            Ok(self.hits.iter().take(top_k).cloned().collect())
        }
    }

    struct SlowSource;

    #[async_trait]
    impl CandidateSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _query: &str, _top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![Candidate::new("late", "late", 1.0, SearchBy::Vector)])
        }
    }

    fn fixed(name: &str, texts: &[&str], by: SearchBy) -> Arc<dyn CandidateSource> {
        Arc::new(FixedSource {
            name: name.to_string(),
            hits: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Candidate::new(format!("{}", i), *t, 1.0 - i as f32 * 0.1, by))
                .collect(),
        })
    }

    #[tokio::test]
    async fn test_duplicate_text_from_two_sources_kept_once() {
        let sources = vec![
            fixed("vec", &["Rust is fast", "Tokio is async"], SearchBy::Vector),
            fixed("bm25", &["rust is   FAST", "Serde serializes"], SearchBy::Bm25),
        ];
        let merged = federate("rust", &sources, &FederatorConfig::default()).await;
        let texts: Vec<&str> = merged.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["Rust is fast", "Tokio is async", "Serde serializes"]);
    }

    #[tokio::test]
    async fn test_colliding_ids_are_made_unique() {
        let sources = vec![
            fixed("vec", &["alpha"], SearchBy::Vector),
            fixed("bm25", &["beta"], SearchBy::Bm25),
        ];
        let merged = federate("q", &sources, &FederatorConfig::default()).await;
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "0");
        assert_eq!(merged[1].id, "0@bm25");
    }

    #[tokio::test]
    async fn test_timed_out_source_is_dropped() {
        let config = FederatorConfig {
            source_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let sources = vec![fixed("vec", &["kept"], SearchBy::Vector), Arc::new(SlowSource) as Arc<dyn CandidateSource>];
        let merged = federate("q", &sources, &config).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "kept");
    }

    #[tokio::test]
    async fn test_top_k_per_source_is_forwarded() {
        let config = FederatorConfig {
            top_k_per_source: 1,
            ..Default::default()
        };
        let sources = vec![fixed("vec", &["a", "b", "c"], SearchBy::Vector)];
        assert_eq!(federate("q", &sources, &config).await.len(), 1);
    }

    #[tokio::test]
    async fn test_no_sources_is_empty() {
        assert!(federate("q", &[], &FederatorConfig::default()).await.is_empty());
    }
}
