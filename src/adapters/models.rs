//! 모델 ID 해석 - 짧은 이름("4-5", "2.5-flash") → 백엔드 전체 ID
//!
//! 어댑터 생성 시 한 번만 수행하고 결과는 어댑터 수명 동안 유지합니다.
//! 일치하는 모델이 없으면 기본값으로 대체하지 않고 에러를 반환합니다.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::http::JsonEndpoint;

use super::AdapterError;

// ============================================================================
// ModelCatalog Trait
// ============================================================================

/// 백엔드 모델 목록
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// 백엔드 이름 (에러 메시지용)
    fn backend(&self) -> &str;

    async fn list_models(&self) -> anyhow::Result<Vec<String>>;
}

/// 목록 응답에서 모델 ID를 뽑는 함수
pub type ModelIdExtractor = fn(&Value) -> Vec<String>;

/// JSON 목록 API 기반 카탈로그
pub struct EndpointCatalog {
    endpoint: Arc<dyn JsonEndpoint>,
    backend: &'static str,
    path: String,
    extract: ModelIdExtractor,
}

impl EndpointCatalog {
    pub fn new(
        endpoint: Arc<dyn JsonEndpoint>,
        backend: &'static str,
        path: impl Into<String>,
        extract: ModelIdExtractor,
    ) -> Self {
        Self {
            endpoint,
            backend,
            path: path.into(),
            extract,
        }
    }
}

#[async_trait]
impl ModelCatalog for EndpointCatalog {
    fn backend(&self) -> &str {
        self.backend
    }

    async fn list_models(&self) -> anyhow::Result<Vec<String>> {
        let response = self.endpoint.get(&self.path).await?;
        Ok((self.extract)(&response))
    }
}

/// `{"<array>": [{"<field>": "..."}]}` 형태의 목록에서 ID 추출
///
/// `models/gemini-2.5-flash`처럼 경로형 이름은 마지막 `separator` 뒤만 사용합니다.
pub fn ids_from_array(response: &Value, array: &str, field: &str, separator: &str) -> Vec<String> {
    response
        .get(array)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .map(|id| id.rsplit(separator).next().unwrap_or(id).to_string())
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Resolution
// ============================================================================

/// 카탈로그를 조회해서 짧은 ID 해석
pub async fn resolve_from_catalog(
    catalog: &dyn ModelCatalog,
    requested: &str,
) -> Result<String, AdapterError> {
    let available = catalog
        .list_models()
        .await
        .map_err(|e| AdapterError::Catalog {
            backend: catalog.backend().to_string(),
            message: format!("{:#}", e),
        })?;

    let resolved = resolve_model_id(requested, &available).ok_or_else(|| {
        AdapterError::ModelNotFound {
            backend: catalog.backend().to_string(),
            requested: requested.to_string(),
        }
    })?;

    tracing::info!(
        "Resolved {} model '{}' -> '{}'",
        catalog.backend(),
        requested,
        resolved
    );
    Ok(resolved)
}

/// 짧은 ID를 목록에서 찾기
///
/// 1. 완전 일치가 있으면 그대로 사용
/// 2. 짧은 ID가 버전 토큰으로 포함된 항목 (`4-5`는 `4.5`와도 일치, `4-50`과는 불일치)
/// 3. `-lite`, `-preview` 같은 변형 접미사가 없는 항목 우선
/// 4. 그중 사전순으로 가장 큰 항목 (최신 날짜 리비전)
pub fn resolve_model_id(requested: &str, available: &[String]) -> Option<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return None;
    }

    if let Some(exact) = available.iter().find(|id| id.as_str() == requested) {
        return Some(exact.clone());
    }

    let pattern = token_pattern(requested)?;
    let variant = Regex::new("[A-Za-z]{2,}").ok()?;

    let mut plain = Vec::new();
    let mut qualified = Vec::new();
    for id in available {
        if let Some(caps) = pattern.captures(id) {
            let suffix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            if variant.is_match(suffix) {
                qualified.push(id);
            } else {
                plain.push(id);
            }
        }
    }

    let pool = if plain.is_empty() { qualified } else { plain };
    pool.into_iter().max().cloned()
}

/// `2.5-flash` → `(?i)(?:^|[^0-9a-z])2[.-]5[.-]flash(?:$|([^0-9a-z].*)$)`
fn token_pattern(requested: &str) -> Option<Regex> {
    let token = requested
        .split(|c: char| c == '.' || c == '-')
        .filter(|part| !part.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[.-]");

    if token.is_empty() {
        return None;
    }

    Regex::new(&format!(
        r"(?i)(?:^|[^0-9a-z]){}(?:$|([^0-9a-z].*)$)",
        token
    ))
    .ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match_wins() {
        let available = ids(&["gpt-4.1", "gpt-4.1-2025-04-14"]);
        assert_eq!(resolve_model_id("gpt-4.1", &available).unwrap(), "gpt-4.1");
    }

    #[test]
    fn test_dash_matches_dot_but_not_longer_number() {
        let available = ids(&["claude-sonnet-4-50", "claude-opus-4.5"]);
        assert_eq!(resolve_model_id("4-5", &available).unwrap(), "claude-opus-4.5");

        let only_longer = ids(&["claude-sonnet-4-50"]);
        assert!(resolve_model_id("4-5", &only_longer).is_none());
    }

    #[test]
    fn test_latest_revision_chosen() {
        let available = ids(&[
            "anthropic.claude-sonnet-4-5-20250101-v1:0",
            "anthropic.claude-sonnet-4-5-20250929-v1:0",
            "anthropic.claude-3-haiku-20240307-v1:0",
        ]);
        assert_eq!(
            resolve_model_id("4-5", &available).unwrap(),
            "anthropic.claude-sonnet-4-5-20250929-v1:0"
        );
    }

    #[test]
    fn test_plain_preferred_over_variant() {
        let available = ids(&[
            "gemini-2.5-flash",
            "gemini-2.5-flash-lite",
            "gemini-2.5-flash-preview-05-20",
            "gemini-2.5-pro",
        ]);
        assert_eq!(
            resolve_model_id("2.5-flash", &available).unwrap(),
            "gemini-2.5-flash"
        );

        let variants_only = ids(&["gemini-2.5-flash-lite"]);
        assert_eq!(
            resolve_model_id("2.5-flash", &variants_only).unwrap(),
            "gemini-2.5-flash-lite"
        );
    }

    #[test]
    fn test_no_match() {
        let available = ids(&["gpt-4o", "gpt-4.1"]);
        assert!(resolve_model_id("5", &available).is_none());
        assert!(resolve_model_id("", &available).is_none());
    }

    #[test]
    fn test_ids_from_array_takes_last_segment() {
        let response = serde_json::json!({
            "models": [
                {"name": "models/gemini-2.5-flash"},
                {"name": "models/gemini-2.5-pro"},
                {"displayName": "no name"}
            ]
        });
        assert_eq!(
            ids_from_array(&response, "models", "name", "/"),
            vec!["gemini-2.5-flash", "gemini-2.5-pro"]
        );
    }

    struct StaticCatalog(Vec<String>);

    #[async_trait]
    impl ModelCatalog for StaticCatalog {
        fn backend(&self) -> &str {
            "static"
        }

        async fn list_models(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_resolve_from_catalog_not_found_is_error() {
        let catalog = StaticCatalog(ids(&["gpt-4o"]));
        let err = resolve_from_catalog(&catalog, "4-5").await.unwrap_err();
        assert!(matches!(err, AdapterError::ModelNotFound { .. }));

        let ok = resolve_from_catalog(&catalog, "4o").await.unwrap();
        assert_eq!(ok, "gpt-4o");
    }
}
