//! JSON HTTP 전송 계층 - 인증, 재시도(지수 백오프), Rate Limit
//!
//! 임베딩, 생성, 그리고 모든 관리형 백엔드(Kendra/Bedrock/Vertex/OpenAI)가
//! 같은 재시도 정책을 사용합니다. 일시적 오류(네트워크, 429, 5xx)만 재시도하고
//! 나머지 4xx는 즉시 실패합니다.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

/// 429/5xx 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 2000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid endpoint '{url}': {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("request failed: {0}")]
    Network(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

// ============================================================================
// Config Types
// ============================================================================

/// 요청 인증 방식
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Bearer(String),
    Header { name: &'static str, value: String },
}

/// 재시도 정책
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// attempt번째(0부터) 재시도 전 대기 시간
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// 슬라이딩 윈도우 + 최소 간격 Rate Limiter
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay,
            last_request: None,
        }
    }

    /// 요청 가능할 때까지 대기
    async fn acquire(&mut self) {
        // 1. 최소 딜레이 (버스트 방지)
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        // 2. 윈도우 밖의 오래된 요청 제거
        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        // 3. 초과 시 가장 오래된 요청이 윈도우를 벗어날 때까지 대기
        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

// ============================================================================
// JsonTransport
// ============================================================================

/// JSON 요청/응답 전송기
#[derive(Debug, Clone)]
pub struct JsonTransport {
    client: reqwest::Client,
    base_url: Url,
    auth: Auth,
    headers: Vec<(&'static str, String)>,
    retry: RetryPolicy,
    rate_limiter: Option<Arc<Mutex<RateLimiter>>>,
}

impl JsonTransport {
    /// 새 전송기 생성
    ///
    /// `base_url`은 상대 경로 결합을 위해 항상 `/`로 끝나도록 정규화됩니다.
    pub fn new(base_url: &str, auth: Auth, timeout: Duration) -> Result<Self, HttpError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };

        let base_url = Url::parse(&normalized).map_err(|e| HttpError::InvalidEndpoint {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(HttpError::InvalidEndpoint {
                url: base_url.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("ragbench/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            auth,
            headers: Vec::new(),
            retry: RetryPolicy::default(),
            rate_limiter: None,
        })
    }

    /// 모든 요청에 붙는 고정 헤더
    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Rate limit 설정 (예: Gemini 무료 티어 60 RPM)
    pub fn with_rate_limit(mut self, max_requests: u32, window: Duration, min_delay: Duration) -> Self {
        self.rate_limiter = Some(Arc::new(Mutex::new(RateLimiter::new(
            max_requests,
            window,
            min_delay,
        ))));
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// base_url 기준 상대 경로 결합
    pub fn endpoint(&self, path: &str) -> Result<Url, HttpError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| HttpError::InvalidEndpoint {
                url: format!("{}{}", self.base_url, path),
                reason: e.to_string(),
            })
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body).map_err(|e| HttpError::Decode(e.to_string()))?;
        let text = self.send(Method::POST, path, Some(&body)).await?;
        serde_json::from_str(&text).map_err(|e| HttpError::Decode(e.to_string()))
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, HttpError> {
        let text = self.send(Method::GET, path, None).await?;
        serde_json::from_str(&text).map_err(|e| HttpError::Decode(e.to_string()))
    }

    /// 재시도 루프 (일시적 오류 시 지수 백오프)
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, HttpError> {
        let url = self.endpoint(path)?;
        let mut last_error = String::new();

        for attempt in 0..=self.retry.max_retries {
            if let Some(limiter) = &self.rate_limiter {
                limiter.lock().await.acquire().await;
            }

            let mut request = self.client.request(method.clone(), url.clone());
            request = match &self.auth {
                Auth::None => request,
                Auth::Bearer(token) => request.bearer_auth(token),
                // API 키는 URL이 아닌 헤더로 전송
                Auth::Header { name, value } => request.header(*name, value),
            };
            for (name, value) in &self.headers {
                request = request.header(*name, value);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let transient = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(text) if status.is_success() => return Ok(text),
                        Ok(text) => {
                            let error = HttpError::Status {
                                status: status.as_u16(),
                                message: error_message(&text),
                            };
                            if !is_transient_status(status.as_u16()) {
                                return Err(error);
                            }
                            error.to_string()
                        }
                        // 본문 수신 중 연결이 끊긴 경우도 네트워크 오류로 재시도
                        Err(e) => format!("failed to read body: {}", e),
                    }
                }
                Err(e) => format!("request failed: {}", e),
            };

            last_error = transient;
            if attempt < self.retry.max_retries {
                let backoff = self.retry.backoff(attempt);
                tracing::warn!(
                    "{} {} failed ({}), retrying in {:?} (attempt {}/{})",
                    method,
                    url.path(),
                    last_error,
                    backoff,
                    attempt + 1,
                    self.retry.max_retries
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(HttpError::RetriesExhausted {
            attempts: self.retry.max_retries + 1,
            last: last_error,
        })
    }
}

// ============================================================================
// JsonEndpoint Trait
// ============================================================================

/// 관리형 백엔드 호출 경계
///
/// 어댑터는 구체 전송기 대신 이 트레이트에 의존하므로
/// 테스트에서는 요청을 기록하고 고정 응답을 돌려주는 가짜로 대체합니다.
#[async_trait]
pub trait JsonEndpoint: Send + Sync {
    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, HttpError>;

    async fn get(&self, path: &str) -> Result<serde_json::Value, HttpError>;
}

#[async_trait]
impl JsonEndpoint for JsonTransport {
    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, HttpError> {
        self.post_json(path, body).await
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, HttpError> {
        self.get_json(path).await
    }
}

/// 재시도 대상 상태 코드 (429, 5xx)
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// 에러 응답 본문에서 메시지 추출
///
/// Google/OpenAI: `{"error": {"message": ...}}`, AWS: `{"message": ...}`
fn error_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .or_else(|| v.get("Message"))
                .and_then(|m| m.as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(500).collect())
}

// ============================================================================
// Tests
// ============================================================================
