//! LLM provider clients.
//!
//! The router only sees the [`ProviderClient`] trait. The HTTP
//! implementation speaks a uniform completion protocol to every configured
//! base URL; provider error bodies never propagate verbatim, they are
//! scrubbed and collapsed to a status class before anyone can log them.

use {
    crate::domain::health::FailureKind,
    model::{CompletionRequest, CompletionResult, ResolvedModel},
    serde::Serialize,
    std::{collections::BTreeMap, time::Duration},
    url::Url,
};

const RESPONSE_SIZE_LIMIT: usize = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected the request with status {status}")]
    Client { status: u16 },
    #[error("provider failed with status {status}")]
    Server { status: u16 },
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("provider {0} is not configured")]
    UnknownProvider(String),
    #[error("provider response could not be decoded")]
    Malformed,
}

impl ProviderError {
    /// How this error counts against circuit health.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Server { .. } => FailureKind::Server,
            Self::Network(_) | Self::Malformed => FailureKind::Network,
            Self::Client { .. } | Self::UnknownProvider(_) => FailureKind::Client,
        }
    }
}

#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    async fn invoke(
        &self,
        model: &ResolvedModel,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, ProviderError>;
}

/// Wire form of the uniform completion call.
#[derive(Debug, Serialize)]
struct CompleteBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a CompletionRequest,
}

pub struct HttpProviderClient {
    client: reqwest::Client,
    base_urls: BTreeMap<String, Url>,
}

impl HttpProviderClient {
    pub fn new(base_urls: BTreeMap<String, Url>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_urls,
        })
    }
}

#[async_trait::async_trait]
impl ProviderClient for HttpProviderClient {
    async fn invoke(
        &self,
        model: &ResolvedModel,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, ProviderError> {
        let base = self
            .base_urls
            .get(&model.provider)
            .ok_or_else(|| ProviderError::UnknownProvider(model.provider.clone()))?;
        let url = base
            .join("v1/complete")
            .map_err(|_| ProviderError::UnknownProvider(model.provider.clone()))?;

        let body = CompleteBody {
            model: &model.model_id,
            request,
        };
        let mut response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Network(observe::scrub::scrub(&err.to_string())))?;

        let status = response.status().as_u16();
        if (400..500).contains(&status) {
            return Err(ProviderError::Client { status });
        }
        if status >= 500 {
            return Err(ProviderError::Server { status });
        }

        let bytes = read_limited(&mut response, RESPONSE_SIZE_LIMIT)
            .await
            .map_err(|err| ProviderError::Network(observe::scrub::scrub(&err.to_string())))?;
        serde_json::from_slice(&bytes).map_err(|err| {
            tracing::warn!(
                provider = %model.provider,
                err = %observe::scrub::scrub(&err.to_string()),
                "undecodable provider response"
            );
            ProviderError::Malformed
        })
    }
}

/// Reads the body up to `limit` bytes, erroring beyond it.
async fn read_limited(response: &mut reqwest::Response, limit: usize) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() + chunk.len() > limit {
            anyhow::bail!("response size limit exceeded");
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
