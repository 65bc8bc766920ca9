use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualVerdict {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default, with = "crate::money::option")]
    pub accrual: Option<BigDecimal>,
}

/// What the accrual service answered, before any retry decision.
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualReply {
    Verdict(AccrualVerdict),
    /// 204, the order is not known yet
    NotReady,
    /// 429
    RateLimited { retry_after: Option<Duration> },
    /// any 5xx
    ServerError(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    #[error("accrual service unreachable: {0}")]
    Transport(String),

    #[error("unexpected accrual service status {0}")]
    UnexpectedStatus(u16),

    #[error("undecodable accrual service response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait AccrualClient: Send + Sync {
    async fn fetch(&self, number: &str) -> Result<AccrualReply, AccrualError>;
}

/// Talks to the accrual service over HTTP. Retrying is not its business,
/// see `RetryPolicy`.
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn fetch(&self, number: &str) -> Result<AccrualReply, AccrualError> {
        let url = format!("{}/api/orders/{}", self.base_url, number);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AccrualError::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| AccrualError::Transport(e.to_string()))?;
                Ok(AccrualReply::Verdict(serde_json::from_slice(&body)?))
            }
            StatusCode::NO_CONTENT => Ok(AccrualReply::NotReady),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Ok(AccrualReply::RateLimited { retry_after })
            }
            s if s.is_server_error() => Ok(AccrualReply::ServerError(s.as_u16())),
            s => Err(AccrualError::UnexpectedStatus(s.as_u16())),
        }
    }
}
