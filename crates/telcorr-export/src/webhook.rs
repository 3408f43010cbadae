//! Webhook sink
//!
//! Posts each window's summaries as one JSON array to an HTTP endpoint.
//! Retries, breaking and dead-lettering are handled by the exporter manager,
//! so a call here is a single request.

use crate::sink::{SinkError, SinkResult, SummarySink};
use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use telcorr_core::config::WebhookExportConfig;
use telcorr_core::CorrelationSummary;
use tracing::{debug, info};

/// HTTP method for webhook requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl WebhookMethod {
    fn as_reqwest(self) -> Method {
        match self {
            WebhookMethod::Post => Method::POST,
            WebhookMethod::Put => Method::PUT,
            WebhookMethod::Patch => Method::PATCH,
        }
    }

    fn parse(method: &str) -> Self {
        match method.to_uppercase().as_str() {
            "PUT" => WebhookMethod::Put,
            "PATCH" => WebhookMethod::Patch,
            _ => WebhookMethod::Post,
        }
    }
}

/// Authentication method for webhook
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WebhookAuth {
    #[default]
    None,
    /// API key in header
    ApiKey { header: String, value: String },
    Bearer(String),
}

/// Webhook sink configuration
#[derive(Debug, Clone)]
pub struct WebhookSinkConfig {
    pub endpoint: String,
    pub method: WebhookMethod,
    pub auth: WebhookAuth,

    /// Static headers to include in all requests
    pub headers: HashMap<String, String>,

    /// Client-side request timeout
    pub timeout: Duration,

    /// Accept gzip-compressed responses
    pub compression: bool,

    pub user_agent: String,
}

impl WebhookSinkConfig {
    pub fn from_export_config(config: &WebhookExportConfig, timeout: Duration) -> Self {
        let auth = if let Some(api_key) = &config.api_key {
            WebhookAuth::ApiKey {
                header: config.api_key_header.clone(),
                value: api_key.clone(),
            }
        } else if let Some(token) = &config.bearer_token {
            WebhookAuth::Bearer(token.clone())
        } else {
            WebhookAuth::None
        };

        Self {
            endpoint: config.url.clone(),
            method: WebhookMethod::parse(&config.method),
            auth,
            headers: config.headers.clone(),
            timeout,
            compression: config.compression,
            ..Default::default()
        }
    }
}

impl Default for WebhookSinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/summaries".to_string(),
            method: WebhookMethod::Post,
            auth: WebhookAuth::None,
            headers: HashMap::new(),
            timeout: Duration::from_secs(5),
            compression: true,
            user_agent: format!("telcorr/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Sends summaries to an HTTP endpoint
pub struct WebhookSink {
    config: WebhookSinkConfig,
    client: Client,
    summaries_exported: AtomicU64,
}

impl WebhookSink {
    pub fn new(config: WebhookSinkConfig) -> SinkResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .gzip(config.compression)
            .build()
            .map_err(|e| SinkError::Permanent(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            "Webhook sink initialized: endpoint={}, method={:?}",
            config.endpoint, config.method
        );

        Ok(Self {
            config,
            client,
            summaries_exported: AtomicU64::new(0),
        })
    }

    pub fn summaries_exported(&self) -> u64 {
        self.summaries_exported.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SummarySink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn export_summaries(&self, summaries: &[CorrelationSummary]) -> SinkResult<()> {
        let payload = serde_json::to_string(summaries)?;

        let mut request = self
            .client
            .request(self.config.method.as_reqwest(), &self.config.endpoint)
            .header("Content-Type", "application/json");

        request = match &self.config.auth {
            WebhookAuth::None => request,
            WebhookAuth::ApiKey { header, value } => {
                request.header(header.as_str(), value.as_str())
            }
            WebhookAuth::Bearer(token) => request.bearer_auth(token),
        };

        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.body(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Http {
                status: status.as_u16(),
                body,
            });
        }

        self.summaries_exported
            .fetch_add(summaries.len() as u64, Ordering::Relaxed);
        debug!("Exported {} summaries to webhook", summaries.len());
        Ok(())
    }
}
