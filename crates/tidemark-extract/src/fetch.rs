//! The fetch collaborator: one upstream call per entity.

use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidemark_core::outcome::FetchOutcome;

use crate::Result;

/// What a single fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
  pub payload: Value,
  pub outcome: FetchOutcome,
  /// Upstream or transport message for non-success outcomes.
  pub message: Option<String>,
}

impl FetchResponse {
  pub fn success(payload: Value) -> Self {
    Self { payload, outcome: FetchOutcome::Success, message: None }
  }

  pub fn failed(outcome: FetchOutcome, message: impl Into<String>) -> Self {
    Self { payload: Value::Null, outcome, message: Some(message.into()) }
  }
}

/// Fetches the payload for one identifier.
///
/// Never fails: transport and upstream errors are reported through
/// [`FetchResponse::outcome`] so that one bad entity cannot abort a run.
pub trait Fetcher: Send + Sync {
  fn fetch<'a>(&'a self, identifier: &'a str) -> impl Future<Output = FetchResponse> + Send + 'a;
}

/// Classify a parsed upstream body.
///
/// The upstream API signals errors in-band: `"Error Message"` for bad
/// requests, `"Note"` or `"Information"` when the quota is exhausted.
pub fn classify_payload(payload: Value) -> FetchResponse {
  let message = |key: &str| payload.get(key).map(|m| m.as_str().map_or_else(|| m.to_string(), str::to_owned));

  if let Some(m) = message("Error Message") {
    return FetchResponse { message: Some(m), outcome: FetchOutcome::ApiFailure, payload };
  }
  if let Some(m) = message("Note").or_else(|| message("Information")) {
    return FetchResponse { message: Some(m), outcome: FetchOutcome::RateLimited, payload };
  }

  let empty = match &payload {
    Value::Null => true,
    Value::Object(map) => map.is_empty(),
    Value::Array(items) => items.is_empty(),
    _ => false,
  };
  if empty {
    return FetchResponse { message: None, outcome: FetchOutcome::Empty, payload };
  }

  FetchResponse::success(payload)
}

/// Map a non-success HTTP status to a failed response. `None` means the body
/// should be read and classified.
pub fn classify_status(status: StatusCode) -> Option<FetchResponse> {
  if status == StatusCode::TOO_MANY_REQUESTS {
    return Some(FetchResponse::failed(FetchOutcome::RateLimited, format!("HTTP {status}")));
  }
  if !status.is_success() {
    return Some(FetchResponse::failed(FetchOutcome::ApiFailure, format!("HTTP {status}")));
  }
  None
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
  pub base_url:     String,
  pub api_key:      String,
  pub timeout_secs: u64,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      base_url:     "https://www.alphavantage.co/query".into(),
      api_key:      String::new(),
      timeout_secs: 30,
    }
  }
}

/// [`Fetcher`] calling a JSON query endpoint with
/// `?function=<function>&symbol=<identifier>&apikey=<key>`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
  client:   reqwest::Client,
  config:   FetchConfig,
  function: String,
}

impl HttpFetcher {
  pub fn new(config: FetchConfig, function: impl Into<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()?;
    Ok(Self { client, config, function: function.into() })
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, identifier: &str) -> FetchResponse {
    let response = self
      .client
      .get(&self.config.base_url)
      .query(&[
        ("function", self.function.as_str()),
        ("symbol", identifier),
        ("apikey", self.config.api_key.as_str()),
      ])
      .send()
      .await;

    let response = match response {
      Ok(r) => r,
      Err(e) => return FetchResponse::failed(FetchOutcome::ApiFailure, e.to_string()),
    };

    if let Some(failed) = classify_status(response.status()) {
      return failed;
    }

    match response.json::<Value>().await {
      Ok(body) => classify_payload(body),
      Err(e) => FetchResponse::failed(FetchOutcome::ApiFailure, format!("invalid JSON body: {e}")),
    }
  }
}
