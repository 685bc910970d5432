//! Shared REST plumbing for adapters.
//!
//! Status codes are mapped onto the collector error taxonomy here so
//! adapters only deal with exchange-specific error payloads.

use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;

use crate::error::{CollectorError, CollectorResult, classify_status};

/// Builds the HTTP client shared by every adapter of one instance.
pub fn build_client(timeout: Duration) -> CollectorResult<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("funding-collector/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CollectorError::Config(format!("http client: {e}")))
}

/// GET `url` with query parameters and decode the JSON body.
pub async fn get_json(client: &Client, url: &str, params: &[(&str, String)]) -> CollectorResult<Value> {
    let url = Url::parse_with_params(url, params)
        .map_err(|e| CollectorError::protocol(format!("bad url {url}: {e}")))?;

    let resp = client.get(url).send().await?;
    decode(resp).await
}

/// POST a JSON body to `url` and decode the JSON response.
pub async fn post_json(client: &Client, url: &str, body: &Value) -> CollectorResult<Value> {
    let resp = client.post(url).json(body).send().await?;
    decode(resp).await
}

async fn decode(resp: reqwest::Response) -> CollectorResult<Value> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        return Err(classify_status(status.as_u16(), truncate(&text)));
    }

    Ok(serde_json::from_str(&text)?)
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(256) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
