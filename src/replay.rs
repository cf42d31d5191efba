//! Request replay
//!
//! Executes a hub-issued `replayRequest` through a clean, uninstrumented
//! HTTP client. The response is deliberately discarded; only the status
//! line is logged for operator feedback.

use crate::bridge::ReplaySpec;
use anyhow::Context;
use reqwest::header::{HeaderName, HeaderValue};

/// Hop-by-hop headers the client must regenerate itself.
const STRIPPED_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];

pub async fn execute(spec: ReplaySpec) -> anyhow::Result<()> {
    let method: reqwest::Method = spec
        .method
        .parse()
        .with_context(|| format!("unsupported replay method {}", spec.method))?;

    // A plain client: no proxy, no interception, so the replay itself is
    // never captured or mocked.
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .context("building replay client")?;

    let mut request = client.request(method, &spec.url);
    for (key, value) in &spec.headers {
        if STRIPPED_HEADERS.iter().any(|h| key.eq_ignore_ascii_case(h)) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key.as_str()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!(header = %key, "skipping unrepresentable replay header");
            continue;
        };
        request = request.header(name, value);
    }
    if let Some(body) = spec.body {
        request = request.body(body);
    }

    let response = request
        .send()
        .await
        .with_context(|| format!("replaying {}", spec.url))?;
    tracing::debug!(
        id = %spec.id,
        status = response.status().as_u16(),
        "replay completed; response discarded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn bad_method_is_rejected() {
        let spec = ReplaySpec {
            id: "r".to_string(),
            method: "NOT A METHOD".to_string(),
            url: "https://example.com/".to_string(),
            headers: HashMap::new(),
            body: None,
        };
        assert!(execute(spec).await.is_err());
    }
}
