//! Shared HTTP plumbing for the REST chain providers.

use crate::domain::ProviderError;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

const MAX_BODY_CHARS: usize = 256;

/// Rejection messages that mean the node already has the transaction.
const ALREADY_KNOWN_MARKERS: &[&str] = &[
    "already in block chain",
    "txn-already-in-mempool",
    "txn-already-known",
    "already known",
    "already exists",
];

/// Build a client with a request timeout and a shorter connect timeout.
pub fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(5)))
        .build()
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

/// Map a non-success broadcast response to `AlreadyKnown` or `Rejected`.
pub fn classify_rejection(status: u16, body: &str) -> ProviderError {
    let lower = body.to_ascii_lowercase();
    if ALREADY_KNOWN_MARKERS.iter().any(|m| lower.contains(m)) {
        return ProviderError::AlreadyKnown;
    }
    if status == 400 {
        return ProviderError::Rejected(truncate(body));
    }
    ProviderError::Http {
        status,
        body: truncate(body),
    }
}

pub(crate) fn truncate(body: &str) -> String {
    body.chars().take(MAX_BODY_CHARS).collect()
}

fn transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transport(format!("request timed out: {e}"))
    } else {
        ProviderError::Transport(e.to_string())
    }
}

async fn ensure_success(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status: status.as_u16(),
        body: truncate(&body),
    })
}

/// GET returning the body as text.
pub(crate) async fn get_text(client: &Client, url: &str) -> Result<String, ProviderError> {
    let response = client.get(url).send().await.map_err(transport)?;
    ensure_success(response)
        .await?
        .text()
        .await
        .map_err(|e| ProviderError::Decode(e.to_string()))
}

/// GET decoding a JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, ProviderError> {
    let text = get_text(client, url).await?;
    serde_json::from_str(&text).map_err(|e| ProviderError::Decode(format!("{url}: {e}")))
}

/// POST a body for a broadcast; non-success statuses go through
/// [`classify_rejection`].
pub(crate) async fn post_broadcast(
    url: &str,
    request: reqwest::RequestBuilder,
) -> Result<String, ProviderError> {
    let response = request.send().await.map_err(transport)?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::Decode(format!("{url}: {e}")))?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(classify_rejection(status.as_u16(), &body))
    }
}
