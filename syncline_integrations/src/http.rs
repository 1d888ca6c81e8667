//! Shared reqwest plumbing for the HTTP connectors.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use syncline_core::error::ErrorContext;
use syncline_core::retry::error_for_status;
use syncline_core::{Error, Result};

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::backend("build reqwest client", e))
}

/// Send `req` and decode a JSON body.
///
/// Transport failures and timeouts are transient; unsuccessful statuses go
/// through `error_for_status`.
pub(crate) async fn send_json<T: DeserializeOwned>(
    req: RequestBuilder,
    context: &ErrorContext,
) -> Result<T> {
    let resp = send(req, context).await?;
    resp.json::<T>()
        .await
        .map_err(|e| Error::fatal(context.clone(), format!("decode response body: {e}")))
}

/// Send `req`, failing on any non-2xx status.
pub(crate) async fn send(req: RequestBuilder, context: &ErrorContext) -> Result<reqwest::Response> {
    let resp = req
        .send()
        .await
        .map_err(|e| Error::transient(context.clone(), format!("request failed: {e}")))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(error_for_status(context, status.as_u16(), &text));
    }
    Ok(resp)
}
