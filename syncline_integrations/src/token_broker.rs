//! HTTP client for an external OAuth token broker.
//!
//! The broker owns provider-specific token endpoints; this client only posts
//! `CodeExchange` / `TokenRefresh` requests to it and reads back `OAuthTokens`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use syncline_core::connect::{CodeExchange, OAuthTokens, TokenBroker, TokenRefresh};
use syncline_core::error::ErrorContext;
use syncline_core::settings::require_non_empty;
use syncline_core::{Error, Result};

use crate::http::{build_client, send_json};

pub struct HttpTokenBroker {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTokenBroker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        require_non_empty("token broker base_url", &base_url)?;
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Validation(format!(
                "token broker base_url must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        connector_name: &str,
        body: &T,
    ) -> Result<OAuthTokens> {
        let mut req = self.client.post(self.endpoint(path)).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let context = ErrorContext::new(connector_name);
        let tokens: OAuthTokens = send_json(req, &context).await?;
        require_non_empty("access_token", &tokens.access_token)?;
        Ok(tokens)
    }
}

#[async_trait]
impl TokenBroker for HttpTokenBroker {
    #[tracing::instrument(level = "info", skip_all, fields(connector = %request.connector_name))]
    async fn exchange_code(&self, request: CodeExchange) -> Result<OAuthTokens> {
        self.post("oauth/exchange", &request.connector_name, &request)
            .await
            .map_err(|e| Error::connect_flow(&request.connector_name, format!("code exchange failed: {e}")))
    }

    #[tracing::instrument(level = "info", skip_all, fields(connector = %request.connector_name))]
    async fn refresh(&self, request: TokenRefresh) -> Result<OAuthTokens> {
        self.post("oauth/refresh", &request.connector_name, &request).await
    }
}
