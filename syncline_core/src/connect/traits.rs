use crate::Result;
use crate::connect::models::{ConnectContext, ConnectInput, ConnectOutput, PostConnectResult};
use crate::models::ConnectorConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A connector's credential acquisition hooks. Invoked by the host API layer
/// through `ConnectService`, never by the sync engine itself.
#[async_trait]
pub trait ConnectFlow: Send + Sync {
    fn connector_name(&self) -> &'static str;

    /// Parameters for the external auth step. Pure: reads config only.
    fn pre_connect(&self, config: &ConnectorConfig, ctx: &ConnectContext) -> Result<ConnectInput>;

    /// Exchange the transient artifact from the external step for durable settings.
    async fn post_connect(
        &self,
        output: ConnectOutput,
        config: &ConnectorConfig,
    ) -> Result<PostConnectResult>;
}

/// OAuth tokens as returned by a token broker.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl OAuthTokens {
    /// Settings patch carrying these tokens. Absent values are left out so a
    /// refresh that does not rotate the refresh token keeps the stored one.
    pub fn to_settings(&self) -> serde_json::Value {
        let mut patch = serde_json::json!({
            "access_token": self.access_token,
            "refresh_token": self.refresh_token,
            "expires_at": self.expires_at,
            "scope": self.scope,
        });
        if let Some(map) = patch.as_object_mut() {
            map.retain(|_, v| !v.is_null());
        }
        patch
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExchange {
    pub connector_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub code: String,
    pub redirect_uri: Option<String>,
}

impl fmt::Debug for CodeExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeExchange")
            .field("connector_name", &self.connector_name)
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRefresh {
    pub connector_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl fmt::Debug for TokenRefresh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefresh")
            .field("connector_name", &self.connector_name)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// External OAuth broker. The engine never implements an OAuth provider itself.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn exchange_code(&self, request: CodeExchange) -> Result<OAuthTokens>;

    async fn refresh(&self, request: TokenRefresh) -> Result<OAuthTokens>;
}
