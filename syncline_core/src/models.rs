use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("empty id")]
    Empty,
}

/// Tenant identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for OrgId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for OrgId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Connection identifier, e.g. `conn_01J...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(format!("conn_{}", ulid::Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(IdParseError::Empty);
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Connector config identifier, e.g. `ccfg_hubspot_01J...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectorConfigId(pub String);

impl ConnectorConfigId {
    pub fn generate(connector_name: &str) -> Self {
        Self(format!("ccfg_{connector_name}_{}", ulid::Ulid::new()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectorConfigId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Org-scoped connector credentials/template shared by every connection created under it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: ConnectorConfigId,
    pub org_id: OrgId,
    pub connector_name: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ConnectorConfig {
    #[tracing::instrument(level = "debug", skip(config))]
    pub fn new(
        org_id: OrgId,
        connector_name: impl Into<String> + std::fmt::Debug,
        config: serde_json::Value,
    ) -> Result<Self> {
        let connector_name = connector_name.into();
        if connector_name.trim().is_empty() {
            return Err(Error::InvalidInput("connector_name is empty".to_string()));
        }
        Ok(Self {
            id: ConnectorConfigId::generate(&connector_name),
            org_id,
            connector_name,
            config,
            created_at: Utc::now(),
        })
    }
}

/// A configured instance of a connector for one external account.
///
/// `settings` is connector-typed and may carry secrets (OAuth tokens); it is
/// never logged.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub connector_name: String,
    pub connector_config_id: ConnectorConfigId,
    pub customer_id: Option<String>,
    /// Identifier of the account in the external system (dedupes reconnects).
    pub external_id: Option<String>,
    pub settings: serde_json::Value,
    /// Soft delete flag; disabled connections keep their audit history.
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connector_name", &self.connector_name)
            .field("connector_config_id", &self.connector_config_id)
            .field("customer_id", &self.customer_id)
            .field("external_id", &self.external_id)
            .field("settings", &"<redacted>")
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl Connection {
    pub fn new(
        config: &ConnectorConfig,
        customer_id: Option<String>,
        external_id: Option<String>,
        settings: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::generate(),
            connector_name: config.connector_name.clone(),
            connector_config_id: config.id.clone(),
            customer_id,
            external_id,
            settings,
            disabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow-merge `patch` into `settings` (object keys overwrite, `null` removes).
    pub fn apply_settings_patch(&mut self, patch: &serde_json::Value) {
        let serde_json::Value::Object(patch) = patch else {
            return;
        };
        if !self.settings.is_object() {
            self.settings = serde_json::json!({});
        }
        if let serde_json::Value::Object(settings) = &mut self.settings {
            for (k, v) in patch {
                if v.is_null() {
                    settings.remove(k);
                } else {
                    settings.insert(k.clone(), v.clone());
                }
            }
        }
        self.updated_at = Utc::now();
    }
}
