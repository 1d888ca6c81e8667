use crate::models::{ConnectionId, ConnectorConfigId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential acquisition states.
///
/// `Idle -> PreConnecting -> AwaitingExternalAuth -> PostConnecting -> Connected`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectState {
    Idle,
    PreConnecting,
    AwaitingExternalAuth,
    PostConnecting,
    Connected,
    Failed,
}

impl ConnectState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ConnectState) -> bool {
        use ConnectState::*;
        match (self, next) {
            (Idle, PreConnecting)
            | (PreConnecting, AwaitingExternalAuth)
            | (AwaitingExternalAuth, PostConnecting)
            | (PostConnecting, Connected) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::PreConnecting => "pre_connecting",
            Self::AwaitingExternalAuth => "awaiting_external_auth",
            Self::PostConnecting => "post_connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Caller-provided context for `pre_connect`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectContext {
    pub customer_id: Option<String>,
    /// Where the external auth UI should send the user back to.
    pub redirect_uri: Option<String>,
    /// Set when re-authenticating an existing connection.
    pub connection_id: Option<ConnectionId>,
}

/// Parameters the external auth step needs (authorize URL, scopes, client id).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectInput(pub serde_json::Value);

/// What the external auth step returned (authorization code, API key, ...).
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectOutput(pub serde_json::Value);

impl fmt::Debug for ConnectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectOutput(<redacted>)")
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PostConnectResult {
    /// Identifier of the external account; dedupes reconnects.
    pub connection_external_id: Option<String>,
    /// Durable connection settings (may hold credentials).
    pub settings: serde_json::Value,
    #[serde(default)]
    pub trigger_default_sync: bool,
}

impl fmt::Debug for PostConnectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostConnectResult")
            .field("connection_external_id", &self.connection_external_id)
            .field("settings", &"<redacted>")
            .field("trigger_default_sync", &self.trigger_default_sync)
            .finish()
    }
}

/// One pass through the connect state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectSession {
    pub id: String,
    pub connector_name: String,
    pub connector_config_id: ConnectorConfigId,
    pub context: ConnectContext,
    pub state: ConnectState,
    pub connect_input: Option<ConnectInput>,
    pub connection_id: Option<ConnectionId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectSession {
    pub fn new(
        connector_name: impl Into<String>,
        connector_config_id: ConnectorConfigId,
        context: ConnectContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("csess_{}", ulid::Ulid::new()),
            connector_name: connector_name.into(),
            connector_config_id,
            context,
            state: ConnectState::Idle,
            connect_input: None,
            connection_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: ConnectState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::connect_flow(
                self.connector_name.clone(),
                format!("illegal connect transition {} -> {}", self.state, next),
            ));
        }
        tracing::debug!(session_id = %self.id, from = %self.state, to = %next, "connect transition");
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark failed; a session that is already terminal keeps its state.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = ConnectState::Failed;
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ConnectSession {
        ConnectSession::new("hubspot", "ccfg_hubspot_1".into(), ConnectContext::default())
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut s = session();
        for next in [
            ConnectState::PreConnecting,
            ConnectState::AwaitingExternalAuth,
            ConnectState::PostConnecting,
            ConnectState::Connected,
        ] {
            s.transition(next).unwrap();
        }
        assert!(s.state.is_terminal());
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut s = session();
        let err = s.transition(ConnectState::PostConnecting).unwrap_err();
        assert!(matches!(err, Error::ConnectFlow { .. }));
        assert_eq!(s.state, ConnectState::Idle);
    }

    #[test]
    fn failed_is_reachable_from_non_terminal_states_only() {
        let mut s = session();
        s.transition(ConnectState::PreConnecting).unwrap();
        s.fail("boom");
        assert_eq!(s.state, ConnectState::Failed);
        assert!(s.transition(ConnectState::Failed).is_err());
        assert!(s.transition(ConnectState::PreConnecting).is_err());

        let mut done = session();
        done.state = ConnectState::Connected;
        done.fail("late");
        assert_eq!(done.state, ConnectState::Connected);
        assert_eq!(done.error_message, None);
    }

    #[test]
    fn connect_output_debug_is_redacted() {
        let out = ConnectOutput(serde_json::json!({"code": "secret-code"}));
        assert!(!format!("{out:?}").contains("secret-code"));
    }
}
