//! Connect flow: credential acquisition state machine and connection lifecycle.

pub mod models;
pub mod service;
pub mod traits;

pub use models::{
    ConnectContext, ConnectInput, ConnectOutput, ConnectSession, ConnectState, PostConnectResult,
};
pub use service::{ConnectOutcome, ConnectService};
pub use traits::{CodeExchange, ConnectFlow, OAuthTokens, TokenBroker, TokenRefresh};
