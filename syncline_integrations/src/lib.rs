//! Reference connectors for the syncline engine.
//!
//! Each connector is feature-gated; `register_defaults` wires the enabled ones
//! into a `ConnectorRegistry`.

pub(crate) mod http;

#[cfg(feature = "hubspot")]
pub mod hubspot;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod token_broker;
#[cfg(feature = "webhook")]
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use syncline_core::connect::TokenBroker;
use syncline_core::{ConnectorRegistry, Result};

/// Register every enabled HTTP connector plus the in-memory destination.
///
/// Without a token broker HubSpot is registered as a source only (tokens are
/// used as stored, no connect flow). The Postgres destination needs a pool and
/// is registered by the host.
#[tracing::instrument(level = "info", skip_all)]
#[cfg_attr(not(feature = "hubspot"), allow(unused_variables))]
pub fn register_defaults(
    registry: &mut ConnectorRegistry,
    broker: Option<Arc<dyn TokenBroker>>,
    timeout: Duration,
) -> Result<()> {
    registry.register_destination(Arc::new(syncline_core::destination::MemoryDestination::new()))?;

    #[cfg(feature = "hubspot")]
    {
        let mut source = hubspot::HubspotSource::new(timeout)?;
        if let Some(broker) = &broker {
            source = source.with_token_broker(broker.clone());
            registry.register_connect_flow(Arc::new(hubspot::HubspotConnect::new(
                broker.clone(),
                timeout,
            )?))?;
        }
        registry.register_source(Arc::new(source))?;
        registry.register_webhook_handler(Arc::new(hubspot::HubspotWebhooks))?;
        for mapper in hubspot::mappers() {
            registry.register_mapper(mapper)?;
        }
    }

    #[cfg(feature = "webhook")]
    registry.register_destination(Arc::new(webhook::WebhookDestination::new(timeout)?))?;

    Ok(())
}
