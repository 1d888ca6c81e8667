//! Explicit connector registration table, built once at startup.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::connect::traits::ConnectFlow;
use crate::destination::traits::DestinationAdapter;
use crate::events::traits::EventBus;
use crate::events::webhook::{InboundWebhookConfig, WebhookDispatcher, WebhookHandler};
use crate::mapper::registry::{EntityMapper, MapperRegistry};
use crate::source::SourceAdapter;
use crate::{Error, Result};

/// What a registered connector provides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub name: String,
    pub source_streams: Vec<String>,
    pub destination: bool,
    pub connect_flow: bool,
    pub webhooks: bool,
    pub mapped_entities: Vec<String>,
}

#[derive(Default)]
pub struct ConnectorRegistry {
    sources: BTreeMap<String, Arc<dyn SourceAdapter>>,
    destinations: BTreeMap<String, Arc<dyn DestinationAdapter>>,
    connect_flows: BTreeMap<String, Arc<dyn ConnectFlow>>,
    webhook_handlers: BTreeMap<String, Arc<dyn WebhookHandler>>,
    mappers: MapperRegistry,
}

fn insert_unique<T: ?Sized>(
    table: &mut BTreeMap<String, Arc<T>>,
    kind: &str,
    name: &str,
    value: Arc<T>,
) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput(format!("{kind} connector name is empty")));
    }
    if table.contains_key(name) {
        return Err(Error::Conflict(format!("{kind} '{name}' already registered")));
    }
    table.insert(name.to_string(), value);
    Ok(())
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connector = adapter.connector_name()))]
    pub fn register_source(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        let name = adapter.connector_name();
        insert_unique(&mut self.sources, "source", name, adapter)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connector = adapter.connector_name()))]
    pub fn register_destination(&mut self, adapter: Arc<dyn DestinationAdapter>) -> Result<()> {
        let name = adapter.connector_name();
        insert_unique(&mut self.destinations, "destination", name, adapter)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connector = flow.connector_name()))]
    pub fn register_connect_flow(&mut self, flow: Arc<dyn ConnectFlow>) -> Result<()> {
        let name = flow.connector_name();
        insert_unique(&mut self.connect_flows, "connect flow", name, flow)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(connector = handler.connector_name()))]
    pub fn register_webhook_handler(&mut self, handler: Arc<dyn WebhookHandler>) -> Result<()> {
        let name = handler.connector_name();
        insert_unique(&mut self.webhook_handlers, "webhook handler", name, handler)
    }

    pub fn register_mapper(&mut self, mapper: EntityMapper) -> Result<()> {
        self.mappers.register(mapper)
    }

    pub fn source(&self, name: &str) -> Result<Arc<dyn SourceAdapter>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("source connector '{name}' not registered")))
    }

    pub fn destination(&self, name: &str) -> Result<Arc<dyn DestinationAdapter>> {
        self.destinations.get(name).cloned().ok_or_else(|| {
            Error::NotFound(format!("destination connector '{name}' not registered"))
        })
    }

    pub fn connect_flow(&self, name: &str) -> Result<Arc<dyn ConnectFlow>> {
        self.connect_flows
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("connect flow '{name}' not registered")))
    }

    pub fn webhook_handlers(&self) -> impl Iterator<Item = &Arc<dyn WebhookHandler>> {
        self.webhook_handlers.values()
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    /// Dispatcher over every registered webhook handler, with the engine's
    /// signing secret and payload limit.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn webhook_dispatcher(
        &self,
        bus: Arc<dyn EventBus>,
        config: &EngineConfig,
    ) -> Result<WebhookDispatcher> {
        let mut dispatcher =
            WebhookDispatcher::new(bus, InboundWebhookConfig::from_engine(config));
        for handler in self.webhook_handlers() {
            dispatcher.register(handler.clone())?;
        }
        Ok(dispatcher)
    }

    /// Summary of every registered connector, sorted by name.
    pub fn connectors(&self) -> Vec<ConnectorInfo> {
        let names: BTreeSet<&String> = self
            .sources
            .keys()
            .chain(self.destinations.keys())
            .chain(self.connect_flows.keys())
            .chain(self.webhook_handlers.keys())
            .collect();
        names
            .into_iter()
            .map(|name| ConnectorInfo {
                name: name.clone(),
                source_streams: self
                    .sources
                    .get(name)
                    .map(|s| s.streams().into_iter().map(|s| s.stream_name).collect())
                    .unwrap_or_default(),
                destination: self.destinations.contains_key(name),
                connect_flow: self.connect_flows.contains_key(name),
                webhooks: self.webhook_handlers.contains_key(name),
                mapped_entities: self.mappers.entity_names(name),
            })
            .collect()
    }
}
