//! HubSpot connector.
//!
//! Source: contacts and companies from the CRM v3 search API, sorted by last
//! modification. The cursor carries the modification watermark plus HubSpot's
//! `after` paging token, so an interrupted stream resumes mid-listing.
//! Also provides the unified mappers, the OAuth connect flow (through a
//! `TokenBroker`) and a handler for CRM webhook subscriptions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use syncline_core::connect::{
    CodeExchange, ConnectContext, ConnectFlow, ConnectInput, ConnectOutput, PostConnectResult,
    TokenBroker, TokenRefresh,
};
use syncline_core::error::ErrorContext;
use syncline_core::events::{WebhookEvent, WebhookHandler, WebhookInput};
use syncline_core::mapper::mapping::{as_number, as_string, as_timestamp};
use syncline_core::mapper::{EntityMapper, FieldMapping, UnifiedEntityName, first_of};
use syncline_core::settings::{ConnectorSettings, require_non_empty};
use syncline_core::source::{
    Page, PageFetcher, PageRecord, SourceAdapter, SourceContext, StreamSpec, iterate_entities,
};
use syncline_core::sync::{OpStream, SyncOperation};
use syncline_core::{ConnectorConfig, Error, Result};
use tracing::instrument;

use crate::http::{build_client, send_json};

pub const NAME: &str = "hubspot";
pub const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
const AUTHORIZE_URL: &str = "https://app.hubspot.com/oauth/authorize";
const DEFAULT_SCOPES: &[&str] = &[
    "crm.objects.contacts.read",
    "crm.objects.companies.read",
];
/// Tokens expiring within this window are refreshed before a run.
const REFRESH_SKEW_SECS: i64 = 300;

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_page_size() -> u32 {
    100
}

/// Connector-level config (`ConnectorConfig::config`).
#[derive(Clone, Deserialize)]
pub struct HubspotConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl fmt::Debug for HubspotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubspotConfig")
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("api_base", &self.api_base)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl ConnectorSettings for HubspotConfig {
    fn check(&self) -> Result<()> {
        require_non_empty("api_base", &self.api_base)?;
        if !(1..=200).contains(&self.page_size) {
            return Err(Error::Validation(
                "page_size must be between 1 and 200".to_string(),
            ));
        }
        Ok(())
    }
}

impl HubspotConfig {
    fn oauth_client(&self) -> Result<(String, String)> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.trim().is_empty() && !secret.trim().is_empty() => {
                Ok((id.clone(), secret.clone()))
            }
            _ => Err(Error::Validation(
                "hubspot oauth requires client_id and client_secret".to_string(),
            )),
        }
    }
}

/// Per-connection settings (`Connection::settings`).
#[derive(Clone, Deserialize)]
pub struct HubspotSettings {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for HubspotSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubspotSettings")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl ConnectorSettings for HubspotSettings {
    fn check(&self) -> Result<()> {
        require_non_empty("access_token", &self.access_token)
    }
}

impl HubspotSettings {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.refresh_token.is_some()
            && self
                .expires_at
                .is_some_and(|at| at <= now + chrono::Duration::seconds(REFRESH_SKEW_SECS))
    }
}

/// Position inside one object listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubspotCursor {
    /// Only objects modified at or after this instant (ms since epoch) are
    /// listed; records on the boundary are re-read and upserted again.
    pub modified_after_ms: i64,
    /// Paging token of the listing in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    /// Highest modification time seen so far in the listing in progress.
    #[serde(default)]
    pub high_water_ms: i64,
}

impl HubspotCursor {
    /// Accepts the structured cursor or a bare ms watermark (number or string).
    pub fn from_value(value: Option<&Value>) -> Result<Self> {
        let Some(value) = value else {
            return Ok(Self::default());
        };
        let watermark = |ms: i64| Self {
            modified_after_ms: ms.max(0),
            after: None,
            high_water_ms: ms.max(0),
        };
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(watermark)
                .ok_or_else(|| Error::InvalidInput("hubspot cursor must be an integer".to_string())),
            Value::String(s) => s
                .parse::<i64>()
                .map(watermark)
                .map_err(|e| Error::backend("parse hubspot cursor ms", e)),
            Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| Error::InvalidInput(format!("invalid hubspot cursor: {e}"))),
            _ => Err(Error::InvalidInput(
                "hubspot cursor must be ms epoch or an object".to_string(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// CRM object behind a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrmObject {
    Contact,
    Company,
}

impl CrmObject {
    fn for_stream(stream_name: &str) -> Option<Self> {
        match stream_name {
            "contact" => Some(Self::Contact),
            "company" => Some(Self::Company),
            _ => None,
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Self::Contact => "contacts",
            Self::Company => "companies",
        }
    }

    fn modified_property(&self) -> &'static str {
        match self {
            Self::Contact => "lastmodifieddate",
            Self::Company => "hs_lastmodifieddate",
        }
    }

    fn properties(&self) -> &'static [&'static str] {
        match self {
            Self::Contact => &[
                "firstname",
                "lastname",
                "email",
                "phone",
                "company",
                "lastmodifieddate",
            ],
            Self::Company => &[
                "name",
                "domain",
                "industry",
                "numberofemployees",
                "hs_lastmodifieddate",
            ],
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<FilterGroup>,
    sorts: Vec<Sort>,
    properties: Vec<String>,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<String>,
}

#[derive(Debug, Serialize)]
struct FilterGroup {
    filters: Vec<Filter>,
}

#[derive(Debug, Serialize)]
struct Filter {
    #[serde(rename = "propertyName")]
    property_name: String,
    operator: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct Sort {
    #[serde(rename = "propertyName")]
    property_name: String,
    direction: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

fn search_request(object: CrmObject, cursor: &HubspotCursor, page_size: u32) -> SearchRequest {
    let property = object.modified_property().to_string();
    SearchRequest {
        filter_groups: vec![FilterGroup {
            filters: vec![Filter {
                property_name: property.clone(),
                operator: "GTE".to_string(),
                value: cursor.modified_after_ms.to_string(),
            }],
        }],
        sorts: vec![Sort {
            property_name: property,
            direction: "ASCENDING".to_string(),
        }],
        properties: object.properties().iter().map(|s| s.to_string()).collect(),
        limit: page_size,
        after: cursor.after.clone(),
    }
}

fn parse_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

fn modified_ms(object: CrmObject, record: &Value) -> Option<i64> {
    record
        .get("properties")
        .and_then(|p| p.get(object.modified_property()))
        .and_then(parse_ms)
        .or_else(|| record.get("updatedAt").and_then(parse_ms))
}

/// Turn one search response into a page, advancing the cursor.
///
/// While HubSpot reports a next page the watermark stays put and the paging
/// token moves; the last page promotes the highest modification time seen to
/// the new watermark.
fn page_from_response(object: CrmObject, cursor: &HubspotCursor, resp: SearchResponse) -> Page {
    if resp.results.is_empty() {
        return Page {
            records: Vec::new(),
            next_cursor: None,
            has_more: false,
        };
    }

    let high_water_ms = resp
        .results
        .iter()
        .filter_map(|r| modified_ms(object, r))
        .fold(cursor.high_water_ms.max(cursor.modified_after_ms), i64::max);
    let records = resp
        .results
        .into_iter()
        .map(|data| PageRecord {
            id: data.get("id").and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            data,
        })
        .collect();

    let next_after = resp.paging.and_then(|p| p.next).map(|n| n.after);
    let (next, has_more) = match next_after {
        Some(after) => (
            HubspotCursor {
                modified_after_ms: cursor.modified_after_ms,
                after: Some(after),
                high_water_ms,
            },
            true,
        ),
        None => (
            HubspotCursor {
                modified_after_ms: high_water_ms,
                after: None,
                high_water_ms,
            },
            false,
        ),
    };
    Page {
        records,
        next_cursor: Some(next.to_value()),
        has_more,
    }
}

struct HubspotFetcher {
    client: Client,
    api_base: String,
    access_token: String,
    page_size: u32,
    context: ErrorContext,
}

#[async_trait]
impl PageFetcher for HubspotFetcher {
    #[instrument(level = "debug", skip(self, cursor), fields(stream_name = %stream.stream_name))]
    async fn fetch_page(&self, stream: &StreamSpec, cursor: Option<&Value>) -> Result<Page> {
        let context = self.context.clone().with_stream(&stream.stream_name);
        let object = CrmObject::for_stream(&stream.stream_name).ok_or_else(|| {
            Error::fatal(context.clone(), format!("unknown hubspot stream '{}'", stream.stream_name))
        })?;
        let cursor = HubspotCursor::from_value(cursor)?;
        let url = format!("{}/crm/v3/objects/{}/search", self.api_base, object.path());
        let req = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&search_request(object, &cursor, self.page_size));
        let resp: SearchResponse = send_json(req, &context).await?;
        Ok(page_from_response(object, &cursor, resp))
    }
}

/// Extraction side of the HubSpot connector.
pub struct HubspotSource {
    client: Client,
    broker: Option<Arc<dyn TokenBroker>>,
}

impl HubspotSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            broker: None,
        })
    }

    /// Refresh expiring OAuth tokens through `broker` before each run.
    pub fn with_token_broker(mut self, broker: Arc<dyn TokenBroker>) -> Self {
        self.broker = Some(broker);
        self
    }
}

impl SourceAdapter for HubspotSource {
    fn connector_name(&self) -> &'static str {
        NAME
    }

    fn streams(&self) -> Vec<StreamSpec> {
        vec![StreamSpec::named("contact"), StreamSpec::named("company")]
    }

    #[instrument(level = "info", skip_all, fields(connection_id = %ctx.connection.id))]
    fn source_sync(&self, ctx: SourceContext) -> Result<OpStream> {
        let config = HubspotConfig::validate(&ctx.config)?;
        let settings = HubspotSettings::validate(&ctx.connection.settings)?;
        let streams = ctx.select_streams(self.streams());
        let context = ErrorContext::new(NAME).with_connection(ctx.connection.id.as_str());

        let refresh = match (&self.broker, &settings.refresh_token) {
            (Some(broker), Some(refresh_token)) if settings.needs_refresh(Utc::now()) => {
                let (client_id, client_secret) = config.oauth_client()?;
                Some((
                    broker.clone(),
                    TokenRefresh {
                        connector_name: NAME.to_string(),
                        client_id,
                        client_secret,
                        refresh_token: refresh_token.clone(),
                    },
                ))
            }
            _ => None,
        };
        let client = self.client.clone();

        Ok(Box::pin(async_stream::stream! {
            let mut access_token = settings.access_token;
            if let Some((broker, request)) = refresh {
                match broker.refresh(request).await {
                    Ok(tokens) => {
                        tracing::info!(connection_id = %ctx.connection.id, "refreshed hubspot access token");
                        access_token = tokens.access_token.clone();
                        yield Ok(SyncOperation::connection_update(
                            ctx.connection.id.clone(),
                            tokens.to_settings(),
                        ));
                    }
                    Err(e) => {
                        yield Err(Error::fatal(context, format!("token refresh failed: {e}")));
                        return;
                    }
                }
            }

            let fetcher = Arc::new(HubspotFetcher {
                client,
                api_base: config.api_base.trim_end_matches('/').to_string(),
                access_token,
                page_size: config.page_size,
                context,
            });
            let mut pages = iterate_entities(ctx, streams, fetcher);
            while let Some(item) = pages.next().await {
                yield item;
            }
        }))
    }
}

/// Mappers from HubSpot objects to the unified `Contact` and `Company` records.
pub fn mappers() -> Vec<EntityMapper> {
    let contact = FieldMapping::new()
        .field("id", |raw| as_string(&first_of(raw, &["id"])))
        .path("first_name", "properties.firstname")
        .path("last_name", "properties.lastname")
        .path("email", "properties.email")
        .path("phone", "properties.phone")
        .path("company_name", "properties.company")
        .field("updated_at", |raw| {
            as_timestamp(&first_of(raw, &["properties.lastmodifieddate", "updatedAt"]))
        });
    let company = FieldMapping::new()
        .field("id", |raw| as_string(&first_of(raw, &["id"])))
        .path("name", "properties.name")
        .path("domain", "properties.domain")
        .path("industry", "properties.industry")
        .field("employee_count", |raw| {
            as_number(&first_of(raw, &["properties.numberofemployees"]))
        })
        .field("updated_at", |raw| {
            as_timestamp(&first_of(raw, &["properties.hs_lastmodifieddate", "updatedAt"]))
        });
    vec![
        EntityMapper::new(NAME, "contact", UnifiedEntityName::Contact, contact),
        EntityMapper::new(NAME, "company", UnifiedEntityName::Company, company),
    ]
}

#[derive(Debug, Deserialize)]
struct AccessTokenInfo {
    hub_id: i64,
}

/// OAuth connect flow. Code exchange goes through the token broker; the
/// portal (hub) id becomes the connection's external id.
pub struct HubspotConnect {
    client: Client,
    broker: Arc<dyn TokenBroker>,
}

impl HubspotConnect {
    pub fn new(broker: Arc<dyn TokenBroker>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            broker,
        })
    }
}

#[async_trait]
impl ConnectFlow for HubspotConnect {
    fn connector_name(&self) -> &'static str {
        NAME
    }

    #[instrument(level = "debug", skip_all)]
    fn pre_connect(&self, config: &ConnectorConfig, ctx: &ConnectContext) -> Result<ConnectInput> {
        let cfg = HubspotConfig::validate(&config.config)?;
        let (client_id, _) = cfg.oauth_client()?;
        let redirect_uri = ctx
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::Validation("redirect_uri is required".to_string()))?;
        let scopes = if cfg.scopes.is_empty() {
            DEFAULT_SCOPES.join(" ")
        } else {
            cfg.scopes.join(" ")
        };
        let authorize_url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scopes.as_str()),
            ],
        )
        .map_err(|e| Error::backend("build hubspot authorize url", e))?;
        Ok(ConnectInput(json!({
            "authorize_url": authorize_url.as_str(),
            "client_id": client_id,
            "scope": scopes,
        })))
    }

    #[instrument(level = "info", skip_all)]
    async fn post_connect(
        &self,
        output: ConnectOutput,
        config: &ConnectorConfig,
    ) -> Result<PostConnectResult> {
        let cfg = HubspotConfig::validate(&config.config)?;
        let (client_id, client_secret) = cfg.oauth_client()?;
        let code = output
            .0
            .get("code")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::connect_flow(NAME, "missing authorization code"))?;
        let redirect_uri = output
            .0
            .get("redirect_uri")
            .and_then(Value::as_str)
            .map(str::to_string);

        let tokens = self
            .broker
            .exchange_code(CodeExchange {
                connector_name: NAME.to_string(),
                client_id,
                client_secret,
                code: code.to_string(),
                redirect_uri,
            })
            .await?;

        let url = format!(
            "{}/oauth/v1/access-tokens/{}",
            cfg.api_base.trim_end_matches('/'),
            tokens.access_token
        );
        let info: AccessTokenInfo =
            send_json(self.client.get(url), &ErrorContext::new(NAME)).await?;

        let mut settings = tokens.to_settings();
        settings["hub_id"] = json!(info.hub_id);
        Ok(PostConnectResult {
            connection_external_id: Some(info.hub_id.to_string()),
            settings,
            trigger_default_sync: true,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionEvent {
    event_id: i64,
    #[serde(default)]
    portal_id: Option<i64>,
    subscription_type: String,
}

/// CRM webhook subscriptions: HubSpot posts a JSON array of events.
pub struct HubspotWebhooks;

#[async_trait]
impl WebhookHandler for HubspotWebhooks {
    fn connector_name(&self) -> &'static str {
        NAME
    }

    #[instrument(level = "debug", skip_all, fields(trace_id = %input.trace_id))]
    async fn handle_webhook(&self, input: &WebhookInput) -> Result<Vec<WebhookEvent>> {
        let body = input.json_body()?;
        let Value::Array(items) = body else {
            return Err(Error::InvalidInput(
                "hubspot webhook body must be a json array".to_string(),
            ));
        };
        items
            .into_iter()
            .map(|item| {
                let event: SubscriptionEvent = serde_json::from_value(item.clone())
                    .map_err(|e| Error::InvalidInput(format!("invalid hubspot event: {e}")))?;
                Ok(WebhookEvent {
                    topic: format!("{NAME}.{}", event.subscription_type),
                    connection_external_id: event.portal_id.map(|id| id.to_string()),
                    dedupe_key: format!("{NAME}:{}", event.event_id),
                    payload: item,
                })
            })
            .collect()
    }
}
