//! Collaborator contracts (data access, analytics) + fixture, Postgres and HTTP adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use paidops_core::{Opportunity, OpportunityData, RawPaidTrafficRow, Site, Suggestion, SuggestionData};
use paidops_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "paidops-adapters";

#[derive(Debug, Error)]
pub enum DataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding {entity} {id}: {message}")]
    Decode {
        entity: &'static str,
        id: String,
        message: String,
    },
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding analytics response: {0}")]
    Decode(String),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait SiteRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Site>, DataError>;
}

#[async_trait]
pub trait OpportunityRepository: Send + Sync {
    async fn all_by_site_id_and_status(
        &self,
        site_id: Uuid,
        status: &str,
    ) -> Result<Vec<Opportunity>, DataError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Opportunity>, DataError>;
}

#[async_trait]
pub trait SuggestionRepository: Send + Sync {
    async fn all_by_opportunity_id_and_status(
        &self,
        opportunity_id: Uuid,
        status: &str,
    ) -> Result<Vec<Suggestion>, DataError>;

    async fn all_by_opportunity_id(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, DataError>;
}

/// Paid-traffic analytics query client.
#[async_trait]
pub trait AnalyticsClient: Send + Sync {
    async fn query(&self, query: &str) -> Result<Vec<RawPaidTrafficRow>, AnalyticsError>;
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Contents of a site data fixture file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteDataFixture {
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub opportunities: Vec<Opportunity>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

/// In-memory data store backed by a fixture file.
#[derive(Debug, Clone, Default)]
pub struct FixtureDataStore {
    data: SiteDataFixture,
}

impl FixtureDataStore {
    pub fn new(data: SiteDataFixture) -> Self {
        Self { data }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }

    fn suggestions_where(&self, keep: impl Fn(&Suggestion) -> bool) -> Vec<Suggestion> {
        let mut out = self
            .data
            .suggestions
            .iter()
            .filter(|s| keep(s))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|s| s.rank);
        out
    }
}

#[async_trait]
impl SiteRepository for FixtureDataStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Site>, DataError> {
        Ok(self.data.sites.iter().find(|s| s.id == id).cloned())
    }
}

#[async_trait]
impl OpportunityRepository for FixtureDataStore {
    async fn all_by_site_id_and_status(
        &self,
        site_id: Uuid,
        status: &str,
    ) -> Result<Vec<Opportunity>, DataError> {
        Ok(self
            .data
            .opportunities
            .iter()
            .filter(|o| o.site_id == site_id && o.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Opportunity>, DataError> {
        Ok(self.data.opportunities.iter().find(|o| o.id == id).cloned())
    }
}

#[async_trait]
impl SuggestionRepository for FixtureDataStore {
    async fn all_by_opportunity_id_and_status(
        &self,
        opportunity_id: Uuid,
        status: &str,
    ) -> Result<Vec<Suggestion>, DataError> {
        Ok(self.suggestions_where(|s| s.opportunity_id == opportunity_id && s.status == status))
    }

    async fn all_by_opportunity_id(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, DataError> {
        Ok(self.suggestions_where(|s| s.opportunity_id == opportunity_id))
    }
}

/// Postgres data store.
///
/// Expects `sites(id, base_url, organization_id)`,
/// `opportunities(id, site_id, title, description, type, status, tags jsonb, data jsonb)` and
/// `suggestions(id, opportunity_id, status, rank, data jsonb)`.
#[derive(Debug, Clone)]
pub struct PgDataStore {
    pool: PgPool,
}

impl PgDataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to DATABASE_URL")?;
        Ok(Self::new(pool))
    }
}

fn decode_json<T: DeserializeOwned + Default>(
    entity: &'static str,
    id: Uuid,
    value: Option<JsonValue>,
) -> Result<T, DataError> {
    match value {
        None | Some(JsonValue::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|err| DataError::Decode {
            entity,
            id: id.to_string(),
            message: err.to_string(),
        }),
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<Opportunity, DataError> {
    let id: Uuid = row.try_get("id")?;
    let tags: Vec<String> = decode_json("opportunity", id, row.try_get("tags")?)?;
    let data: OpportunityData = decode_json("opportunity", id, row.try_get("data")?)?;
    Ok(Opportunity {
        id,
        site_id: row.try_get("site_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        opportunity_type: row.try_get("type")?,
        status: row.try_get("status")?,
        tags,
        data,
    })
}

fn suggestion_from_row(row: &PgRow) -> Result<Suggestion, DataError> {
    let id: Uuid = row.try_get("id")?;
    let data: SuggestionData = decode_json("suggestion", id, row.try_get("data")?)?;
    Ok(Suggestion {
        id,
        opportunity_id: row.try_get("opportunity_id")?,
        status: row.try_get("status")?,
        rank: row.try_get("rank")?,
        data,
    })
}

#[async_trait]
impl SiteRepository for PgDataStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Site>, DataError> {
        let row = sqlx::query(
            r#"
            SELECT id, base_url, organization_id
              FROM sites
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Site, DataError> {
            Ok(Site {
                id: row.try_get("id")?,
                base_url: row.try_get("base_url")?,
                organization_id: row.try_get("organization_id")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OpportunityRepository for PgDataStore {
    async fn all_by_site_id_and_status(
        &self,
        site_id: Uuid,
        status: &str,
    ) -> Result<Vec<Opportunity>, DataError> {
        let rows = sqlx::query(
            r#"
            SELECT id, site_id, title, description, type, status, tags, data
              FROM opportunities
             WHERE site_id = $1
               AND status = $2
             ORDER BY id
            "#,
        )
        .bind(site_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(opportunity_from_row).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Opportunity>, DataError> {
        let row = sqlx::query(
            r#"
            SELECT id, site_id, title, description, type, status, tags, data
              FROM opportunities
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(opportunity_from_row).transpose()
    }
}

#[async_trait]
impl SuggestionRepository for PgDataStore {
    async fn all_by_opportunity_id_and_status(
        &self,
        opportunity_id: Uuid,
        status: &str,
    ) -> Result<Vec<Suggestion>, DataError> {
        let rows = sqlx::query(
            r#"
            SELECT id, opportunity_id, status, rank, data
              FROM suggestions
             WHERE opportunity_id = $1
               AND status = $2
             ORDER BY rank ASC
            "#,
        )
        .bind(opportunity_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(suggestion_from_row).collect()
    }

    async fn all_by_opportunity_id(&self, opportunity_id: Uuid) -> Result<Vec<Suggestion>, DataError> {
        let rows = sqlx::query(
            r#"
            SELECT id, opportunity_id, status, rank, data
              FROM suggestions
             WHERE opportunity_id = $1
             ORDER BY rank ASC
            "#,
        )
        .bind(opportunity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(suggestion_from_row).collect()
    }
}

/// Analytics client replaying rows from a JSON fixture (array of rows).
#[derive(Debug, Clone, Default)]
pub struct FixtureAnalyticsClient {
    rows: Vec<RawPaidTrafficRow>,
}

impl FixtureAnalyticsClient {
    pub fn new(rows: Vec<RawPaidTrafficRow>) -> Self {
        Self { rows }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(read_json_file(path)?))
    }
}

#[async_trait]
impl AnalyticsClient for FixtureAnalyticsClient {
    async fn query(&self, query: &str) -> Result<Vec<RawPaidTrafficRow>, AnalyticsError> {
        debug!(query, rows = self.rows.len(), "serving analytics rows from fixture");
        Ok(self.rows.clone())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnalyticsResponse {
    Wrapped { rows: Vec<RawPaidTrafficRow> },
    Bare(Vec<RawPaidTrafficRow>),
}

pub fn decode_analytics_response(body: &[u8]) -> Result<Vec<RawPaidTrafficRow>, AnalyticsError> {
    match serde_json::from_slice::<AnalyticsResponse>(body) {
        Ok(AnalyticsResponse::Wrapped { rows }) | Ok(AnalyticsResponse::Bare(rows)) => Ok(rows),
        Err(err) => Err(AnalyticsError::Decode(err.to_string())),
    }
}

/// Analytics client posting `{"query": ...}` to a query gateway.
#[derive(Debug)]
pub struct HttpAnalyticsClient {
    fetcher: HttpFetcher,
    endpoint: String,
}

impl HttpAnalyticsClient {
    pub fn new(fetcher: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl AnalyticsClient for HttpAnalyticsClient {
    async fn query(&self, query: &str) -> Result<Vec<RawPaidTrafficRow>, AnalyticsError> {
        let body = serde_json::json!({ "query": query });
        let response = self.fetcher.post_json(&self.endpoint, &body).await?;
        decode_analytics_response(&response.body)
    }
}
