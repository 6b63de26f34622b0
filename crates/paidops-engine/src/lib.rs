//! Top-paid opportunity pipeline: classification, paid-traffic matching and ranking.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use paidops_adapters::{
    AnalyticsClient, AnalyticsError, DataError, FixtureAnalyticsClient, FixtureDataStore, HttpAnalyticsClient,
    OpportunityRepository, PgDataStore, SiteDataFixture, SiteRepository, SuggestionRepository,
};
use paidops_core::{
    classify, Category, ConfigWarning, Opportunity, RawPaidTrafficRow, Site, ThresholdConfig, OPEN_STATUSES,
    STATUS_NEW,
};
use paidops_storage::{CacheStore, FsCacheStore, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod cache;
pub mod matcher;
pub mod window;

pub use cache::{cache_key, CachedAnalytics, PaidTrafficRows, RowSource};
pub use matcher::{
    candidate_sources, is_eligible, match_opportunities, match_opportunity, summarize_unconditional, MatchedResult,
    SuggestionMemo, TrafficIndex,
};
pub use window::{build_paid_traffic_query, Period, QueryVariant, TimeWindow, WindowError};

pub const CRATE_NAME: &str = "paidops-engine";

pub const DEFAULT_ANALYTICS_TABLE: &str = "rum_metrics.paid_traffic";

pub const PAID_QUERY_VARIANT_SETTING: &str = "PAID_QUERY_VARIANT";

/// Raw matcher settings as found in the environment.
#[derive(Debug, Clone, Default)]
pub struct MatcherSettings {
    pub paid_data_threshold: Option<String>,
    pub cwv_thresholds: Option<JsonValue>,
    pub query_variant: Option<String>,
    pub analytics_table: Option<String>,
}

impl MatcherSettings {
    pub fn from_env() -> Self {
        Self {
            paid_data_threshold: std::env::var("PAID_DATA_THRESHOLD").ok(),
            cwv_thresholds: std::env::var("CWV_THRESHOLDS").ok().map(JsonValue::String),
            query_variant: std::env::var("PAID_QUERY_VARIANT").ok(),
            analytics_table: std::env::var("ANALYTICS_TABLE").ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatcherConfig {
    pub thresholds: ThresholdConfig,
    pub variant: QueryVariant,
    pub analytics_table: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            variant: QueryVariant::default(),
            analytics_table: DEFAULT_ANALYTICS_TABLE.to_string(),
        }
    }
}

impl MatcherConfig {
    /// Never fails: unusable settings fall back to defaults and come back as warnings.
    pub fn from_settings(settings: &MatcherSettings) -> (Self, Vec<ConfigWarning>) {
        let (thresholds, mut warnings) = ThresholdConfig::from_settings(
            settings.paid_data_threshold.as_deref(),
            settings.cwv_thresholds.as_ref(),
        );

        let variant = match settings.query_variant.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            None => QueryVariant::default(),
            Some(raw) => QueryVariant::parse(raw).unwrap_or_else(|| {
                warnings.push(ConfigWarning::new(
                    PAID_QUERY_VARIANT_SETTING,
                    format!("{raw:?} is not one of categorical, percentile"),
                ));
                QueryVariant::default()
            }),
        };

        let analytics_table = settings
            .analytics_table
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_ANALYTICS_TABLE)
            .to_string();

        (
            Self {
                thresholds,
                variant,
                analytics_table,
            },
            warnings,
        )
    }

    pub fn from_settings_logged(settings: &MatcherSettings) -> Self {
        let (config, warnings) = Self::from_settings(settings);
        for warning in warnings {
            warn!("{warning}");
        }
        config
    }

    pub fn from_env() -> Self {
        Self::from_settings_logged(&MatcherSettings::from_env())
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: Option<String>,
    pub fixtures_path: PathBuf,
    pub analytics_fixture: Option<PathBuf>,
    pub analytics_endpoint: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cache_bucket: Option<String>,
    pub cache_root: PathBuf,
    pub web_port: u16,
    pub matcher: MatcherSettings,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: non_empty_env("DATABASE_URL"),
            fixtures_path: std::env::var("PAIDOPS_FIXTURES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("fixtures/site_data.json")),
            analytics_fixture: non_empty_env("PAIDOPS_ANALYTICS_FIXTURE").map(PathBuf::from),
            analytics_endpoint: non_empty_env("ANALYTICS_ENDPOINT"),
            http_timeout_secs: std::env::var("PAIDOPS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("PAIDOPS_USER_AGENT").unwrap_or_else(|_| "paidops/0.1".to_string()),
            cache_bucket: non_empty_env("S3_BUCKET_NAME"),
            cache_root: std::env::var("CACHE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./cache")),
            web_port: std::env::var("PAIDOPS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            matcher: MatcherSettings::from_env(),
        }
    }
}

/// One entry of the top-paid response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopPaidOpportunity {
    #[serde(rename = "opportunityId")]
    pub opportunity_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub system_type: String,
    pub status: String,
    pub urls: Vec<String>,
    #[serde(rename = "pageViews")]
    pub page_views: u64,
    #[serde(rename = "projectedTrafficValue")]
    pub projected_traffic_value: Option<f64>,
    #[serde(rename = "projectedConversionValue")]
    pub projected_conversion_value: Option<f64>,
}

impl TopPaidOpportunity {
    fn new(opportunity: &Opportunity, matched: MatchedResult) -> Self {
        Self {
            opportunity_id: opportunity.id,
            title: opportunity.title.clone(),
            description: opportunity.description.clone(),
            system_type: opportunity.opportunity_type.clone(),
            status: opportunity.status.clone(),
            urls: matched.urls,
            page_views: matched.page_views,
            projected_traffic_value: opportunity.data.projected_traffic_value,
            projected_conversion_value: opportunity.data.projected_conversion_value,
        }
    }
}

/// What happened to the cwv/forms matching step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingOutcome {
    /// No opportunity needed URL matching; analytics was not queried.
    Skipped,
    Completed { source: RowSource },
    /// Analytics or suggestion lookup failed; only always-included opportunities remain.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct TopPaidReport {
    pub opportunities: Vec<TopPaidOpportunity>,
    pub matching: MatchingOutcome,
}

#[derive(Debug, Error)]
enum MatchStepError {
    #[error("paid traffic query failed: {0}")]
    Analytics(#[from] AnalyticsError),
    #[error("suggestion lookup failed: {0}")]
    Suggestions(#[from] DataError),
}

/// NEW and IN_PROGRESS opportunities of a site, first occurrence wins.
pub async fn open_opportunities(
    repo: &dyn OpportunityRepository,
    site_id: Uuid,
) -> Result<Vec<Opportunity>, DataError> {
    let lists = try_join_all(
        OPEN_STATUSES
            .iter()
            .map(|status| repo.all_by_site_id_and_status(site_id, status)),
    )
    .await?;
    let mut seen = HashSet::new();
    Ok(lists
        .into_iter()
        .flatten()
        .filter(|o| seen.insert(o.id))
        .collect())
}

pub struct TopPaidPipeline {
    opportunities: Arc<dyn OpportunityRepository>,
    suggestions: Arc<dyn SuggestionRepository>,
    analytics: CachedAnalytics,
    config: MatcherConfig,
}

impl TopPaidPipeline {
    pub fn new(
        opportunities: Arc<dyn OpportunityRepository>,
        suggestions: Arc<dyn SuggestionRepository>,
        analytics: CachedAnalytics,
        config: MatcherConfig,
    ) -> Self {
        Self {
            opportunities,
            suggestions,
            analytics,
            config,
        }
    }

    /// Rank the site's paid-traffic-relevant opportunities for one window.
    ///
    /// Only the opportunity listing can fail the run; analytics and suggestion
    /// failures during matching degrade to the always-included set.
    pub async fn run(&self, site: &Site, window: &TimeWindow) -> Result<TopPaidReport, DataError> {
        let opportunities = open_opportunities(self.opportunities.as_ref(), site.id).await?;

        let classified = opportunities
            .iter()
            .map(|opportunity| {
                let category = classify(opportunity);
                debug!(
                    opportunity_id = %opportunity.id,
                    ?category,
                    excluded = category.is_excluded(),
                    "classified opportunity"
                );
                (opportunity, category)
            })
            .collect::<Vec<_>>();

        let memo = SuggestionMemo::new(self.suggestions.clone(), STATUS_NEW);
        let needs_matching = classified
            .iter()
            .filter(|(_, category)| category.needs_url_matching())
            .copied()
            .collect::<Vec<_>>();

        let (index, mut matched, outcome) = if needs_matching.is_empty() {
            (None, HashMap::new(), MatchingOutcome::Skipped)
        } else {
            match self.match_paid_traffic(site, window, &needs_matching, &memo).await {
                Ok((index, matched, source)) => (Some(index), matched, MatchingOutcome::Completed { source }),
                Err(err) => {
                    warn!(site_id = %site.id, %window, error = %err, "skipping cwv/forms matching");
                    (None, HashMap::new(), MatchingOutcome::Degraded)
                }
            }
        };

        let paid_media = classified
            .iter()
            .filter(|(_, category)| *category == Category::PaidMedia)
            .map(|(opportunity, _)| *opportunity)
            .collect::<Vec<_>>();
        let memo = &memo;
        let index = index.as_ref();
        let mut paid_media_summaries = join_all(paid_media.iter().map(|&opportunity| async move {
            let summary = match memo.get(opportunity.id).await {
                Ok(suggestions) => {
                    let sources = candidate_sources(opportunity, Category::PaidMedia, &suggestions);
                    summarize_unconditional(&sources, index)
                }
                Err(err) => {
                    warn!(opportunity_id = %opportunity.id, error = %err, "failed to load suggestions for paid media opportunity");
                    MatchedResult {
                        page_views: 0,
                        urls: Vec::new(),
                    }
                }
            };
            (opportunity.id, summary)
        }))
        .await
        .into_iter()
        .collect::<HashMap<_, _>>();

        let mut ranked = Vec::new();
        for (opportunity, category) in &classified {
            let result = match category {
                Category::PaidMedia => paid_media_summaries.remove(&opportunity.id),
                Category::Cwv | Category::Forms => matched.remove(&opportunity.id),
                Category::Excluded(_) => None,
            };
            if let Some(result) = result {
                ranked.push((opportunity.value_metric(), TopPaidOpportunity::new(opportunity, result)));
            }
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        info!(
            site_id = %site.id,
            %window,
            candidates = classified.len(),
            results = ranked.len(),
            ?outcome,
            "top paid opportunities ranked"
        );

        Ok(TopPaidReport {
            opportunities: ranked.into_iter().map(|(_, dto)| dto).collect(),
            matching: outcome,
        })
    }

    async fn match_paid_traffic(
        &self,
        site: &Site,
        window: &TimeWindow,
        candidates: &[(&Opportunity, Category)],
        memo: &SuggestionMemo,
    ) -> Result<(TrafficIndex, HashMap<Uuid, MatchedResult>, RowSource), MatchStepError> {
        let query = build_paid_traffic_query(&self.config.analytics_table, site.id, window, self.config.variant);
        let key = cache_key(site.id, window, self.config.variant);
        let fetched = self.analytics.rows(&key, &query).await?;

        let index = TrafficIndex::build(&fetched.rows, &site.base_url);
        debug!(rows = fetched.rows.len(), indexed = index.len(), source = ?fetched.source, "paid traffic index built");

        let matched = match_opportunities(candidates, memo, &index, &self.config.thresholds).await?;
        Ok((index, matched, fetched.source))
    }
}

/// Wired collaborators shared by the web and CLI entry points.
#[derive(Clone)]
pub struct Services {
    pub sites: Arc<dyn SiteRepository>,
    pub opportunities: Arc<dyn OpportunityRepository>,
    pub suggestions: Arc<dyn SuggestionRepository>,
    pub analytics: CachedAnalytics,
    pub matcher: MatcherConfig,
}

impl Services {
    /// Fixture-backed services with no cache.
    pub fn from_fixture(data: SiteDataFixture, rows: Vec<RawPaidTrafficRow>, matcher: MatcherConfig) -> Self {
        let store = Arc::new(FixtureDataStore::new(data));
        Self {
            sites: store.clone(),
            opportunities: store.clone(),
            suggestions: store,
            analytics: CachedAnalytics::new(Arc::new(FixtureAnalyticsClient::new(rows)), None),
            matcher,
        }
    }

    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let matcher = MatcherConfig::from_settings_logged(&config.matcher);

        let (sites, opportunities, suggestions): (
            Arc<dyn SiteRepository>,
            Arc<dyn OpportunityRepository>,
            Arc<dyn SuggestionRepository>,
        ) = match &config.database_url {
            Some(url) => {
                let store = Arc::new(PgDataStore::connect(url).await?);
                info!("using postgres data store");
                (store.clone(), store.clone(), store)
            }
            None => {
                let store = Arc::new(
                    FixtureDataStore::load(&config.fixtures_path)
                        .with_context(|| format!("loading fixtures from {}", config.fixtures_path.display()))?,
                );
                info!(path = %config.fixtures_path.display(), "using fixture data store");
                (store.clone(), store.clone(), store)
            }
        };

        let analytics: Arc<dyn AnalyticsClient> = match (&config.analytics_endpoint, &config.analytics_fixture) {
            (Some(endpoint), _) => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?;
                info!(endpoint = %endpoint, "using http analytics client");
                Arc::new(HttpAnalyticsClient::new(fetcher, endpoint.clone()))
            }
            (None, Some(path)) => Arc::new(
                FixtureAnalyticsClient::load(path)
                    .with_context(|| format!("loading analytics fixture {}", path.display()))?,
            ),
            (None, None) => {
                warn!("no analytics endpoint or fixture configured; paid traffic queries return no rows");
                Arc::new(FixtureAnalyticsClient::default())
            }
        };

        let cache = config.cache_bucket.as_deref().map(|bucket| {
            let store = FsCacheStore::new(config.cache_root.clone(), bucket);
            info!(root = %store.root().display(), bucket, "paid traffic cache enabled");
            Arc::new(store) as Arc<dyn CacheStore>
        });

        Ok(Self {
            sites,
            opportunities,
            suggestions,
            analytics: CachedAnalytics::new(analytics, cache),
            matcher,
        })
    }

    pub fn pipeline(&self) -> TopPaidPipeline {
        TopPaidPipeline::new(
            self.opportunities.clone(),
            self.suggestions.clone(),
            self.analytics.clone(),
            self.matcher.clone(),
        )
    }
}

/// CLI entry point: resolve the window, look the site up and run the pipeline.
pub async fn top_paid_from_env(
    site_id: Uuid,
    year: Option<i64>,
    week: Option<i64>,
    month: Option<i64>,
) -> Result<Vec<TopPaidOpportunity>> {
    let window = TimeWindow::resolve(year, week, month, Utc::now().date_naive())?;
    let services = Services::from_config(&ServiceConfig::from_env()).await?;
    let Some(site) = services.sites.find_by_id(site_id).await? else {
        bail!("site {site_id} not found");
    };
    let report = services.pipeline().run(&site, &window).await?;
    Ok(report.opportunities)
}
