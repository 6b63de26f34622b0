//! JSON HTTP API over the top-paid pipeline and the opportunity data store.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path as AxumPath, Query, State},
    http::request::Parts,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use paidops_core::{Opportunity, Site, Suggestion};
use paidops_engine::{open_opportunities, ServiceConfig, Services, TimeWindow, TopPaidOpportunity};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

mod error;

pub use error::ApiError;

pub const CRATE_NAME: &str = "paidops-web";

pub const ORGANIZATION_IDS_HEADER: &str = "x-organization-ids";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

/// Caller identity forwarded by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub organization_ids: Vec<Uuid>,
    pub admin: bool,
}

impl Caller {
    pub fn can_access(&self, site: &Site) -> bool {
        self.admin || self.organization_ids.contains(&site.organization_id)
    }
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| -> Result<Option<String>, ApiError> {
            parts
                .headers
                .get(name)
                .map(|value| {
                    value
                        .to_str()
                        .map(str::to_string)
                        .map_err(|_| ApiError::BadRequest(format!("{name} header is not valid text")))
                })
                .transpose()
        };

        let organization_ids = header(ORGANIZATION_IDS_HEADER)?
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                id.parse::<Uuid>()
                    .map_err(|_| ApiError::BadRequest(format!("invalid organization id {id:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let admin = header(CALLER_ROLE_HEADER)?
            .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));

        Ok(Self {
            organization_ids,
            admin,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct TopPaidQuery {
    year: Option<String>,
    week: Option<String>,
    month: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sites/{site_id}/opportunities", get(list_opportunities_handler))
        .route("/sites/{site_id}/opportunities/top-paid", get(top_paid_handler))
        .route("/sites/{site_id}/opportunities/{opportunity_id}", get(opportunity_handler))
        .route(
            "/sites/{site_id}/opportunities/{opportunity_id}/suggestions",
            get(suggestions_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    let services = Services::from_config(&config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "paidops web listening");
    axum::serve(listener, app(AppState::new(services))).await?;
    Ok(())
}

async fn health_handler() -> Json<JsonValue> {
    Json(json!({ "status": "ok" }))
}

fn parse_uuid(name: &str, raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("{name} must be a valid UUID")))
}

fn parse_int_param(name: &str, raw: Option<&str>) -> Result<Option<i64>, ApiError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("{name} must be an integer"))),
    }
}

/// Look the site up and check the caller may read it.
async fn authorized_site(state: &AppState, caller: &Caller, site_id: Uuid) -> Result<Site, ApiError> {
    let site = state
        .services
        .sites
        .find_by_id(site_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Site not found".into()))?;
    if !caller.can_access(&site) {
        return Err(ApiError::Forbidden(format!("site {site_id}")));
    }
    Ok(site)
}

async fn site_opportunity(state: &AppState, site: &Site, opportunity_id: Uuid) -> Result<Opportunity, ApiError> {
    state
        .services
        .opportunities
        .find_by_id(opportunity_id)
        .await?
        .filter(|o| o.site_id == site.id)
        .ok_or_else(|| ApiError::NotFound("Opportunity not found".into()))
}

async fn top_paid_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(site_id): AxumPath<String>,
    Query(query): Query<TopPaidQuery>,
    caller: Caller,
) -> Result<Json<Vec<TopPaidOpportunity>>, ApiError> {
    let site_id = parse_uuid("siteId", &site_id)?;
    let window = TimeWindow::resolve(
        parse_int_param("year", query.year.as_deref())?,
        parse_int_param("week", query.week.as_deref())?,
        parse_int_param("month", query.month.as_deref())?,
        Utc::now().date_naive(),
    )?;

    let site = authorized_site(&state, &caller, site_id).await?;
    let report = state.services.pipeline().run(&site, &window).await?;
    Ok(Json(report.opportunities))
}

async fn list_opportunities_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(site_id): AxumPath<String>,
    caller: Caller,
) -> Result<Json<Vec<Opportunity>>, ApiError> {
    let site_id = parse_uuid("siteId", &site_id)?;
    let site = authorized_site(&state, &caller, site_id).await?;
    let opportunities = open_opportunities(state.services.opportunities.as_ref(), site.id).await?;
    Ok(Json(opportunities))
}

async fn opportunity_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((site_id, opportunity_id)): AxumPath<(String, String)>,
    caller: Caller,
) -> Result<Json<Opportunity>, ApiError> {
    let site_id = parse_uuid("siteId", &site_id)?;
    let opportunity_id = parse_uuid("opportunityId", &opportunity_id)?;
    let site = authorized_site(&state, &caller, site_id).await?;
    Ok(Json(site_opportunity(&state, &site, opportunity_id).await?))
}

async fn suggestions_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((site_id, opportunity_id)): AxumPath<(String, String)>,
    caller: Caller,
) -> Result<Json<Vec<Suggestion>>, ApiError> {
    let site_id = parse_uuid("siteId", &site_id)?;
    let opportunity_id = parse_uuid("opportunityId", &opportunity_id)?;
    let site = authorized_site(&state, &caller, site_id).await?;
    let opportunity = site_opportunity(&state, &site, opportunity_id).await?;
    let suggestions = state
        .services
        .suggestions
        .all_by_opportunity_id(opportunity.id)
        .await?;
    Ok(Json(suggestions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use paidops_adapters::{FixtureAnalyticsClient, FixtureDataStore, SiteDataFixture};
    use paidops_core::RawPaidTrafficRow;
    use paidops_engine::{MatcherConfig, MatcherSettings};
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    const SITE: &str = "11111111-1111-4111-8111-111111111111";
    const ORG: &str = "99999999-9999-4999-8999-999999999999";
    const CWV_OPP: &str = "22222222-2222-4222-8222-222222222222";
    const OTHER_SITE_OPP: &str = "88888888-8888-4888-8888-888888888888";

    fn fixture() -> SiteDataFixture {
        serde_json::from_value(json!({
            "sites": [
                { "id": SITE, "baseUrl": "https://www.example.com", "organizationId": ORG },
                {
                    "id": "77777777-7777-4777-8777-777777777777",
                    "baseUrl": "https://other.test",
                    "organizationId": "66666666-6666-4666-8666-666666666666"
                }
            ],
            "opportunities": [
                {
                    "id": CWV_OPP, "siteId": SITE, "title": "Improve LCP on paid pages",
                    "description": "Slow landing pages", "type": "cwv", "status": "NEW",
                    "data": { "projectedTrafficValue": 5000 }
                },
                {
                    "id": "33333333-3333-4333-8333-333333333333", "siteId": SITE, "title": "Consent banner",
                    "description": "Banner hides content", "type": "consent-banner", "status": "IN_PROGRESS",
                    "data": { "projectedTrafficValue": 3000 }
                },
                {
                    "id": "44444444-4444-4444-8444-444444444444", "siteId": SITE, "title": "Campaign pages",
                    "description": "Paid campaign", "type": "generic", "status": "NEW", "tags": ["paid media"],
                    "data": { "projectedTrafficValue": 1000 }
                },
                {
                    "id": "55555555-5555-4555-8555-555555555555", "siteId": SITE, "title": "Weekly report",
                    "description": "Summary", "type": "consent-banner", "status": "NEW",
                    "data": { "projectedTrafficValue": 9000 }
                },
                {
                    "id": OTHER_SITE_OPP, "siteId": "77777777-7777-4777-8777-777777777777",
                    "title": "Other site", "description": "d", "type": "cwv", "status": "NEW",
                    "data": { "projectedTrafficValue": 1 }
                }
            ],
            "suggestions": [
                {
                    "id": "a1111111-1111-4111-8111-111111111111", "opportunityId": CWV_OPP,
                    "status": "NEW", "rank": 1, "data": { "url": "https://example.com/a" }
                },
                {
                    "id": "a2222222-2222-4222-8222-222222222222", "opportunityId": CWV_OPP,
                    "status": "NEW", "rank": 2, "data": { "url_from": "https://example.com/b/" }
                },
                {
                    "id": "a3333333-3333-4333-8333-333333333333", "opportunityId": CWV_OPP,
                    "status": "OUTDATED", "rank": 3, "data": { "url": "https://example.com/old" }
                }
            ]
        }))
        .unwrap()
    }

    fn rows() -> Vec<RawPaidTrafficRow> {
        serde_json::from_value(json!([
            { "path": "/a", "pageviews": "3000", "lcp_score": "poor" },
            { "path": "/b", "pageviews": "2000", "inp_score": "poor" },
            { "path": "/c", "pageviews": "8000", "lcp_score": "good" }
        ]))
        .unwrap()
    }

    fn test_app(matcher: MatcherConfig) -> Router {
        app(AppState::new(Services::from_fixture(fixture(), rows(), matcher)))
    }

    async fn get_json(app: Router, uri: &str, organizations: Option<&str>) -> (StatusCode, JsonValue) {
        let mut request = Request::builder().uri(uri);
        if let Some(orgs) = organizations {
            request = request.header(ORGANIZATION_IDS_HEADER, orgs);
        }
        let resp = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_json(test_app(MatcherConfig::default()), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn top_paid_ranks_matched_and_paid_media_opportunities() {
        let uri = format!("/sites/{SITE}/opportunities/top-paid?year=2025&week=7");
        let (status, body) = get_json(test_app(MatcherConfig::default()), &uri, Some(ORG)).await;
        assert_eq!(status, StatusCode::OK);

        let items = body.as_array().unwrap();
        let titles = items.iter().map(|o| o["title"].as_str().unwrap()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Improve LCP on paid pages", "Consent banner", "Campaign pages"]);
        assert_eq!(items[0]["pageViews"], json!(5000));
        assert_eq!(items[0]["urls"], json!(["https://example.com/a", "https://example.com/b/"]));
        assert_eq!(items[0]["opportunityId"], json!(CWV_OPP));
        assert_eq!(items[0]["system_type"], json!("cwv"));
        assert_eq!(items[1]["status"], json!("IN_PROGRESS"));
    }

    #[tokio::test]
    async fn invalid_input_is_a_bad_request() {
        for uri in [
            "/sites/not-a-uuid/opportunities/top-paid".to_string(),
            format!("/sites/{SITE}/opportunities/top-paid?week=54"),
            format!("/sites/{SITE}/opportunities/top-paid?month=13"),
            format!("/sites/{SITE}/opportunities/top-paid?year=abc"),
            format!("/sites/{SITE}/opportunities/nope"),
        ] {
            let (status, body) = get_json(test_app(MatcherConfig::default()), &uri, Some(ORG)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["code"], "bad_request");
        }
    }

    #[tokio::test]
    async fn unknown_site_is_not_found() {
        let uri = format!("/sites/{}/opportunities/top-paid", Uuid::new_v4());
        let (status, body) = get_json(test_app(MatcherConfig::default()), &uri, Some(ORG)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Site not found");
    }

    #[tokio::test]
    async fn callers_outside_the_organization_are_forbidden() {
        let uri = format!("/sites/{SITE}/opportunities/top-paid");
        let (status, body) = get_json(test_app(MatcherConfig::default()), &uri, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "forbidden");

        let other = Uuid::new_v4().to_string();
        let (status, _) = get_json(test_app(MatcherConfig::default()), &uri, Some(&other)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let admin = Request::builder()
            .uri(&uri)
            .header(CALLER_ROLE_HEADER, "admin")
            .body(Body::empty())
            .unwrap();
        let resp = test_app(MatcherConfig::default()).oneshot(admin).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_cwv_thresholds_still_succeed_with_defaults() {
        let matcher = MatcherConfig::from_settings_logged(&MatcherSettings {
            cwv_thresholds: Some(json!("invalid-json{")),
            ..Default::default()
        });
        let uri = format!("/sites/{SITE}/opportunities/top-paid?year=2025&week=7");
        let (status, body) = get_json(test_app(matcher), &uri, Some(ORG)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn site_without_open_opportunities_returns_empty_list() {
        let mut data = fixture();
        data.opportunities.retain(|o| o.site_id.to_string() == SITE && o.opportunity_type == "cwv");
        let services = Services::from_fixture(data, Vec::new(), MatcherConfig::default());
        let uri = format!("/sites/{SITE}/opportunities/top-paid?year=2025&month=2");
        let (status, body) = get_json(app(AppState::new(services)), &uri, Some(ORG)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn opportunity_routes_respect_site_ownership() {
        let (status, body) = get_json(
            test_app(MatcherConfig::default()),
            &format!("/sites/{SITE}/opportunities"),
            Some(ORG),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 4);

        let (status, body) = get_json(
            test_app(MatcherConfig::default()),
            &format!("/sites/{SITE}/opportunities/{CWV_OPP}"),
            Some(ORG),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "cwv");

        let (status, _) = get_json(
            test_app(MatcherConfig::default()),
            &format!("/sites/{SITE}/opportunities/{OTHER_SITE_OPP}"),
            Some(ORG),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(
            test_app(MatcherConfig::default()),
            &format!("/sites/{SITE}/opportunities/{CWV_OPP}/suggestions"),
            Some(ORG),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap()
    }

    #[tokio::test]
    async fn bundled_fixtures_serve_top_paid() {
        let root = workspace_root();
        let store = Arc::new(FixtureDataStore::load(root.join("fixtures/site_data.json")).unwrap());
        let analytics = FixtureAnalyticsClient::load(root.join("fixtures/paid_traffic.json")).unwrap();
        let services = Services {
            sites: store.clone(),
            opportunities: store.clone(),
            suggestions: store,
            analytics: paidops_engine::CachedAnalytics::new(Arc::new(analytics), None),
            matcher: MatcherConfig::default(),
        };

        let uri = format!("/sites/{SITE}/opportunities/top-paid?year=2025&week=7");
        let (status, body) = get_json(app(AppState::new(services)), &uri, Some(ORG)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.as_array().unwrap().is_empty());
    }
}
