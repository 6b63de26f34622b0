//! Paid-traffic matching: URL index, eligibility gate and per-opportunity aggregation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::try_join_all;
use paidops_adapters::{DataError, SuggestionRepository};
use paidops_core::{
    normalize_url, Category, Opportunity, PaidTrafficRow, RawPaidTrafficRow, Suggestion, ThresholdConfig,
    UrlSource,
};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;
use uuid::Uuid;

/// Per-request suggestion cache: each opportunity's suggestions are fetched at most once.
pub struct SuggestionMemo {
    repo: Arc<dyn SuggestionRepository>,
    status: String,
    cells: Mutex<HashMap<Uuid, Arc<OnceCell<Arc<Vec<Suggestion>>>>>>,
}

impl SuggestionMemo {
    pub fn new(repo: Arc<dyn SuggestionRepository>, status: impl Into<String>) -> Self {
        Self {
            repo,
            status: status.into(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, opportunity_id: Uuid) -> Result<Arc<Vec<Suggestion>>, DataError> {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(opportunity_id).or_default().clone()
        };
        let repo = &self.repo;
        let status = self.status.as_str();
        cell.get_or_try_init(move || async move {
            repo.all_by_opportunity_id_and_status(opportunity_id, status)
                .await
                .map(Arc::new)
        })
        .await
        .map(Arc::clone)
    }
}

/// Normalized-URL lookup over one request's paid-traffic rows.
#[derive(Debug, Default)]
pub struct TrafficIndex {
    rows: HashMap<String, PaidTrafficRow>,
}

impl TrafficIndex {
    /// When two rows share a key the one with more pageviews is kept.
    pub fn build(rows: &[RawPaidTrafficRow], base_url: &str) -> Self {
        let mut index: HashMap<String, PaidTrafficRow> = HashMap::with_capacity(rows.len());
        for row in rows.iter().filter_map(|r| r.resolve(base_url)) {
            let key = normalize_url(&row.url);
            match index.get(&key) {
                Some(existing) if existing.pageviews >= row.pageviews => {}
                _ => {
                    index.insert(key, row);
                }
            }
        }
        Self { rows: index }
    }

    pub fn lookup(&self, url: &str) -> Option<&PaidTrafficRow> {
        self.rows.get(&normalize_url(url))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Pageview floor for every category, plus a non-good CWV signal for cwv opportunities.
pub fn is_eligible(row: &PaidTrafficRow, category: Category, thresholds: &ThresholdConfig) -> bool {
    if row.pageviews < thresholds.paid_data_threshold {
        return false;
    }
    match category {
        Category::Cwv => thresholds.cwv.flags_poor_experience(&row.cwv),
        Category::Forms => true,
        Category::PaidMedia | Category::Excluded(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedResult {
    pub page_views: u64,
    /// Sorted by per-URL pageviews, descending.
    pub urls: Vec<String>,
}

/// Candidate URLs for an opportunity: suggestion URL fields, plus the form URL for forms.
pub fn candidate_sources(
    opportunity: &Opportunity,
    category: Category,
    suggestions: &[Suggestion],
) -> Vec<UrlSource> {
    let mut sources = suggestions
        .iter()
        .flat_map(|s| s.data.url_sources())
        .collect::<Vec<_>>();
    if category == Category::Forms {
        sources.extend(opportunity.data.form_source());
    }
    sources
}

/// Distinct candidates with their pageviews, ordered by pageviews descending.
///
/// Candidates that normalize to the same key count once; `keep` decides which
/// indexed rows count at all.
fn ranked_candidates(
    sources: &[UrlSource],
    index: Option<&TrafficIndex>,
    keep_unmatched: bool,
    keep: impl Fn(&PaidTrafficRow) -> bool,
) -> Vec<(String, u64)> {
    let mut seen = HashSet::new();
    let mut ranked = Vec::new();
    for source in sources {
        if !seen.insert(normalize_url(source.url())) {
            continue;
        }
        match index.and_then(|idx| idx.lookup(source.url())) {
            Some(row) if keep(row) => ranked.push((source.url().to_string(), row.pageviews)),
            Some(_) => {}
            None => {
                debug!(field = source.field_name(), url = source.url(), "candidate has no paid traffic row");
                if keep_unmatched {
                    ranked.push((source.url().to_string(), 0));
                }
            }
        }
    }
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

/// Saturates instead of overflowing; oversized counts already clamp to `u64::MAX`.
fn total_pageviews(ranked: &[(String, u64)]) -> u64 {
    ranked.iter().map(|(_, views)| *views).fold(0u64, u64::saturating_add)
}

/// Match one cwv/forms opportunity; `None` when no candidate passes the gate.
pub fn match_opportunity(
    sources: &[UrlSource],
    category: Category,
    index: &TrafficIndex,
    thresholds: &ThresholdConfig,
) -> Option<MatchedResult> {
    let ranked = ranked_candidates(sources, Some(index), false, |row| {
        is_eligible(row, category, thresholds)
    });
    if ranked.is_empty() {
        return None;
    }
    Some(MatchedResult {
        page_views: total_pageviews(&ranked),
        urls: ranked.into_iter().map(|(url, _)| url).collect(),
    })
}

/// URLs and pageviews for an always-included opportunity. No gate applies;
/// URLs without traffic data are kept after the ones that have it.
pub fn summarize_unconditional(sources: &[UrlSource], index: Option<&TrafficIndex>) -> MatchedResult {
    let ranked = ranked_candidates(sources, index, true, |_| true);
    MatchedResult {
        page_views: total_pageviews(&ranked),
        urls: ranked.into_iter().map(|(url, _)| url).collect(),
    }
}

/// Match every opportunity that needs URL matching, fetching suggestions concurrently.
pub async fn match_opportunities(
    candidates: &[(&Opportunity, Category)],
    memo: &SuggestionMemo,
    index: &TrafficIndex,
    thresholds: &ThresholdConfig,
) -> Result<HashMap<Uuid, MatchedResult>, DataError> {
    let suggestions = try_join_all(candidates.iter().map(|(opp, _)| memo.get(opp.id))).await?;

    let mut matched = HashMap::new();
    for ((opportunity, category), suggestions) in candidates.iter().zip(suggestions) {
        let sources = candidate_sources(opportunity, *category, &suggestions);
        if let Some(result) = match_opportunity(&sources, *category, index, thresholds) {
            matched.insert(opportunity.id, result);
        }
    }
    Ok(matched)
}
