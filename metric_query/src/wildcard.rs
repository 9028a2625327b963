//! Resolution of wildcarded dimensions to the values the metric actually reports.

use std::{collections::HashMap, num::NonZeroUsize, time::Duration};

use metric_api_client::{DimensionFilter, ListMetricsRequest, MetricsApi};
use observability_deps::tracing::*;
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::Instant;

use crate::query::ClassifiedQuery;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("query {ref_id}: failed to discover values of dimension '{dimension}': {source}"))]
    Discovery {
        ref_id: String,
        dimension: String,
        source: metric_api_client::Error,
    },

    #[snafu(display(
        "query {ref_id}: no client available to discover values of dimension '{dimension}'"
    ))]
    NoClient { ref_id: String, dimension: String },
}

impl Error {
    pub fn ref_id(&self) -> &str {
        match self {
            Self::Discovery { ref_id, .. } | Self::NoClient { ref_id, .. } => ref_id,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies one wildcarded dimension of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub region: String,
    pub account_id: Option<String>,
    pub namespace: String,
    pub metric_name: String,
    pub dimension_key: String,
}

#[derive(Debug)]
struct Entry {
    values: Vec<String>,
    expires_at: Instant,
}

/// TTL cache of resolved wildcard dimension values.
///
/// Shared by all region workers of a service. Only non-empty resolutions are
/// ever stored, so a failed or empty lookup never hides values that appear
/// later.
#[derive(Debug)]
pub struct WildcardCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl WildcardCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Default::default(),
        }
    }

    /// Cached values for `key`, if present and not expired.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.values.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `values` for `key`. Empty lists are ignored.
    pub fn insert(&self, key: CacheKey, values: Vec<String>) {
        if values.is_empty() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        self.entries.lock().insert(key, Entry { values, expires_at });
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolve the wildcarded, single-valued dimensions of `queries`.
///
/// Returns one copy per input query; inputs are never modified. Only inferred
/// search expressions that do not require an exact schema match are resolved,
/// all other queries are returned as they are. `client` may be `None` when
/// every lookup is expected to be served from `cache`.
pub async fn resolve_wildcards(
    region: &str,
    client: Option<&dyn MetricsApi>,
    queries: &[ClassifiedQuery],
    cache: &WildcardCache,
    page_limit: NonZeroUsize,
) -> Result<Vec<ClassifiedQuery>> {
    let mut resolved = Vec::with_capacity(queries.len());

    for classified in queries {
        let query = classified.query();
        if !classified.is_inferred_search_expression() || query.match_exact {
            resolved.push(classified.clone());
            continue;
        }

        let mut dimensions = classified.resolved_dimensions().clone();
        for dimension_key in query.wildcard_dimensions() {
            let key = CacheKey {
                region: region.to_owned(),
                account_id: query.account_id.clone(),
                namespace: query.namespace.clone(),
                metric_name: query.metric_name.clone(),
                dimension_key: dimension_key.to_owned(),
            };

            if let Some(values) = cache.get(&key) {
                debug!(region, ref_id = %query.ref_id, dimension_key, "wildcard cache hit");
                dimensions.insert(key.dimension_key, values);
                continue;
            }

            let client = client.context(NoClientSnafu {
                ref_id: &query.ref_id,
                dimension: dimension_key,
            })?;
            let values = discover_values(client, &key, page_limit)
                .await
                .context(DiscoverySnafu {
                    ref_id: &query.ref_id,
                    dimension: dimension_key,
                })?;

            debug!(
                region,
                ref_id = %query.ref_id,
                dimension_key,
                n_values = values.len(),
                "discovered wildcard dimension values"
            );

            if !values.is_empty() {
                dimensions.insert(key.dimension_key.clone(), values.clone());
                cache.insert(key, values);
            }
        }

        resolved.push(classified.with_resolved_dimensions(dimensions));
    }

    Ok(resolved)
}

/// Collect the distinct values of `key.dimension_key`, sorted, over at most
/// `page_limit` discovery pages.
async fn discover_values(
    client: &dyn MetricsApi,
    key: &CacheKey,
    page_limit: NonZeroUsize,
) -> metric_api_client::Result<Vec<String>> {
    let mut values = vec![];
    let mut next_token = None;

    for _ in 0..page_limit.get() {
        let page = client
            .list_metrics(ListMetricsRequest {
                namespace: key.namespace.clone(),
                metric_name: key.metric_name.clone(),
                dimensions: vec![DimensionFilter {
                    name: key.dimension_key.clone(),
                    value: None,
                }],
                owning_account: key.account_id.clone(),
                next_token,
            })
            .await?;

        values.extend(
            page.metrics
                .into_iter()
                .flat_map(|m| m.dimensions)
                .filter(|d| d.name == key.dimension_key)
                .map(|d| d.value),
        );

        next_token = page.next_token;
        if next_token.is_none() {
            break;
        }
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}
