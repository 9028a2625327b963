//! Runs a request: one worker per region, fanned back into a single response.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use chrono::Utc;
use clap_blocks::metric_query::MetricQueryConfig;
use futures::FutureExt;
use metric_api_client::{ClientProvider, MetricsApi};
use observability_deps::tracing::*;
use snafu::{ResultExt, Snafu};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    executor::{self, execute},
    planner::{self, expression_tokens, plan, PlannerLimits},
    query::{self, ensure_unique_ids, ClassifiedQuery, Query, QueryRow, TimeRange},
    reconcile::{self, reconcile},
    response::{QueryResponse, Series},
    wildcard::{self, resolve_wildcards, WildcardCache},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Validation { source: query::Error },

    #[snafu(display("{source}"))]
    Planning { source: planner::Error },

    #[snafu(display("{source}"))]
    Wildcard { source: wildcard::Error },

    #[snafu(display("{source}"))]
    Data { source: reconcile::Error },

    #[snafu(display("failed to fetch metric data in region {region}: {source}"))]
    Fetch {
        region: String,
        source: metric_api_client::Error,
    },

    #[snafu(display("no metrics client for region {region}: {source}"))]
    Client {
        region: String,
        source: metric_api_client::Error,
    },

    #[snafu(display("query worker for region {region} failed unexpectedly"))]
    WorkerPanicked { region: String },

    #[snafu(display("query execution was cancelled"))]
    Cancelled,
}

impl Error {
    /// The editor row this error is about, for errors raised on behalf of one.
    pub fn ref_id(&self) -> Option<&str> {
        match self {
            Self::Validation { source } => source.ref_id(),
            Self::Planning { source } => Some(source.ref_id()),
            Self::Wildcard { source } => Some(source.ref_id()),
            Self::Data { source } => Some(source.ref_id()),
            Self::Fetch { .. }
            | Self::Client { .. }
            | Self::WorkerPanicked { .. }
            | Self::Cancelled => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Executes metric query requests against the regional metrics API clients.
#[derive(Debug, Clone)]
pub struct QueryService {
    provider: Arc<dyn ClientProvider>,
    config: MetricQueryConfig,
    default_region: String,
    cache: Arc<WildcardCache>,
}

impl QueryService {
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        config: MetricQueryConfig,
        default_region: impl Into<String>,
    ) -> Self {
        let cache = Arc::new(WildcardCache::new(config.wildcard_cache_ttl));
        Self {
            provider,
            config,
            default_region: default_region.into(),
            cache,
        }
    }

    /// Share `cache` instead of the service's own wildcard cache.
    pub fn with_cache(self, cache: Arc<WildcardCache>) -> Self {
        Self { cache, ..self }
    }

    pub fn cache(&self) -> &Arc<WildcardCache> {
        &self.cache
    }

    /// Run `rows` over `range`.
    ///
    /// Failures tied to single rows (validation, planning, remote calls, data
    /// errors, a failing region) are reported per refId in the response.
    /// Duplicate query ids fail the whole request, as does cancellation.
    pub async fn query(
        &self,
        range: TimeRange,
        rows: Vec<QueryRow>,
        cancel: CancellationToken,
    ) -> Result<QueryResponse> {
        let mut response = QueryResponse::default();
        let mut queries = vec![];
        let now = Utc::now();

        for row in rows {
            let ref_id = row.ref_id.clone();
            response.results.entry(ref_id.clone()).or_default();
            match row.into_queries(&range, &self.default_region, now) {
                Ok(expanded) => queries.extend(expanded),
                Err(source) => {
                    debug!(%ref_id, %source, "rejected query row");
                    response.fail(&ref_id, Arc::new(Error::Validation { source }));
                }
            }
        }
        ensure_unique_ids(&queries).context(ValidationSnafu)?;

        let mut by_region: BTreeMap<String, Vec<Query>> = BTreeMap::new();
        for query in queries {
            by_region.entry(query.region.clone()).or_default().push(query);
        }

        let (tx, mut rx) = mpsc::channel(by_region.len().max(1));
        let mut pending = BTreeMap::new();
        for (region, queries) in by_region {
            let ref_ids = queries
                .iter()
                .map(|q| q.ref_id.clone())
                .collect::<BTreeSet<_>>();
            pending.insert(region.clone(), ref_ids);

            let worker = RegionWorker {
                region: region.clone(),
                provider: Arc::clone(&self.provider),
                cache: Arc::clone(&self.cache),
                limits: PlannerLimits::from(&self.config),
                discovery_page_limit: self.config.discovery_page_limit,
                range,
                cancel: cancel.clone(),
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(worker.run(queries))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| WorkerPanickedSnafu { region: &region }.fail());
                // the receiver only goes away once the request is abandoned
                let _ = tx.send((region, outcome)).await;
            });
        }
        drop(tx);

        let mut cancelled = false;
        while let Some((region, outcome)) = rx.recv().await {
            let ref_ids = pending.remove(&region).unwrap_or_default();
            match outcome {
                Ok(events) => {
                    for event in events {
                        event.apply(&mut response);
                    }
                }
                Err(Error::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!(%region, error = %e, "region worker failed");
                    let e = Arc::new(e);
                    for ref_id in ref_ids {
                        response.fail(&ref_id, Arc::clone(&e));
                    }
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // a worker that vanished without reporting
        for (region, ref_ids) in pending {
            warn!(%region, "region worker exited without a result");
            let e = Arc::new(Error::WorkerPanicked { region });
            for ref_id in ref_ids {
                response.fail(&ref_id, Arc::clone(&e));
            }
        }

        Ok(response)
    }
}

/// What a region worker found out about one refId.
#[derive(Debug)]
enum Event {
    Series { ref_id: String, series: Vec<Series> },
    Truncated { ref_id: String },
    Failed { ref_id: String, error: Arc<Error> },
}

impl Event {
    fn failed(ref_id: &str, error: Arc<Error>) -> Self {
        Self::Failed {
            ref_id: ref_id.to_owned(),
            error,
        }
    }

    fn apply(self, response: &mut QueryResponse) {
        match self {
            Self::Series { ref_id, series } => response.add_series(&ref_id, series),
            Self::Truncated { ref_id } => response.mark_truncated(&ref_id),
            Self::Failed { ref_id, error } => response.fail(&ref_id, error),
        }
    }
}

#[derive(Debug)]
struct RegionWorker {
    region: String,
    provider: Arc<dyn ClientProvider>,
    cache: Arc<WildcardCache>,
    limits: PlannerLimits,
    discovery_page_limit: NonZeroUsize,
    range: TimeRange,
    cancel: CancellationToken,
}

impl RegionWorker {
    /// Only cancellation makes this fail; everything else is reported per refId.
    async fn run(self, queries: Vec<Query>) -> Result<Vec<Event>> {
        let region = self.region.as_str();
        let mut events = vec![];

        let client = match self.provider.client(region) {
            Ok(client) => client,
            Err(source) => {
                warn!(region, %source, "no metrics client for region");
                let error = Arc::new(Error::Client {
                    region: region.to_owned(),
                    source,
                });
                let ref_ids = queries.iter().map(|q| q.ref_id.as_str()).collect::<BTreeSet<_>>();
                return Ok(ref_ids
                    .into_iter()
                    .map(|ref_id| Event::failed(ref_id, Arc::clone(&error)))
                    .collect());
            }
        };

        let classified = self
            .resolve(client.as_ref(), queries.into_iter().map(ClassifiedQuery::new), &mut events)
            .await?;

        let plan = plan(&self.range, classified, self.limits);
        for source in plan.rejected {
            warn!(region, %source, "rejected query during planning");
            let ref_id = source.ref_id().to_owned();
            events.push(Event::failed(&ref_id, Arc::new(Error::Planning { source })));
        }

        let n_batches = plan.batches.len();
        let mut emitted = HashSet::new();
        let mut n_series = 0;
        for batch in plan.batches {
            let pages = match execute(client.as_ref(), batch.request(&self.range), &self.cancel).await {
                Ok(pages) => pages,
                Err(executor::Error::Cancelled) => return Err(Error::Cancelled),
                Err(executor::Error::Fetch { source, pages }) => {
                    warn!(
                        region,
                        %source,
                        n_queries = batch.len(),
                        n_pages_fetched = pages.len(),
                        "failed to fetch metric data for batch"
                    );
                    let error = Arc::new(Error::Fetch {
                        region: region.to_owned(),
                        source,
                    });
                    events.extend(
                        batch
                            .queries()
                            .iter()
                            .filter(|q| q.query().return_data)
                            .map(|q| Event::failed(q.ref_id(), Arc::clone(&error))),
                    );
                    continue;
                }
            };

            for outcome in reconcile(batch.queries(), pages) {
                // queries shared by several isolation batches are reported once
                if !emitted.insert(outcome.query_id.clone()) {
                    continue;
                }

                if outcome.truncated {
                    warn!(region, ref_id = %outcome.ref_id, query_id = %outcome.query_id, "result set was truncated");
                    events.push(Event::Truncated {
                        ref_id: outcome.ref_id.clone(),
                    });
                }
                match outcome.series {
                    Ok(series) => {
                        n_series += series.len();
                        events.push(Event::Series {
                            ref_id: outcome.ref_id,
                            series,
                        });
                    }
                    Err(source) => {
                        warn!(region, %source, "query returned an in-band error");
                        events.push(Event::failed(
                            &outcome.ref_id,
                            Arc::new(Error::Data { source }),
                        ));
                    }
                }
            }
        }

        info!(region, n_batches, n_series, "region query complete");
        Ok(events)
    }

    /// Resolve wildcards query by query so a failed discovery only affects
    /// its own row. A query whose resolution failed is dropped unless a math
    /// expression of the same request references it.
    async fn resolve(
        &self,
        client: &dyn MetricsApi,
        queries: impl Iterator<Item = ClassifiedQuery>,
        events: &mut Vec<Event>,
    ) -> Result<Vec<ClassifiedQuery>> {
        let mut resolved = vec![];
        let mut failed = vec![];

        for query in queries {
            let resolution = select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                r = resolve_wildcards(
                    &self.region,
                    Some(client),
                    std::slice::from_ref(&query),
                    &self.cache,
                    self.discovery_page_limit,
                ) => r,
            };

            match resolution {
                Ok(r) => resolved.extend(r),
                Err(source) => {
                    warn!(region = %self.region, %source, "failed to resolve wildcard dimensions");
                    events.push(Event::failed(
                        query.ref_id(),
                        Arc::new(Error::Wildcard { source }),
                    ));
                    failed.push(query);
                }
            }
        }

        // the expression still needs its operand; the refId itself stays failed
        let referenced = resolved
            .iter()
            .filter(|q| q.is_math_expression())
            .flat_map(|q| expression_tokens(&q.query().expression))
            .map(str::to_owned)
            .collect::<HashSet<_>>();
        for query in failed {
            if referenced.contains(query.id()) {
                debug!(
                    region = %self.region,
                    query_id = %query.id(),
                    "sending unresolved query for dependent expression"
                );
                resolved.push(query);
            }
        }

        Ok(resolved)
    }
}
