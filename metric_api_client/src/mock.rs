//! In-memory [`MetricsApi`] for tests.
use std::{
    collections::{HashMap, VecDeque},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    ClientProvider, Error, GetMetricDataPage, GetMetricDataRequest, ListMetricsPage,
    ListMetricsRequest, Metric, MetricsApi, Result,
};

/// Computes the page returned for a data call.
pub type DataResponder =
    Arc<dyn Fn(&GetMetricDataRequest) -> Result<GetMetricDataPage> + Send + Sync>;

/// A scripted [`MetricsApi`] that records every request it receives.
///
/// Discovery calls are answered from a fixed list of metrics, filtered and
/// paged like the remote API does. Data calls are answered by a
/// [`DataResponder`] if one is set, otherwise by popping queued pages (an
/// empty page once the queue is drained).
pub struct MockMetricsApi {
    metrics: Vec<Metric>,
    page_size: usize,
    list_metrics_error: Option<Error>,
    data_pages: Mutex<VecDeque<Result<GetMetricDataPage>>>,
    data_responder: Option<DataResponder>,
    latency: Option<Duration>,
    list_metrics_requests: Mutex<Vec<ListMetricsRequest>>,
    data_requests: Mutex<Vec<GetMetricDataRequest>>,
}

impl Debug for MockMetricsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMetricsApi")
            .field("metrics", &self.metrics.len())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Default for MockMetricsApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMetricsApi {
    pub fn new() -> Self {
        Self {
            metrics: vec![],
            page_size: 500,
            list_metrics_error: None,
            data_pages: Default::default(),
            data_responder: None,
            latency: None,
            list_metrics_requests: Default::default(),
            data_requests: Default::default(),
        }
    }

    /// Metrics known to discovery calls.
    pub fn with_metrics(self, metrics: impl IntoIterator<Item = Metric>) -> Self {
        Self {
            metrics: metrics.into_iter().collect(),
            ..self
        }
    }

    /// Number of metrics per discovery page.
    pub fn with_page_size(self, page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..self
        }
    }

    /// Fail every discovery call with `error`.
    pub fn with_list_metrics_error(self, error: Error) -> Self {
        Self {
            list_metrics_error: Some(error),
            ..self
        }
    }

    /// Queue pages returned by consecutive data calls.
    pub fn with_data_pages(
        self,
        pages: impl IntoIterator<Item = Result<GetMetricDataPage>>,
    ) -> Self {
        self.data_pages.lock().extend(pages);
        self
    }

    /// Answer data calls with `responder` instead of the page queue.
    pub fn with_data_responder(
        self,
        responder: impl Fn(&GetMetricDataRequest) -> Result<GetMetricDataPage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            data_responder: Some(Arc::new(responder)),
            ..self
        }
    }

    /// Delay every call by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..self
        }
    }

    /// Discovery requests received so far.
    pub fn list_metrics_requests(&self) -> Vec<ListMetricsRequest> {
        self.list_metrics_requests.lock().clone()
    }

    /// Data requests received so far.
    pub fn data_requests(&self) -> Vec<GetMetricDataRequest> {
        self.data_requests.lock().clone()
    }

    async fn wait(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl MetricsApi for MockMetricsApi {
    async fn list_metrics(&self, request: ListMetricsRequest) -> Result<ListMetricsPage> {
        self.list_metrics_requests.lock().push(request.clone());
        self.wait().await;

        if let Some(e) = &self.list_metrics_error {
            return Err(e.clone());
        }

        let matching = self
            .metrics
            .iter()
            .filter(|m| m.namespace == request.namespace && m.metric_name == request.metric_name)
            .filter(|m| {
                request.dimensions.iter().all(|filter| {
                    m.dimensions.iter().any(|d| {
                        d.name == filter.name
                            && filter.value.as_ref().map_or(true, |v| v == &d.value)
                    })
                })
            })
            .collect::<Vec<_>>();

        let offset = match request.next_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::InvalidResponse(format!("unknown next token '{token}'")))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(matching.len());
        let metrics = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|m| (*m).clone())
            .collect();
        let next_token = (end < matching.len()).then(|| end.to_string());

        Ok(ListMetricsPage {
            metrics,
            next_token,
        })
    }

    async fn get_metric_data(&self, request: GetMetricDataRequest) -> Result<GetMetricDataPage> {
        self.data_requests.lock().push(request.clone());
        self.wait().await;

        if let Some(responder) = &self.data_responder {
            return responder(&request);
        }

        self.data_pages
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(GetMetricDataPage::default()))
    }
}

/// A [`ClientProvider`] handing out pre-registered clients.
#[derive(Debug, Default)]
pub struct MockClientProvider {
    clients: HashMap<String, Arc<dyn MetricsApi>>,
}

impl MockClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `client` for `region`.
    pub fn with_client(mut self, region: impl Into<String>, client: Arc<dyn MetricsApi>) -> Self {
        self.clients.insert(region.into(), client);
        self
    }
}

impl ClientProvider for MockClientProvider {
    fn client(&self, region: &str) -> Result<Arc<dyn MetricsApi>> {
        self.clients
            .get(region)
            .map(Arc::clone)
            .ok_or_else(|| Error::Unavailable(region.to_owned()))
    }
}
