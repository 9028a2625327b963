//! Client boundary for the remote metrics API.
//!
//! The remote API is reached through two calls, both paginated via an opaque
//! continuation token:
//!
//! * [`MetricsApi::list_metrics`] discovers which metrics (and dimension
//!   values) exist for a namespace.
//! * [`MetricsApi::get_metric_data`] evaluates up to a bounded number of
//!   queries per call and returns their series.
//!
//! Authentication, endpoint selection and retry policy are the concern of the
//! implementations; callers obtain a ready client per region from a
//! [`ClientProvider`].

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

pub mod error;
pub mod mock;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// A client for one region of the remote metrics API.
#[async_trait]
pub trait MetricsApi: Debug + Send + Sync + 'static {
    /// Fetch one page of metrics matching `request`.
    async fn list_metrics(&self, request: ListMetricsRequest) -> Result<ListMetricsPage>;

    /// Fetch one page of series for the queries in `request`.
    async fn get_metric_data(&self, request: GetMetricDataRequest) -> Result<GetMetricDataPage>;
}

/// Hands out ready-to-use clients, one per region.
pub trait ClientProvider: Debug + Send + Sync + 'static {
    /// Returns the client for `region`.
    fn client(&self, region: &str) -> Result<Arc<dyn MetricsApi>>;
}
