//! Paginated execution of one batch.

use metric_api_client::{GetMetricDataPage, GetMetricDataRequest, MetricsApi};
use observability_deps::tracing::*;
use snafu::Snafu;
use tokio::select;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("query execution was cancelled"))]
    Cancelled,

    /// `pages` holds every page fetched before the failing call.
    #[snafu(display("failed to fetch metric data after {} page(s): {source}", pages.len()))]
    Fetch {
        source: metric_api_client::Error,
        pages: Vec<GetMetricDataPage>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fetch every page for `request`, following continuation tokens until the
/// API returns none.
///
/// Pages are returned in the order they were received. The first failing call
/// ends execution. Cancellation abandons the in-flight call.
pub async fn execute(
    client: &dyn MetricsApi,
    mut request: GetMetricDataRequest,
    cancel: &CancellationToken,
) -> Result<Vec<GetMetricDataPage>> {
    let mut pages = vec![];

    loop {
        let page = select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            page = client.get_metric_data(request.clone()) => page,
        };

        let mut page = match page {
            Ok(page) => page,
            Err(source) => return Err(Error::Fetch { source, pages }),
        };

        let next_token = page.next_token.take();
        trace!(
            n_results = page.metric_data_results.len(),
            page = pages.len(),
            "fetched metric data page"
        );
        pages.push(page);

        match next_token {
            Some(token) => request.next_token = Some(token),
            None => return Ok(pages),
        }
    }
}
