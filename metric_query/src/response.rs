//! The response handed back to the caller, keyed by editor row.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use metric_api_client::StatusCode;

use crate::service::Error;

/// One sample; `None` marks a gap in the data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// One reconciled series.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    /// Display name rendered from the query's alias.
    pub name: String,
    /// Id of the query that produced the series.
    pub query_id: String,
    /// Label assigned by the API; `None` for series reconstructed from the
    /// query shape that the API returned no data for.
    pub label: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub points: Vec<Point>,
    pub status: Option<StatusCode>,
    /// Non-fatal warnings.
    pub notices: Vec<String>,
}

/// Outcome for one editor row: its series, or the error that failed it.
#[derive(Debug, Clone, Default)]
pub struct RefIdResult {
    pub series: Vec<Series>,
    pub error: Option<Arc<Error>>,
    /// The API limited the result set of at least one query of the row.
    pub truncated: bool,
}

impl RefIdResult {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Results of one request, by refId.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub results: BTreeMap<String, RefIdResult>,
}

impl QueryResponse {
    pub fn get(&self, ref_id: &str) -> Option<&RefIdResult> {
        self.results.get(ref_id)
    }

    /// Record series for `ref_id`; dropped if the row already failed.
    pub(crate) fn add_series(&mut self, ref_id: &str, series: impl IntoIterator<Item = Series>) {
        let result = self.results.entry(ref_id.to_owned()).or_default();
        if !result.is_err() {
            result.series.extend(series);
        }
    }

    pub(crate) fn mark_truncated(&mut self, ref_id: &str) {
        self.results.entry(ref_id.to_owned()).or_default().truncated = true;
    }

    /// Fail `ref_id`, discarding its series. The first error wins.
    pub(crate) fn fail(&mut self, ref_id: &str, error: Arc<Error>) {
        let result = self.results.entry(ref_id.to_owned()).or_default();
        result.series.clear();
        if result.error.is_none() {
            result.error = Some(error);
        }
    }
}
