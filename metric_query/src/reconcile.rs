//! Mapping the raw pages of one batch back onto the queries that produced them.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use metric_api_client::{GetMetricDataPage, MessageData, StatusCode};
use observability_deps::tracing::*;
use snafu::Snafu;

use crate::{
    alias::{format_alias, ALIAS_PLACEHOLDER},
    query::{ClassifiedQuery, WILDCARD},
    response::{Point, Series},
};

/// Placeholders that never refer to a dimension.
const BUILT_IN_PLACEHOLDERS: [&str; 6] = ["region", "namespace", "metric", "stat", "period", "label"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("ArithmeticError in query {ref_id}: {message}"))]
    Arithmetic {
        ref_id: String,
        query_id: String,
        message: String,
    },
}

impl Error {
    pub fn ref_id(&self) -> &str {
        match self {
            Self::Arithmetic { ref_id, .. } => ref_id,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The reconciled outcome of one query.
#[derive(Debug)]
pub struct QueryOutcome {
    pub query_id: String,
    pub ref_id: String,
    pub series: Result<Vec<Series>>,
    /// The API limited the result set this query was part of.
    pub truncated: bool,
}

/// All fragments of one `(id, label)` pair, concatenated in arrival order.
#[derive(Debug)]
struct Merged {
    label: String,
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<f64>,
    status: StatusCode,
}

impl Merged {
    /// Whether later pages may still add to this entry.
    fn is_partial(&self) -> bool {
        self.status == StatusCode::PartialData
    }
}

#[derive(Debug, Default)]
struct ById {
    merged: Vec<Merged>,
    arithmetic_error: Option<String>,
    limit_messages: Vec<MessageData>,
}

impl ById {
    fn add(&mut self, label: String, timestamps: Vec<DateTime<Utc>>, values: Vec<f64>, status: StatusCode) {
        match self.merged.iter_mut().find(|m| m.label == label) {
            Some(merged) => {
                if !merged.is_partial() {
                    debug!(label, "appending to a series that was reported complete");
                }
                merged.timestamps.extend(timestamps);
                merged.values.extend(values);
                merged.status = status;
            }
            None => self.merged.push(Merged {
                label,
                timestamps,
                values,
                status,
            }),
        }
    }
}

/// Reconcile the pages returned for one batch with the batch's queries.
///
/// Returns one outcome per query that returns data, in batch order. Results
/// for ids that match no query of the batch are ignored.
pub fn reconcile(queries: &[ClassifiedQuery], pages: Vec<GetMetricDataPage>) -> Vec<QueryOutcome> {
    let known_ids = queries.iter().map(|q| q.id()).collect::<HashSet<_>>();
    let mut by_id: HashMap<String, ById> = HashMap::new();
    let mut batch_limit_messages = vec![];

    for page in pages {
        batch_limit_messages.extend(page.messages.into_iter().filter(|m| m.is_limit_exceeded()));

        for result in page.metric_data_results {
            if !known_ids.contains(result.id.as_str()) {
                debug!(id = %result.id, "ignoring result for unknown query id");
                continue;
            }

            let entry = by_id.entry(result.id).or_default();
            for message in result.messages {
                if message.is_arithmetic_error() {
                    if entry.arithmetic_error.is_none() {
                        entry.arithmetic_error = Some(message.value);
                    }
                } else if message.is_limit_exceeded() {
                    entry.limit_messages.push(message);
                }
            }
            entry.add(
                result.label.unwrap_or_default(),
                result.timestamps,
                result.values,
                result.status_code,
            );
        }
    }

    queries
        .iter()
        .filter(|q| q.query().return_data)
        .map(|query| {
            let entry = by_id.remove(query.id()).unwrap_or_default();
            let mut limit_messages = batch_limit_messages.clone();
            limit_messages.extend(entry.limit_messages);

            let series = match entry.arithmetic_error {
                Some(message) => ArithmeticSnafu {
                    ref_id: query.ref_id(),
                    query_id: query.id(),
                    message,
                }
                .fail(),
                None => Ok(build_series(query, entry.merged, &limit_messages)),
            };

            QueryOutcome {
                query_id: query.id().to_owned(),
                ref_id: query.ref_id().to_owned(),
                series,
                truncated: !limit_messages.is_empty(),
            }
        })
        .collect()
}

fn build_series(query: &ClassifiedQuery, merged: Vec<Merged>, limit_messages: &[MessageData]) -> Vec<Series> {
    let q = query.query();
    let limit_notices = limit_messages
        .iter()
        .map(|m| format!("the result set was limited by the metrics API ({}): {}", m.code, m.value))
        .collect::<Vec<_>>();

    let series = merged
        .into_iter()
        .map(|m| {
            let tags = tags_for_label(query, &m.label);
            let label = (!m.label.is_empty()).then_some(m.label);
            let mut notices = limit_notices.clone();
            if m.status != StatusCode::Complete {
                notices.push(format!(
                    "the metrics API reported status {} for this series, data may be incomplete",
                    m.status
                ));
            }

            Series {
                name: format_alias(query, &q.statistic, &tags, label.as_deref()),
                query_id: q.id.clone(),
                label,
                tags,
                points: fill_gaps(&m.timestamps, &m.values, q.period),
                status: Some(m.status),
                notices,
            }
        })
        .collect::<Vec<_>>();

    match alias_dimension_combinations(query) {
        Some(combinations) => reconstruct_labels(query, combinations, series),
        None => series,
    }
}

/// Dimension tags of a series, derived from its label.
fn tags_for_label(query: &ClassifiedQuery, label: &str) -> BTreeMap<String, String> {
    query
        .resolved_dimensions()
        .iter()
        .filter_map(|(key, values)| tag_value(values, label).map(|v| (key.clone(), v)))
        .collect()
}

fn tag_value(values: &[String], label: &str) -> Option<String> {
    if let [value] = values {
        if value != WILDCARD {
            return Some(value.clone());
        }
    }

    let concrete = || values.iter().filter(|v| *v != WILDCARD && !v.is_empty());
    let tokens = label.split_whitespace().collect::<Vec<_>>();

    if let Some(v) = concrete().find(|v| *v == label || tokens.contains(&v.as_str())) {
        return Some(v.clone());
    }
    if let Some(v) = concrete()
        .filter(|v| label.contains(v.as_str()))
        .max_by_key(|v| v.len())
    {
        return Some(v.clone());
    }
    if values.is_empty() || values.iter().any(|v| v == WILDCARD) {
        return (!label.is_empty()).then(|| label.to_owned());
    }
    None
}

/// Every combination of the values of the dimensions the alias refers to,
/// or `None` if the series cannot be derived from the query shape.
fn alias_dimension_combinations(query: &ClassifiedQuery) -> Option<Vec<Vec<(String, String)>>> {
    if !query.is_inferred_search_expression() {
        return None;
    }

    let dimensions = query.resolved_dimensions();
    let mut names = ALIAS_PLACEHOLDER
        .captures_iter(&query.query().alias)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|name| !BUILT_IN_PLACEHOLDERS.contains(name) && dimensions.contains_key(*name))
        .collect::<Vec<_>>();
    names.sort_unstable();
    names.dedup();
    if names.is_empty() {
        return None;
    }

    let mut combinations = vec![vec![]];
    for name in names {
        let values = &dimensions[name];
        if values.is_empty() || values.iter().any(|v| v == WILDCARD) {
            return None;
        }
        combinations = combinations
            .into_iter()
            .flat_map(|combination: Vec<(String, String)>| {
                values.iter().map(move |value| {
                    let mut next = combination.clone();
                    next.push((name.to_owned(), value.clone()));
                    next
                })
            })
            .collect();
    }
    Some(combinations)
}

/// Order `series` by alias dimension combination, emitting an empty series
/// for each combination the API returned nothing for. Series matching no
/// combination are kept at the end.
fn reconstruct_labels(
    query: &ClassifiedQuery,
    combinations: Vec<Vec<(String, String)>>,
    series: Vec<Series>,
) -> Vec<Series> {
    let q = query.query();
    let mut remaining = series.into_iter().map(Some).collect::<Vec<_>>();
    let mut out = vec![];

    for combination in combinations {
        let mut matched = false;
        for slot in &mut remaining {
            let is_match = slot.as_ref().is_some_and(|s| {
                combination
                    .iter()
                    .all(|(name, value)| s.tags.get(name) == Some(value))
            });
            if is_match {
                out.extend(slot.take());
                matched = true;
            }
        }

        if !matched {
            let mut tags = tags_for_label(query, "");
            tags.extend(combination);
            out.push(Series {
                name: format_alias(query, &q.statistic, &tags, None),
                query_id: q.id.clone(),
                label: None,
                tags,
                points: vec![],
                status: None,
                notices: vec![],
            });
        }
    }

    out.extend(remaining.into_iter().flatten());
    out
}

/// Pair up timestamps and values, inserting one null point after `period`
/// wherever consecutive timestamps are further apart than `period`.
fn fill_gaps(timestamps: &[DateTime<Utc>], values: &[f64], period: i64) -> Vec<Point> {
    let period = Duration::seconds(period);
    let mut points = Vec::with_capacity(timestamps.len());
    let mut previous: Option<DateTime<Utc>> = None;

    for (&timestamp, &value) in timestamps.iter().zip(values) {
        if let Some(previous) = previous {
            if period > Duration::zero() && timestamp - previous > period {
                points.push(Point {
                    timestamp: previous + period,
                    value: None,
                });
            }
        }
        points.push(Point {
            timestamp,
            value: Some(value),
        });
        previous = Some(timestamp);
    }

    points
}
