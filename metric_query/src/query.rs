//! The query model: editor rows, the queries they expand into, and their classification.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::{ensure, Snafu};

use crate::search_expression::build_search_expression;

/// Dimension value meaning "every value the metric reports".
pub const WILDCARD: &str = "*";

/// Substring that marks an expression as a user-written search call.
pub const SEARCH_MARKER: &str = "SEARCH(";

/// Statistic assumed for expression rows that do not name one.
pub const DEFAULT_STATISTIC: &str = "Average";

/// Candidate periods for rows that leave the period to be chosen automatically.
const AUTO_PERIODS: [i64; 6] = [60, 300, 900, 3600, 21600, 86400];

/// Number of samples an automatically chosen period aims to stay under.
const AUTO_PERIOD_TARGET_SAMPLES: i64 = 2000;

/// Minimum period, in seconds, at which data older than the given number of
/// days is still retained remotely. Oldest tier first.
const RETENTION_TIERS: [(i64, i64); 3] = [(455, 21600), (63, 3600), (15, 300)];

/// Macro in a search expression replaced by the automatically chosen period.
pub const PERIOD_AUTO_MACRO: &str = "$__period_auto";

static QUERY_ID_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-zA-Z0-9_]*$").unwrap());

/// Dimension name to the values it must match.
///
/// Iteration order carries no meaning; anything rendered from it sorts the keys first.
pub type Dimensions = HashMap<String, Vec<String>>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid time range: start {start} must be before end {end}"))]
    InvalidTimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[snafu(display("query {ref_id}: missing required field '{field}'"))]
    MissingField { ref_id: String, field: &'static str },

    #[snafu(display(
        "query {ref_id}: invalid query id '{id}', ids must start with a lowercase letter \
         and contain only letters, digits and underscores"
    ))]
    InvalidId { ref_id: String, id: String },

    #[snafu(display("query {ref_id}: period must be positive, got {period}"))]
    InvalidPeriod { ref_id: String, period: i64 },

    #[snafu(display("query {ref_id}: an expression can only be used with a single statistic"))]
    ExpressionStatistics { ref_id: String },

    #[snafu(display("query {ref_id}: duplicate query id '{id}'"))]
    DuplicateId { ref_id: String, id: String },
}

impl Error {
    /// The editor row this error belongs to, if any.
    pub fn ref_id(&self) -> Option<&str> {
        match self {
            Self::InvalidTimeRange { .. } => None,
            Self::MissingField { ref_id, .. }
            | Self::InvalidId { ref_id, .. }
            | Self::InvalidPeriod { ref_id, .. }
            | Self::ExpressionStatistics { ref_id }
            | Self::DuplicateId { ref_id, .. } => Some(ref_id),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A validated, non-empty time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    /// Create a range, failing unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        ensure!(start < end, InvalidTimeRangeSnafu { start, end });
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Length of the range in whole seconds.
    pub fn seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// The smallest standard period that keeps the range under the target
    /// sample count and at which data starting at `start` is still retained
    /// as of `now`.
    pub fn auto_period(&self, now: DateTime<Utc>) -> i64 {
        let age = now - self.start;
        let min_period = RETENTION_TIERS
            .iter()
            .find(|(days, _)| age > chrono::Duration::days(*days))
            .map_or(0, |(_, period)| *period);

        let samples = (self.seconds() + AUTO_PERIOD_TARGET_SAMPLES - 1) / AUTO_PERIOD_TARGET_SAMPLES;
        AUTO_PERIODS
            .iter()
            .copied()
            .filter(|p| *p >= min_period)
            .find(|p| samples <= *p)
            .unwrap_or(AUTO_PERIODS[AUTO_PERIODS.len() - 1])
    }
}

/// What the remote API is asked to evaluate for a row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryMode {
    /// Metric-stat, math or search expressions.
    #[default]
    Metric,
    /// An SQL-style "insights" query. The remote API limits how many of these
    /// may run concurrently within one call.
    Insights,
}

/// One editor row as decoded from the caller's request.
///
/// A row names any number of statistics and expands into one [`Query`] per statistic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRow {
    pub ref_id: String,
    /// Empty or `default` selects the service's default region.
    pub region: String,
    /// Caller-assigned query id; synthesized from `ref_id` when empty.
    pub id: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Dimensions,
    pub statistics: Vec<String>,
    /// Period in seconds, chosen from the time range when `None`.
    pub period: Option<i64>,
    pub expression: String,
    pub sql_expression: String,
    pub mode: QueryMode,
    pub match_exact: bool,
    pub alias: String,
    pub return_data: bool,
    pub high_resolution: bool,
    pub account_id: Option<String>,
}

impl QueryRow {
    /// Validate the row and expand it into one [`Query`] per statistic.
    ///
    /// `now` anchors the retention window used when choosing periods.
    pub fn into_queries(
        self,
        range: &TimeRange,
        default_region: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Query>> {
        let Self {
            ref_id,
            region,
            id,
            namespace,
            metric_name,
            dimensions,
            mut statistics,
            period,
            mut expression,
            sql_expression,
            mode,
            match_exact,
            alias,
            return_data,
            high_resolution,
            account_id,
        } = self;
        statistics.retain(|s| !s.is_empty());

        let region = if region.is_empty() || region == "default" {
            default_region.to_owned()
        } else {
            region
        };

        match mode {
            QueryMode::Insights => {
                ensure!(
                    !sql_expression.is_empty(),
                    MissingFieldSnafu {
                        ref_id: &ref_id,
                        field: "sqlExpression",
                    }
                );
                if statistics.is_empty() {
                    statistics.push(DEFAULT_STATISTIC.to_owned());
                }
                ensure!(statistics.len() == 1, ExpressionStatisticsSnafu { ref_id: &ref_id });
            }
            QueryMode::Metric if !expression.is_empty() => {
                if statistics.is_empty() {
                    statistics.push(DEFAULT_STATISTIC.to_owned());
                }
                ensure!(statistics.len() == 1, ExpressionStatisticsSnafu { ref_id: &ref_id });
            }
            QueryMode::Metric => {
                for (field, value) in [("namespace", &namespace), ("metricName", &metric_name)] {
                    ensure!(!value.is_empty(), MissingFieldSnafu { ref_id: &ref_id, field });
                }
                ensure!(
                    !statistics.is_empty(),
                    MissingFieldSnafu {
                        ref_id: &ref_id,
                        field: "statistic",
                    }
                );
            }
        }
        ensure!(
            !region.is_empty(),
            MissingFieldSnafu {
                ref_id: &ref_id,
                field: "region",
            }
        );

        let period = period.unwrap_or_else(|| range.auto_period(now));
        ensure!(period > 0, InvalidPeriodSnafu { ref_id: &ref_id, period });

        if mode == QueryMode::Metric && expression.contains(SEARCH_MARKER) {
            expression = expression.replace(PERIOD_AUTO_MACRO, &range.auto_period(now).to_string());
        }

        let user_defined_id = !id.is_empty();
        let multiple_stats = statistics.len() > 1;

        statistics
            .into_iter()
            .map(|statistic| -> Result<Query> {
                let base = if user_defined_id {
                    id.clone()
                } else {
                    format!("query{}", sanitize_id_part(&ref_id))
                };
                let query_id = if multiple_stats {
                    format!("{base}_{}", sanitize_id_part(&statistic))
                } else {
                    base
                };
                ensure!(
                    QUERY_ID_REGEX.is_match(&query_id),
                    InvalidIdSnafu {
                        ref_id: &ref_id,
                        id: query_id,
                    }
                );

                Ok(Query {
                    id: query_id,
                    ref_id: ref_id.clone(),
                    region: region.clone(),
                    namespace: namespace.clone(),
                    metric_name: metric_name.clone(),
                    dimensions: dimensions.clone(),
                    statistic,
                    period,
                    expression: expression.clone(),
                    sql_expression: sql_expression.clone(),
                    mode,
                    match_exact,
                    alias: alias.clone(),
                    return_data,
                    high_resolution,
                    user_defined_id,
                    account_id: account_id.clone(),
                })
            })
            .collect()
    }
}

fn sanitize_id_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Ensure query ids are unique across one logical request.
pub fn ensure_unique_ids<'a>(queries: impl IntoIterator<Item = &'a Query>) -> Result<()> {
    let mut seen = HashSet::new();
    for q in queries {
        ensure!(
            seen.insert(q.id.as_str()),
            DuplicateIdSnafu {
                ref_id: &q.ref_id,
                id: &q.id,
            }
        );
    }
    Ok(())
}

/// One query against the remote API, for exactly one statistic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub id: String,
    /// Editor row this query was expanded from.
    pub ref_id: String,
    pub region: String,
    pub namespace: String,
    pub metric_name: String,
    pub dimensions: Dimensions,
    pub statistic: String,
    /// Seconds.
    pub period: i64,
    pub expression: String,
    pub sql_expression: String,
    pub mode: QueryMode,
    pub match_exact: bool,
    pub alias: String,
    /// Suppressed queries are computed remotely but never surfaced.
    pub return_data: bool,
    pub high_resolution: bool,
    /// Whether `id` was supplied by the caller rather than synthesized.
    pub user_defined_id: bool,
    pub account_id: Option<String>,
}

impl Query {
    fn is_metric_mode(&self) -> bool {
        self.mode == QueryMode::Metric
    }

    fn has_single_statistic(&self) -> bool {
        !self.statistic.is_empty()
    }

    pub fn is_insights(&self) -> bool {
        self.mode == QueryMode::Insights
    }

    pub fn is_user_defined_search_expression(&self) -> bool {
        self.is_metric_mode()
            && self.has_single_statistic()
            && !self.expression.is_empty()
            && self.expression.contains(SEARCH_MARKER)
    }

    pub fn is_math_expression(&self) -> bool {
        self.is_metric_mode()
            && self.has_single_statistic()
            && !self.expression.is_empty()
            && !self.expression.contains(SEARCH_MARKER)
    }

    /// A query without expression whose dimensions cannot be satisfied by one metric.
    ///
    /// An empty value list is treated like the wildcard: it constrains nothing.
    pub fn is_inferred_search_expression(&self) -> bool {
        self.is_metric_mode()
            && self.expression.is_empty()
            && self
                .dimensions
                .values()
                .any(|values| values.len() != 1 || values.iter().any(|v| v == WILDCARD))
    }

    pub fn is_search_expression(&self) -> bool {
        self.is_user_defined_search_expression() || self.is_inferred_search_expression()
    }

    pub fn is_metric_stat(&self) -> bool {
        self.is_metric_mode() && !self.is_search_expression() && !self.is_math_expression()
    }

    /// Some dimension lists several concrete values (and none is the wildcard).
    pub fn is_multi_valued_dimension_expression(&self) -> bool {
        self.dimensions
            .values()
            .any(|values| values.len() > 1 && !values.iter().any(|v| v == WILDCARD))
    }

    /// Names of dimensions whose only value is the wildcard.
    pub fn wildcard_dimensions(&self) -> Vec<&str> {
        let mut keys = self
            .dimensions
            .iter()
            .filter(|(_, values)| values.len() == 1 && values[0] == WILDCARD)
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }

    /// Classify this query. Precedence follows [`QueryKind`].
    pub fn kind(&self) -> QueryKind {
        if self.is_insights() {
            QueryKind::Insights
        } else if self.is_user_defined_search_expression() {
            QueryKind::UserDefinedSearchExpression
        } else if self.is_math_expression() {
            QueryKind::MathExpression
        } else if self.is_inferred_search_expression() {
            QueryKind::InferredSearchExpression
        } else {
            QueryKind::MetricStat
        }
    }
}

/// Kind of a [`Query`], in classification precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// SQL-style insights query.
    Insights,
    /// Expression containing a search call.
    UserDefinedSearchExpression,
    /// Any other expression; references other query ids.
    MathExpression,
    /// No expression, but wildcarded or multi-valued dimensions.
    InferredSearchExpression,
    /// One concrete metric.
    MetricStat,
}

/// A [`Query`] together with its memoized classification and the expression
/// sent to the remote API on its behalf.
///
/// Immutable once built; transformations produce a new value.
///
/// Wildcard resolution never touches the query itself. Resolved dimension
/// values are carried alongside it and the search expression is rebuilt from
/// them, while the kind stays that of the row as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedQuery {
    query: Query,
    kind: QueryKind,
    used_expression: Option<String>,
    resolved_dimensions: Dimensions,
}

impl ClassifiedQuery {
    pub fn new(query: Query) -> Self {
        let kind = query.kind();
        let used_expression = match kind {
            QueryKind::Insights => Some(query.sql_expression.clone()),
            QueryKind::UserDefinedSearchExpression | QueryKind::MathExpression => {
                Some(query.expression.clone())
            }
            QueryKind::InferredSearchExpression => {
                Some(build_search_expression(&query, &query.statistic))
            }
            QueryKind::MetricStat => None,
        };
        let resolved_dimensions = query.dimensions.clone();

        Self {
            query,
            kind,
            used_expression,
            resolved_dimensions,
        }
    }

    /// A copy of this query whose wildcard dimensions resolve to `dimensions`.
    ///
    /// An inferred search is rebuilt to match exactly the resolved values.
    pub fn with_resolved_dimensions(&self, dimensions: Dimensions) -> Self {
        let used_expression = match self.kind {
            QueryKind::InferredSearchExpression => {
                let resolved = Query {
                    dimensions: dimensions.clone(),
                    ..self.query.clone()
                };
                Some(build_search_expression(&resolved, &resolved.statistic))
            }
            _ => self.used_expression.clone(),
        };

        Self {
            query: self.query.clone(),
            kind: self.kind,
            used_expression,
            resolved_dimensions: dimensions,
        }
    }

    /// Dimension values after wildcard resolution; the query's own
    /// dimensions if nothing was resolved.
    pub fn resolved_dimensions(&self) -> &Dimensions {
        &self.resolved_dimensions
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn into_query(self) -> Query {
        self.query
    }

    pub fn id(&self) -> &str {
        &self.query.id
    }

    pub fn ref_id(&self) -> &str {
        &self.query.ref_id
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Expression sent in place of a metric stat, if any.
    pub fn used_expression(&self) -> Option<&str> {
        self.used_expression.as_deref()
    }

    pub fn is_metric_stat(&self) -> bool {
        self.kind == QueryKind::MetricStat
    }

    pub fn is_math_expression(&self) -> bool {
        self.kind == QueryKind::MathExpression
    }

    pub fn is_user_defined_search_expression(&self) -> bool {
        self.kind == QueryKind::UserDefinedSearchExpression
    }

    pub fn is_inferred_search_expression(&self) -> bool {
        self.kind == QueryKind::InferredSearchExpression
    }

    pub fn is_search_expression(&self) -> bool {
        self.is_user_defined_search_expression() || self.is_inferred_search_expression()
    }

    pub fn is_insights(&self) -> bool {
        self.kind == QueryKind::Insights
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use test_helpers::assert_contains;

    pub(crate) fn range(seconds: i64) -> TimeRange {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        TimeRange::new(start, start + chrono::Duration::seconds(seconds)).unwrap()
    }

    pub(crate) fn metric_query(id: &str, dimensions: &[(&str, &[&str])]) -> Query {
        Query {
            id: id.to_owned(),
            ref_id: id.to_uppercase(),
            region: "us-east-1".to_owned(),
            namespace: "AWS/EC2".to_owned(),
            metric_name: "CPUUtilization".to_owned(),
            dimensions: dimensions
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            statistic: "Average".to_owned(),
            period: 300,
            return_data: true,
            match_exact: true,
            ..Default::default()
        }
    }

    fn row(ref_id: &str) -> QueryRow {
        QueryRow {
            ref_id: ref_id.to_owned(),
            region: "us-east-1".to_owned(),
            namespace: "AWS/EC2".to_owned(),
            metric_name: "CPUUtilization".to_owned(),
            statistics: vec!["Average".to_owned()],
            period: Some(60),
            return_data: true,
            ..Default::default()
        }
    }

    #[test]
    fn time_range_must_be_ordered() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_matches!(
            TimeRange::new(start, start),
            Err(Error::InvalidTimeRange { .. })
        );
        assert_matches!(
            TimeRange::new(start, start - chrono::Duration::seconds(1)),
            Err(Error::InvalidTimeRange { .. })
        );
        assert!(TimeRange::new(start, start + chrono::Duration::seconds(1)).is_ok());
    }

    #[test]
    fn auto_period_picks_smallest_fitting_period() {
        for (seconds, expected) in [
            (3600, 60),
            (2000 * 61, 300),
            (2000 * 3600, 3600),
            (2000 * 100_000, 86400),
        ] {
            let range = range(seconds);
            assert_eq!(range.auto_period(range.end()), expected, "{seconds}s");
        }
    }

    /// A two day range ending `days_ago` days before `now`.
    fn two_days_ending(now: DateTime<Utc>, days_ago: i64) -> TimeRange {
        let end = now - chrono::Duration::days(days_ago);
        TimeRange::new(end - chrono::Duration::days(2), end).unwrap()
    }

    #[test]
    fn auto_period_respects_retention_of_old_data() {
        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();

        for (days_ago, expected) in [(0, 300), (14, 300), (88, 3600), (454, 21600)] {
            assert_eq!(
                two_days_ending(now, days_ago).auto_period(now),
                expected,
                "{days_ago} days ago"
            );
        }

        let row = QueryRow {
            period: None,
            ..row("A")
        };
        let queries = row.into_queries(&two_days_ending(now, 88), "r", now).unwrap();
        assert_eq!(queries[0].period, 3600);
    }

    #[test]
    fn period_auto_macro_is_expanded_in_search_expressions() {
        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let search = |range: &TimeRange| {
            QueryRow {
                expression: "SEARCH('{AWS/EC2,InstanceId}', 'Average', $__period_auto)".to_owned(),
                period: Some(600),
                ..row("A")
            }
            .into_queries(range, "r", now)
            .unwrap()
            .remove(0)
        };

        for (hours, expected) in [(2, "60"), (100, "300"), (1000, "3600")] {
            let range = TimeRange::new(now - chrono::Duration::hours(hours), now).unwrap();
            let query = search(&range);
            assert_eq!(
                query.expression,
                format!("SEARCH('{{AWS/EC2,InstanceId}}', 'Average', {expected})")
            );
            assert_eq!(query.period, 600);
        }

        let insights = QueryRow {
            mode: QueryMode::Insights,
            sql_expression: "SELECT AVG(CPUUtilization) FROM SCHEMA(\"AWS/EC2\")".to_owned(),
            expression: "SEARCH('{AWS/EC2,InstanceId}', 'Average', $__period_auto)".to_owned(),
            ..row("B")
        }
        .into_queries(&range(3600), "r", range(3600).end())
        .unwrap();
        assert_contains!(insights[0].expression, PERIOD_AUTO_MACRO);
    }

    #[test]
    fn row_expands_one_query_per_statistic() {
        let row = QueryRow {
            statistics: vec!["Average".to_owned(), "p99.9".to_owned()],
            ..row("A")
        };

        let queries = row.into_queries(&range(3600), "us-west-2", range(3600).end()).unwrap();
        let ids = queries.iter().map(|q| q.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["queryA_Average", "queryA_p99_9"]);
        assert!(queries.iter().all(|q| !q.user_defined_id));
        assert_eq!(queries[1].statistic, "p99.9");
    }

    #[test]
    fn row_keeps_user_id_and_resolves_default_region() {
        let row = QueryRow {
            id: "cpu".to_owned(),
            region: "default".to_owned(),
            period: None,
            ..row("A")
        };

        let queries = row.into_queries(&range(3600), "us-west-2", range(3600).end()).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].id, "cpu");
        assert!(queries[0].user_defined_id);
        assert_eq!(queries[0].region, "us-west-2");
        assert_eq!(queries[0].period, 60);
    }

    #[test]
    fn row_validation_errors_carry_ref_id() {
        let err = QueryRow {
            namespace: String::new(),
            ..row("B")
        }
        .into_queries(&range(60), "r", range(60).end())
        .unwrap_err();
        assert_matches!(&err, Error::MissingField { field: "namespace", .. });
        assert_eq!(err.ref_id(), Some("B"));

        let err = QueryRow {
            id: "Bad-Id".to_owned(),
            ..row("C")
        }
        .into_queries(&range(60), "r", range(60).end())
        .unwrap_err();
        assert_matches!(err, Error::InvalidId { ref_id, .. } if ref_id == "C");

        let err = QueryRow {
            expression: "a + b".to_owned(),
            statistics: vec!["Average".to_owned(), "Sum".to_owned()],
            ..row("D")
        }
        .into_queries(&range(60), "r", range(60).end())
        .unwrap_err();
        assert_matches!(err, Error::ExpressionStatistics { .. });

        let err = QueryRow {
            period: Some(0),
            ..row("E")
        }
        .into_queries(&range(60), "r", range(60).end())
        .unwrap_err();
        assert_matches!(err, Error::InvalidPeriod { period: 0, .. });
    }

    #[test]
    fn expression_rows_need_no_metric() {
        let queries = QueryRow {
            id: "total".to_owned(),
            namespace: String::new(),
            metric_name: String::new(),
            statistics: vec![],
            expression: "SUM(METRICS())".to_owned(),
            ..row("F")
        }
        .into_queries(&range(60), "r", range(60).end())
        .unwrap();

        assert_eq!(queries[0].statistic, DEFAULT_STATISTIC);
        assert!(queries[0].is_math_expression());
    }

    #[test]
    fn duplicate_ids_name_the_offending_row() {
        let mut a = metric_query("same", &[]);
        a.ref_id = "A".to_owned();
        let mut b = metric_query("same", &[]);
        b.ref_id = "B".to_owned();

        let err = ensure_unique_ids([&a, &b]).unwrap_err();
        assert_matches!(err, Error::DuplicateId { ref_id, id } if ref_id == "B" && id == "same");
    }

    #[test]
    fn classification_precedence() {
        let stat = metric_query("a", &[("InstanceId", &["i-1"])]);
        assert_eq!(stat.kind(), QueryKind::MetricStat);

        let multi = metric_query("a", &[("InstanceId", &["i-1", "i-2"])]);
        assert_eq!(multi.kind(), QueryKind::InferredSearchExpression);
        assert!(multi.is_multi_valued_dimension_expression());

        let wildcard = metric_query("a", &[("InstanceId", &["*"])]);
        assert_eq!(wildcard.kind(), QueryKind::InferredSearchExpression);
        assert!(!wildcard.is_multi_valued_dimension_expression());
        assert_eq!(wildcard.wildcard_dimensions(), vec!["InstanceId"]);

        let math = Query {
            expression: "a * 2".to_owned(),
            ..multi.clone()
        };
        assert_eq!(math.kind(), QueryKind::MathExpression);

        let search = Query {
            expression: "SEARCH('{AWS/EC2} MetricName=\"CPUUtilization\"', 'Average', 300)"
                .to_owned(),
            ..stat.clone()
        };
        assert_eq!(search.kind(), QueryKind::UserDefinedSearchExpression);

        let insights = Query {
            mode: QueryMode::Insights,
            sql_expression: "SELECT AVG(CPUUtilization) FROM SCHEMA(\"AWS/EC2\")".to_owned(),
            ..multi
        };
        assert_eq!(insights.kind(), QueryKind::Insights);
        assert!(!insights.is_search_expression());
    }

    #[test]
    fn classified_query_remembers_used_expression() {
        let stat = ClassifiedQuery::new(metric_query("a", &[("InstanceId", &["i-1"])]));
        assert_eq!(stat.used_expression(), None);

        let search = ClassifiedQuery::new(metric_query("a", &[("InstanceId", &["*"])]));
        assert_eq!(
            search.used_expression(),
            Some(r#"SEARCH('{"AWS/EC2","InstanceId"} MetricName="CPUUtilization"', 'Average', 300)"#)
        );
    }

    #[test]
    fn resolved_dimensions_rebuild_search_but_keep_kind() {
        let search = ClassifiedQuery::new(Query {
            match_exact: false,
            ..metric_query("a", &[("InstanceId", &["*"])])
        });

        let resolved = search.with_resolved_dimensions(Dimensions::from([(
            "InstanceId".to_owned(),
            vec!["i-1".to_owned()],
        )]));

        assert_eq!(resolved.kind(), QueryKind::InferredSearchExpression);
        assert_eq!(resolved.query(), search.query());
        assert_eq!(
            resolved.used_expression(),
            Some(r#"SEARCH('Namespace="AWS/EC2" MetricName="CPUUtilization" "InstanceId"="i-1"', 'Average', 300)"#)
        );

        let stat = ClassifiedQuery::new(metric_query("b", &[("InstanceId", &["i-1"])]));
        let untouched = stat.with_resolved_dimensions(stat.resolved_dimensions().clone());
        assert_eq!(untouched.used_expression(), None);
    }

    fn arb_query() -> impl Strategy<Value = Query> {
        let value = prop::sample::select(vec!["*", "a", "b", "c"]);
        let values = prop::collection::vec(value, 0..4);
        let dimensions = prop::collection::hash_map(
            prop::sample::select(vec!["InstanceId", "AutoScalingGroupName", "ImageId"]),
            values,
            0..3,
        );
        let expression = prop::sample::select(vec![
            "",
            "a + b",
            "SEARCH('{AWS/EC2} MetricName=\"x\"', 'Sum', 60)",
        ]);
        let statistic = prop::sample::select(vec!["", "Average"]);

        (dimensions, expression, statistic).prop_map(|(dimensions, expression, statistic)| Query {
            id: "q".to_owned(),
            dimensions: dimensions
                .into_iter()
                .map(|(k, vs)| (k.to_owned(), vs.into_iter().map(str::to_owned).collect()))
                .collect(),
            expression: expression.to_owned(),
            statistic: statistic.to_owned(),
            period: 60,
            ..Default::default()
        })
    }

    proptest! {
        #[test]
        fn search_is_user_defined_or_inferred(query in arb_query()) {
            prop_assert_eq!(
                query.is_search_expression(),
                query.is_user_defined_search_expression() || query.is_inferred_search_expression()
            );

            let classified = ClassifiedQuery::new(query.clone());
            prop_assert_eq!(classified.kind(), query.kind());
            prop_assert_eq!(classified.is_search_expression(), query.is_search_expression());
            prop_assert_eq!(classified.is_metric_stat(), query.is_metric_stat());
            prop_assert_eq!(classified.is_math_expression(), query.is_math_expression());
        }

        #[test]
        fn single_concrete_values_never_search(values in prop::collection::vec(
            prop::sample::select(vec!["a", "b", "c", "*"]), 1..4)
        ) {
            let query = metric_query("q", &[("InstanceId", values.as_slice())]);

            let expect_search = values.len() > 1 || values.contains(&WILDCARD);
            prop_assert_eq!(query.is_search_expression(), expect_search);
        }
    }
}
