//! Packing of classified queries into API-call sized batches.
//!
//! Planning runs in three steps:
//!
//! 1. High-resolution queries asking for more samples than the API retains
//!    are rejected.
//! 2. When more than one insights query is present, the queries are split
//!    into isolation groups: every query that no math expression references
//!    seeds a group, which also receives everything it transitively
//!    references. The API does not allow insights queries to share a call.
//! 3. Each group is packed into batches honoring the per-call limits.
//!    Metric-stat queries without caller-supplied ids are packed on their
//!    own, since nothing can reference them.

use std::{
    collections::{HashMap, HashSet},
    mem,
};

use clap_blocks::metric_query::MetricQueryConfig;
use metric_api_client::{Dimension, GetMetricDataRequest, Metric, MetricDataQuery, MetricStat};
use observability_deps::tracing::*;
use once_cell::sync::Lazy;
use regex::Regex;
use snafu::{ensure, Snafu};

use crate::query::{ClassifiedQuery, QueryKind, TimeRange};

static TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").unwrap());

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("query {ref_id}: period must be positive, got {period}"))]
    InvalidPeriod { ref_id: String, period: i64 },

    #[snafu(display(
        "query {ref_id}: period {period}s is too short for the time range of a \
         high-resolution query: {samples} samples requested, at most {max_samples} are retained"
    ))]
    HighResolutionPeriodTooLong {
        ref_id: String,
        period: i64,
        samples: i64,
        max_samples: i64,
    },
}

impl Error {
    pub fn ref_id(&self) -> &str {
        match self {
            Self::InvalidPeriod { ref_id, .. }
            | Self::HighResolutionPeriodTooLong { ref_id, .. } => ref_id,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-call limits of the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerLimits {
    pub max_results_per_call: usize,
    pub max_search_expressions_per_call: usize,
    pub high_resolution_max_samples: i64,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        Self::from(&MetricQueryConfig::default())
    }
}

impl From<&MetricQueryConfig> for PlannerLimits {
    fn from(config: &MetricQueryConfig) -> Self {
        Self {
            max_results_per_call: config.max_results_per_call.get(),
            max_search_expressions_per_call: config.max_search_expressions_per_call.get(),
            high_resolution_max_samples: config.high_resolution_max_samples,
        }
    }
}

/// Queries sent together in one (paginated) API call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    queries: Vec<ClassifiedQuery>,
    search_expression_count: usize,
}

impl Batch {
    fn push(&mut self, query: ClassifiedQuery) {
        if query.is_search_expression() {
            self.search_expression_count += 1;
        }
        self.queries.push(query);
    }

    pub fn queries(&self) -> &[ClassifiedQuery] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn search_expression_count(&self) -> usize {
        self.search_expression_count
    }

    /// The first page request for this batch.
    pub fn request(&self, range: &TimeRange) -> GetMetricDataRequest {
        GetMetricDataRequest {
            start_time: range.start(),
            end_time: range.end(),
            metric_data_queries: self.queries.iter().map(metric_data_query).collect(),
            next_token: None,
        }
    }
}

fn metric_data_query(classified: &ClassifiedQuery) -> MetricDataQuery {
    let query = classified.query();
    let mut entry = MetricDataQuery {
        id: query.id.clone(),
        return_data: query.return_data,
        metric_stat: None,
        expression: None,
        period: None,
        label: None,
        account_id: query.account_id.clone(),
    };

    match classified.used_expression() {
        Some(expression) => {
            entry.expression = Some(expression.to_owned());
            entry.period = Some(query.period);
        }
        None => {
            let mut dimensions = query
                .dimensions
                .iter()
                .filter_map(|(name, values)| {
                    values.first().map(|value| Dimension {
                        name: name.clone(),
                        value: value.clone(),
                    })
                })
                .collect::<Vec<_>>();
            dimensions.sort_unstable();

            entry.metric_stat = Some(MetricStat {
                metric: Metric {
                    namespace: query.namespace.clone(),
                    metric_name: query.metric_name.clone(),
                    dimensions,
                },
                period: query.period,
                stat: query.statistic.clone(),
            });
        }
    }

    entry
}

/// Result of planning: the batches to execute, plus the queries rejected
/// before any batch was formed.
#[derive(Debug, Default)]
pub struct Plan {
    pub batches: Vec<Batch>,
    pub rejected: Vec<Error>,
}

/// Plan the execution of `queries` over `range`.
pub fn plan(range: &TimeRange, queries: Vec<ClassifiedQuery>, limits: PlannerLimits) -> Plan {
    let mut rejected = vec![];
    let mut accepted = Vec::with_capacity(queries.len());
    for query in queries {
        match check_period(range, &query, limits.high_resolution_max_samples) {
            Ok(()) => accepted.push(query),
            Err(e) => rejected.push(e),
        }
    }

    let groups = get_metric_query_batches(accepted);
    let n_groups = groups.len();
    let batches = groups
        .into_iter()
        .flat_map(|group| pack_group(group, limits))
        .collect::<Vec<_>>();

    debug!(
        n_groups,
        n_batches = batches.len(),
        n_rejected = rejected.len(),
        "planned metric query batches"
    );

    Plan { batches, rejected }
}

fn check_period(range: &TimeRange, query: &ClassifiedQuery, max_samples: i64) -> Result<()> {
    let query = query.query();
    ensure!(
        query.period > 0,
        InvalidPeriodSnafu {
            ref_id: &query.ref_id,
            period: query.period,
        }
    );
    if !query.high_resolution {
        return Ok(());
    }

    let samples = range.seconds() / query.period;
    if samples > max_samples {
        return HighResolutionPeriodTooLongSnafu {
            ref_id: &query.ref_id,
            period: query.period,
            samples,
            max_samples,
        }
        .fail();
    }
    Ok(())
}

/// Split `queries` into isolation groups when more than one insights query
/// is present; otherwise return a single group holding every query.
///
/// A query referenced from several groups is placed in each of them.
pub fn get_metric_query_batches(queries: Vec<ClassifiedQuery>) -> Vec<Vec<ClassifiedQuery>> {
    let n_insights = queries.iter().filter(|q| q.is_insights()).count();
    if n_insights <= 1 {
        return vec![queries];
    }

    let by_id = queries
        .iter()
        .enumerate()
        .map(|(i, q)| (q.id(), i))
        .collect::<HashMap<_, _>>();

    let mut references: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut referenced = HashSet::new();
    for (i, query) in queries.iter().enumerate() {
        if !query.is_math_expression() {
            continue;
        }
        let expression = &query.query().expression;
        let mut refs = vec![];
        for token in expression_tokens(expression) {
            if let Some(&j) = by_id.get(token) {
                if j != i && !refs.contains(&j) {
                    refs.push(j);
                    referenced.insert(j);
                }
            }
        }
        references.insert(i, refs);
    }

    let mut placed = HashSet::new();
    let mut groups = vec![];
    let roots = (0..queries.len())
        .filter(|i| !referenced.contains(i))
        .collect::<Vec<_>>();
    for root in roots {
        groups.push(collect_group(root, &references, &mut placed));
    }
    // what is left is only reachable through a reference cycle, seed from
    // the expressions in the cycle before their leaves
    let leftovers = (0..queries.len())
        .filter(|i| references.get(i).is_some_and(|refs| !refs.is_empty()))
        .chain(0..queries.len())
        .collect::<Vec<_>>();
    for i in leftovers {
        if !placed.contains(&i) {
            groups.push(collect_group(i, &references, &mut placed));
        }
    }

    debug!(
        n_insights,
        n_groups = groups.len(),
        "isolated insights queries into separate batches"
    );

    groups
        .into_iter()
        .map(|group| group.into_iter().map(|i| queries[i].clone()).collect())
        .collect()
}

/// Identifier-like tokens of a math expression; any of them may name another query.
pub(crate) fn expression_tokens(expression: &str) -> impl Iterator<Item = &str> {
    TOKEN_REGEX.find_iter(expression).map(|m| m.as_str())
}

fn collect_group(
    root: usize,
    references: &HashMap<usize, Vec<usize>>,
    placed: &mut HashSet<usize>,
) -> Vec<usize> {
    let mut group = vec![];
    let mut stack = vec![root];
    while let Some(i) = stack.pop() {
        if group.contains(&i) {
            continue;
        }
        group.push(i);
        placed.insert(i);
        if let Some(refs) = references.get(&i) {
            stack.extend(refs.iter().rev());
        }
    }
    group
}

fn priority(query: &ClassifiedQuery) -> u8 {
    match query.kind() {
        QueryKind::MetricStat => 0,
        QueryKind::MathExpression => 1,
        _ => 2,
    }
}

fn pack_group(queries: Vec<ClassifiedQuery>, limits: PlannerLimits) -> Vec<Batch> {
    let (standalone, mut dependent): (Vec<_>, Vec<_>) = queries
        .into_iter()
        .partition(|q| q.is_metric_stat() && !q.query().user_defined_id);
    dependent.sort_by_key(priority);

    let mut batches = pack(standalone, limits);
    batches.extend(pack(dependent, limits));
    batches
}

/// Greedily fill batches in order, starting a new one whenever the next
/// query would exceed a limit.
fn pack(queries: Vec<ClassifiedQuery>, limits: PlannerLimits) -> Vec<Batch> {
    let mut batches = vec![];
    let mut current = Batch::default();

    for query in queries {
        let too_many_results = current.len() + 1 > limits.max_results_per_call;
        let too_many_searches = query.is_search_expression()
            && current.search_expression_count() + 1 > limits.max_search_expressions_per_call;

        if (too_many_results || too_many_searches) && !current.is_empty() {
            batches.push(mem::take(&mut current));
        }
        current.push(query);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{
        tests::{metric_query, range},
        Query, QueryMode,
    };
    use assert_matches::assert_matches;

    fn stat(id: &str) -> ClassifiedQuery {
        ClassifiedQuery::new(metric_query(id, &[("InstanceId", &["i-1"])]))
    }

    fn search(id: &str) -> ClassifiedQuery {
        ClassifiedQuery::new(Query {
            user_defined_id: true,
            ..metric_query(id, &[("InstanceId", &["*"])])
        })
    }

    fn math(id: &str, expression: &str) -> ClassifiedQuery {
        ClassifiedQuery::new(Query {
            expression: expression.to_owned(),
            user_defined_id: true,
            ..metric_query(id, &[])
        })
    }

    fn insights(id: &str) -> ClassifiedQuery {
        ClassifiedQuery::new(Query {
            mode: QueryMode::Insights,
            sql_expression: "SELECT AVG(CPUUtilization) FROM SCHEMA(\"AWS/EC2\")".to_owned(),
            user_defined_id: true,
            ..metric_query(id, &[])
        })
    }

    fn ids(group: &[ClassifiedQuery]) -> Vec<&str> {
        group.iter().map(|q| q.id()).collect()
    }

    fn batch_ids(plan: &Plan) -> Vec<Vec<&str>> {
        plan.batches.iter().map(|b| ids(b.queries())).collect()
    }

    #[test]
    fn metric_stats_fill_batches_up_to_limit() {
        for (n, expected) in [(1, 1), (100, 1), (101, 2), (250, 3)] {
            let queries = (0..n).map(|i| stat(&format!("q{i}"))).collect();
            let plan = plan(&range(3600), queries, PlannerLimits::default());

            assert_eq!(plan.batches.len(), expected, "n = {n}");
            assert!(plan.batches.iter().all(|b| b.len() <= 100));
            assert_eq!(plan.batches.iter().map(Batch::len).sum::<usize>(), n);
        }
    }

    #[test]
    fn sixth_search_expression_starts_a_new_batch() {
        let queries = (0..6).map(|i| search(&format!("s{i}"))).collect();
        let plan = plan(&range(3600), queries, PlannerLimits::default());

        assert_eq!(batch_ids(&plan), vec![
            vec!["s0", "s1", "s2", "s3", "s4"],
            vec!["s5"],
        ]);
        assert_eq!(plan.batches[0].search_expression_count(), 5);
    }

    #[test]
    fn anonymous_metric_stats_do_not_share_batches_with_searches() {
        let mut queries = (0..5).map(|i| search(&format!("s{i}"))).collect::<Vec<_>>();
        queries.push(stat("anon"));
        queries.push(math("m", "s0 * 2"));
        queries.push(ClassifiedQuery::new(Query {
            user_defined_id: true,
            ..metric_query("named", &[("InstanceId", &["i-1"])])
        }));

        let plan = plan(&range(3600), queries, PlannerLimits::default());

        assert_eq!(batch_ids(&plan), vec![
            vec!["anon"],
            vec!["named", "m", "s0", "s1", "s2", "s3", "s4"],
        ]);
    }

    #[test]
    fn high_resolution_queries_over_sample_limit_are_rejected() {
        let mut fine = metric_query("fine", &[("InstanceId", &["i-1"])]);
        fine.high_resolution = true;
        fine.period = 1;
        let mut coarse = fine.clone();
        coarse.id = "coarse".to_owned();
        coarse.ref_id = "COARSE".to_owned();
        coarse.period = 60;

        let plan = plan(
            &range(86_400),
            vec![ClassifiedQuery::new(fine), ClassifiedQuery::new(coarse)],
            PlannerLimits::default(),
        );

        assert_eq!(batch_ids(&plan), vec![vec!["coarse"]]);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].ref_id(), "FINE");
        assert_matches!(
            plan.rejected[0],
            Error::HighResolutionPeriodTooLong {
                samples: 86_400,
                max_samples: 21_600,
                ..
            }
        );
    }

    #[test]
    fn non_positive_periods_are_rejected() {
        let mut zero = metric_query("zero", &[("InstanceId", &["i-1"])]);
        zero.high_resolution = true;
        zero.period = 0;
        let mut negative = metric_query("negative", &[("InstanceId", &["i-1"])]);
        negative.period = -60;

        let plan = plan(
            &range(3600),
            vec![
                ClassifiedQuery::new(zero),
                ClassifiedQuery::new(negative),
                stat("ok"),
            ],
            PlannerLimits::default(),
        );

        assert_eq!(batch_ids(&plan), vec![vec!["ok"]]);
        assert_matches!(
            plan.rejected.as_slice(),
            [
                Error::InvalidPeriod { period: 0, .. },
                Error::InvalidPeriod { period: -60, .. }
            ]
        );
        assert_eq!(plan.rejected[1].ref_id(), "NEGATIVE");
    }

    #[test]
    fn single_insights_query_is_not_isolated() {
        let groups = get_metric_query_batches(vec![
            insights("i1"),
            stat("a"),
            math("m", "a + 1"),
            search("s"),
        ]);

        assert_eq!(groups.len(), 1);
        assert_eq!(ids(&groups[0]), vec!["i1", "a", "m", "s"]);
    }

    #[test]
    fn independent_insights_queries_are_isolated() {
        let groups = get_metric_query_batches(vec![insights("i1"), insights("i2")]);

        assert_eq!(groups.len(), 2);
        assert_eq!(ids(&groups[0]), vec!["i1"]);
        assert_eq!(ids(&groups[1]), vec!["i2"]);
    }

    #[test]
    fn math_expression_keeps_referenced_insights_together() {
        let groups = get_metric_query_batches(vec![
            insights("i1"),
            insights("i2"),
            math("m", "i1/i2*100"),
        ]);

        assert_eq!(groups.len(), 1);
        assert_eq!(ids(&groups[0]), vec!["m", "i1", "i2"]);
    }

    #[test]
    fn transitive_references_follow_their_root() {
        let groups = get_metric_query_batches(vec![
            insights("i1"),
            insights("i2"),
            math("inner", "i1 * 2"),
            math("outer", "inner + 1"),
            math("other", "i1 - i2"),
        ]);

        let groups = groups.iter().map(|g| ids(g)).collect::<Vec<_>>();
        assert_eq!(groups, vec![
            vec!["outer", "inner", "i1"],
            vec!["other", "i1", "i2"],
        ]);
    }

    #[test]
    fn reference_cycles_still_get_a_batch() {
        let groups = get_metric_query_batches(vec![
            insights("i1"),
            insights("i2"),
            math("a", "b + i1"),
            math("b", "a + i2"),
        ]);

        let groups = groups.iter().map(|g| ids(g)).collect::<Vec<_>>();
        assert_eq!(groups, vec![vec!["a", "b", "i2", "i1"]]);
    }

    #[test]
    fn request_renders_every_query_kind() {
        let queries = vec![
            stat("a"),
            math("m", "a * 2"),
            search("s"),
            insights("i"),
        ];
        let plan = plan(&range(3600), queries, PlannerLimits::default());
        let requests = plan
            .batches
            .iter()
            .map(|b| b.request(&range(3600)))
            .collect::<Vec<_>>();

        let stat_entry = &requests[0].metric_data_queries[0];
        assert_eq!(stat_entry.id, "a");
        assert_eq!(stat_entry.expression, None);
        let metric_stat = stat_entry.metric_stat.as_ref().unwrap();
        assert_eq!(metric_stat.stat, "Average");
        assert_eq!(metric_stat.period, 300);
        assert_eq!(metric_stat.metric.dimensions[0].value, "i-1");

        let rest = &requests[1].metric_data_queries;
        assert_eq!(rest.iter().map(|q| q.id.as_str()).collect::<Vec<_>>(), vec!["m", "s", "i"]);
        assert_eq!(rest[0].expression.as_deref(), Some("a * 2"));
        assert!(rest[1].expression.as_deref().unwrap().starts_with("SEARCH("));
        assert!(rest[2].expression.as_deref().unwrap().starts_with("SELECT"));
        assert!(rest.iter().all(|q| q.period == Some(300) && q.metric_stat.is_none()));
        assert_eq!(requests[1].start_time, range(3600).start());
    }
}
