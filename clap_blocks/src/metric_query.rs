//! Config for compiling and batching metric queries against the remote metrics API.

use std::{num::NonZeroUsize, time::Duration};

const fn non_zero(v: usize) -> NonZeroUsize {
    match NonZeroUsize::new(v) {
        Some(v) => v,
        None => panic!("limit must be non-zero"),
    }
}

/// CLI config for the metric query pipeline.
///
/// The per-call limits mirror hard limits imposed by the remote API; raising
/// them above what the API accepts turns planning successes into remote
/// validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Parser)]
pub struct MetricQueryConfig {
    /// Maximum number of queries that are sent within a single API call.
    #[clap(
        long = "max-results-per-call",
        env = "METRIC_QUERY_MAX_RESULTS_PER_CALL",
        default_value = "100",
        action
    )]
    pub max_results_per_call: NonZeroUsize,

    /// Maximum number of search expressions that are sent within a single API call.
    ///
    /// Plain metric-stat queries never count towards this limit.
    #[clap(
        long = "max-search-expressions-per-call",
        env = "METRIC_QUERY_MAX_SEARCH_EXPRESSIONS_PER_CALL",
        default_value = "5",
        action
    )]
    pub max_search_expressions_per_call: NonZeroUsize,

    /// Maximum number of samples a high-resolution query may request.
    ///
    /// High-resolution metrics are only retained for a short window, so a query
    /// whose `(end - start) / period` exceeds this value is rejected before any
    /// remote call is made.
    #[clap(
        long = "high-resolution-max-samples",
        env = "METRIC_QUERY_HIGH_RESOLUTION_MAX_SAMPLES",
        default_value_t = 21_600,
        action
    )]
    pub high_resolution_max_samples: i64,

    /// How long resolved wildcard dimension values stay cached.
    #[clap(
        long = "wildcard-cache-ttl",
        env = "METRIC_QUERY_WILDCARD_CACHE_TTL",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    pub wildcard_cache_ttl: Duration,

    /// Maximum number of pages fetched by a single dimension discovery call.
    #[clap(
        long = "discovery-page-limit",
        env = "METRIC_QUERY_DISCOVERY_PAGE_LIMIT",
        default_value = "500",
        action
    )]
    pub discovery_page_limit: NonZeroUsize,
}

impl Default for MetricQueryConfig {
    fn default() -> Self {
        Self {
            max_results_per_call: const { non_zero(100) },
            max_search_expressions_per_call: const { non_zero(5) },
            high_resolution_max_samples: 21_600,
            wildcard_cache_ttl: Duration::from_secs(5 * 60),
            discovery_page_limit: const { non_zero(500) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use test_helpers::assert_contains;

    #[test]
    fn test_default() {
        let actual = MetricQueryConfig::try_parse_from(["my_binary"]).unwrap();

        assert_eq!(actual, MetricQueryConfig::default());
        assert_eq!(actual.max_results_per_call.get(), 100);
        assert_eq!(actual.max_search_expressions_per_call.get(), 5);
        assert_eq!(actual.high_resolution_max_samples, 21_600);
        assert_eq!(actual.wildcard_cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let actual = MetricQueryConfig::try_parse_from([
            "my_binary",
            "--max-results-per-call",
            "500",
            "--max-search-expressions-per-call",
            "10",
            "--wildcard-cache-ttl",
            "90s",
        ])
        .unwrap();

        assert_eq!(actual.max_results_per_call.get(), 500);
        assert_eq!(actual.max_search_expressions_per_call.get(), 10);
        assert_eq!(actual.wildcard_cache_ttl, Duration::from_secs(90));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let actual =
            MetricQueryConfig::try_parse_from(["my_binary", "--max-results-per-call", "0"])
                .unwrap_err()
                .to_string();

        assert_contains!(actual, "--max-results-per-call");
    }
}
