//! Display names for reconciled series.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::query::{ClassifiedQuery, QueryKind};

pub(crate) static ALIAS_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").unwrap());

/// Render the display name of one series of `query`.
///
/// `stat` is the statistic the series was computed with, `tags` its dimension
/// values and `label` the label the API assigned to it, if any.
pub fn format_alias(
    query: &ClassifiedQuery,
    stat: &str,
    tags: &BTreeMap<String, String>,
    label: Option<&str>,
) -> String {
    let q = query.query();
    let label = label.filter(|l| !l.is_empty());

    if q.alias.is_empty() {
        match query.kind() {
            QueryKind::MathExpression => return q.id.clone(),
            QueryKind::InferredSearchExpression | QueryKind::UserDefinedSearchExpression => {
                if let Some(label) = label {
                    return label.to_owned();
                }
            }
            QueryKind::Insights => return label.unwrap_or(&q.id).to_owned(),
            QueryKind::MetricStat => {}
        }
        return fallback(&q.metric_name, stat);
    }

    let mut stat = stat.to_owned();
    let mut period = q.period.to_string();
    if query.is_user_defined_search_expression() {
        if let Some((search_stat, search_period)) = search_arguments(&q.expression) {
            stat = search_stat.to_owned();
            period = search_period.to_owned();
        }
    }

    let rendered = ALIAS_PLACEHOLDER.replace_all(&q.alias, |caps: &Captures<'_>| {
        let name = &caps[1];
        let value = match name {
            "region" => Some(q.region.as_str()),
            "namespace" => Some(q.namespace.as_str()),
            "metric" => Some(q.metric_name.as_str()),
            "stat" => Some(stat.as_str()),
            "period" => Some(period.as_str()),
            "label" => label,
            _ => None,
        };
        value
            .or_else(|| tags.get(name).map(String::as_str))
            .unwrap_or(&caps[0])
            .to_owned()
    });

    if rendered.is_empty() {
        fallback(&q.metric_name, &stat)
    } else {
        rendered.into_owned()
    }
}

fn fallback(metric_name: &str, stat: &str) -> String {
    format!("{metric_name}_{stat}")
}

/// The statistic and period of a search call, taken from its last two arguments.
fn search_arguments(expression: &str) -> Option<(&str, &str)> {
    let period_at = expression.rfind(',')?;
    let period = expression[period_at + 1..].trim_matches(|c: char| c == ' ' || c == ')');
    let stat_at = expression[..period_at].rfind(',')?;
    let stat = expression[stat_at + 1..period_at].trim_matches(|c: char| c == ' ' || c == '\'');
    Some((stat, period))
}
