//! Build SEARCH expressions for queries whose dimensions cannot be expressed
//! as a single metric stat.

use crate::query::{Query, WILDCARD};

/// Render the search expression for `query` evaluated with `stat`.
///
/// Dimension keys are emitted in sorted order so equal queries always produce
/// byte-identical expressions. A key whose values include the wildcard (or
/// that lists no values at all) constrains only the presence of the
/// dimension.
pub fn build_search_expression(query: &Query, stat: &str) -> String {
    let mut keys = query.dimensions.keys().collect::<Vec<_>>();
    keys.sort_unstable();

    let mut value_terms = vec![];
    let mut presence_keys = vec![];
    for key in keys {
        let values = &query.dimensions[key];
        if values.is_empty() || values.iter().any(|v| v == WILDCARD) {
            presence_keys.push(quote(key));
        } else if values.len() == 1 {
            value_terms.push(format!("{}={}", quote(key), quote(&values[0])));
        } else {
            let alternatives = values.iter().map(|v| quote(v)).collect::<Vec<_>>();
            value_terms.push(format!("{}=({})", quote(key), alternatives.join(" OR ")));
        }
    }

    let mut search = if query.match_exact {
        // the schema lists every dimension key, constrained or not
        let mut schema = vec![quote(&query.namespace)];
        let mut all_keys = query.dimensions.keys().map(|k| quote(k)).collect::<Vec<_>>();
        all_keys.sort_unstable();
        schema.extend(all_keys);

        let mut terms = vec![
            format!("{{{}}}", schema.join(",")),
            format!("MetricName={}", quote(&query.metric_name)),
        ];
        terms.extend(value_terms);
        terms.join(" ")
    } else {
        let mut terms = vec![
            format!("Namespace={}", quote(&query.namespace)),
            format!("MetricName={}", quote(&query.metric_name)),
        ];
        terms.extend(value_terms);
        terms.extend(presence_keys);
        terms.join(" ")
    };

    if let Some(account_id) = query.account_id.as_deref().filter(|a| !a.is_empty()) {
        search.push_str(&format!(" :aws.AccountId={}", quote(account_id)));
    }

    format!(
        "SEARCH('{}', '{}', {})",
        search.replace('\'', "\\'"),
        stat,
        query.period
    )
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}
