//! Projection validation for public collection views.
//!
//! Public collections expose a fixed column map; anything a caller asks
//! for must either be one of those columns or match a small allow-list of
//! "safe" expression shapes (aggregates over a single column, trivial
//! renames). Arbitrary SQL in a projection is rejected outright so a
//! projection can never become an injection vector.

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// COUNT(*) / COUNT(col) / MAX|MIN|SUM|AVG(col), optional AS alias.
    static ref SAFE_AGGREGATE: Regex = Regex::new(
        r"(?i)^(?:COUNT\((?:\*|[_a-z][_a-z0-9]*)\)|(?:MAX|MIN|SUM|AVG)\([_a-z][_a-z0-9]*\))(?:\s+AS\s+[_a-z][_a-z0-9]*)?$"
    )
    .expect("aggregate pattern is valid");

    /// `column AS alias` rename of a plain column.
    static ref SAFE_RENAME: Regex =
        Regex::new(r"(?i)^([_a-z][_a-z0-9]*)\s+AS\s+[_a-z][_a-z0-9]*$")
            .expect("rename pattern is valid");
}

/// Validate a caller-supplied projection against the allowed column map of
/// a public collection. Returns the projection to use; `None` requested
/// means "all allowed columns".
pub fn validate_projection(
    requested: Option<&[String]>,
    allowed: &'static [&'static str],
) -> Result<Vec<String>> {
    let Some(requested) = requested else {
        return Ok(allowed.iter().map(|c| c.to_string()).collect());
    };
    if requested.is_empty() {
        return Ok(allowed.iter().map(|c| c.to_string()).collect());
    }

    let mut projection = Vec::with_capacity(requested.len());
    for expression in requested {
        let expression = expression.trim();
        if allowed.iter().any(|c| c.eq_ignore_ascii_case(expression)) {
            projection.push(expression.to_string());
            continue;
        }
        if SAFE_AGGREGATE.is_match(expression) {
            projection.push(expression.to_string());
            continue;
        }
        if let Some(captures) = SAFE_RENAME.captures(expression) {
            let source = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            if allowed.iter().any(|c| c.eq_ignore_ascii_case(source)) {
                projection.push(expression.to_string());
                continue;
            }
        }
        return Err(Error::invalid(format!(
            "projection expression not allowed: {}",
            expression
        )));
    }
    Ok(projection)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["id", "path", "title", "bucket_id"];

    #[test]
    fn none_means_all_allowed_columns() {
        let projection = validate_projection(None, ALLOWED).unwrap();
        assert_eq!(projection, vec!["id", "path", "title", "bucket_id"]);
    }

    #[test]
    fn plain_columns_pass() {
        let requested = vec!["id".to_string(), "title".to_string()];
        let projection = validate_projection(Some(&requested), ALLOWED).unwrap();
        assert_eq!(projection, vec!["id", "title"]);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let requested = vec!["owner_package".to_string()];
        assert!(validate_projection(Some(&requested), ALLOWED).is_err());
    }

    #[test]
    fn safe_aggregates_pass() {
        for expr in ["COUNT(*)", "count(id)", "MAX(id) AS max_id", "sum(id)"] {
            let requested = vec![expr.to_string()];
            assert!(
                validate_projection(Some(&requested), ALLOWED).is_ok(),
                "expected {} to pass",
                expr
            );
        }
    }

    #[test]
    fn rename_of_allowed_column_passes() {
        let requested = vec!["bucket_id AS bucket".to_string()];
        assert!(validate_projection(Some(&requested), ALLOWED).is_ok());
    }

    #[test]
    fn rename_of_unknown_column_is_rejected() {
        let requested = vec!["owner_package AS o".to_string()];
        assert!(validate_projection(Some(&requested), ALLOWED).is_err());
    }

    #[test]
    fn sql_expressions_are_rejected() {
        for expr in [
            "(SELECT path FROM files)",
            "id; DROP TABLE files",
            "CASE WHEN 1 THEN path END",
            "COUNT(*) FROM files --",
        ] {
            let requested = vec![expr.to_string()];
            assert!(
                validate_projection(Some(&requested), ALLOWED).is_err(),
                "expected {} to be rejected",
                expr
            );
        }
    }
}
