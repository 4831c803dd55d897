//! Defensive handling of caller-supplied selection text.
//!
//! Legacy callers are known to smuggle a `GROUP BY` clause inside the
//! selection string. We split on the first occurrence and re-balance the
//! parentheses of each half. This is deliberately not a SQL parser: quoted
//! literals are tracked only so parens inside them are not counted.

use crate::error::{Error, Result};

const GROUP_BY_TOKEN: &str = " GROUP BY ";

/// Split a selection that illegitimately embeds a `GROUP BY` clause into a
/// (selection, group_by) pair, balancing parentheses in both halves. Fails
/// if a legitimate group-by was already supplied alongside the embedded one.
pub fn recover_abusive_group_by(
    selection: Option<&str>,
    group_by: Option<&str>,
) -> Result<(Option<String>, Option<String>)> {
    let Some(selection) = selection else {
        return Ok((None, group_by.map(|s| s.to_string())));
    };

    let Some(split_at) = find_group_by(selection) else {
        return Ok((Some(selection.to_string()), group_by.map(|s| s.to_string())));
    };

    if group_by.map(|g| !g.trim().is_empty()).unwrap_or(false) {
        return Err(Error::invalid(
            "selection contains GROUP BY while an explicit group-by was supplied",
        ));
    }

    let (head, tail) = selection.split_at(split_at);
    let tail = &tail[GROUP_BY_TOKEN.len()..];
    // Each half is parenthesized so it stays a single term wherever it is
    // spliced, then re-balanced in case the split broke a paren pair.
    Ok((
        Some(maybe_balance(&format!("({})", head))),
        Some(maybe_balance(&format!("({})", tail))),
    ))
}

/// Byte offset of the first case-insensitive ` GROUP BY ` occurrence.
/// Scans the original bytes so the offset is valid in the original string;
/// uppercasing a copy would shift offsets past characters whose uppercase
/// form has a different UTF-8 length.
fn find_group_by(selection: &str) -> Option<usize> {
    let bytes = selection.as_bytes();
    let token = GROUP_BY_TOKEN.as_bytes();
    if bytes.len() < token.len() {
        return None;
    }
    (0..=bytes.len() - token.len())
        .find(|&start| bytes[start..start + token.len()].eq_ignore_ascii_case(token))
}

/// Re-balance unmatched parentheses by padding the short side, returning
/// the input unchanged when already balanced. Parens inside single- or
/// double-quoted literals are ignored.
pub fn maybe_balance(sql: &str) -> String {
    if sql.is_empty() {
        return sql.to_string();
    }

    let mut quote: Option<char> = None;
    let mut unmatched_open = 0usize;
    let mut unmatched_close = 0usize;
    for c in sql.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => unmatched_open += 1,
                ')' => {
                    if unmatched_open > 0 {
                        unmatched_open -= 1;
                    } else {
                        unmatched_close += 1;
                    }
                }
                _ => {}
            },
        }
    }

    if unmatched_open == 0 && unmatched_close == 0 {
        return sql.to_string();
    }

    let mut balanced = String::with_capacity(sql.len() + unmatched_open + unmatched_close);
    for _ in 0..unmatched_close {
        balanced.push('(');
    }
    balanced.push_str(sql);
    for _ in 0..unmatched_open {
        balanced.push(')');
    }
    balanced
}
