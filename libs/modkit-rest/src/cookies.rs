//! Cookie accumulation across redirect hops.
//!
//! This is a single `Cookie` header string, not a jar: no domain, path or expiry
//! matching. Names seen in a new `Set-Cookie` replace the same name in the header;
//! everything else is kept.

/// Set-Cookie attributes that never become cookies.
const ATTRIBUTES: &[&str] = &[
    "path", "expires", "domain", "secure", "httponly", "samesite", "max-age", "version",
    "comment", "priority", "partitioned",
];

fn is_attribute(name: &str) -> bool {
    ATTRIBUTES.iter().any(|a| a.eq_ignore_ascii_case(name))
}

fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let pair = pair.trim();
    if pair.is_empty() {
        return None;
    }
    match pair.split_once('=') {
        Some((name, value)) => Some((name.trim(), value.trim())),
        None => Some((pair, "")),
    }
}

/// Extract `name=value` cookies from one `Set-Cookie` value.
///
/// Several cookies folded into one value with `,` are supported. A comma inside an
/// `Expires=` date does not start a new cookie.
fn set_cookie_pairs(value: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for segment in value.split(';') {
        for (i, piece) in segment.split(',').enumerate() {
            let Some((name, value)) = split_pair(piece) else {
                continue;
            };
            // "Expires=Wed, 21 Oct 2015 ..." splits into "Expires=Wed" and " 21 Oct ..."
            if i > 0 && !piece.contains('=') {
                continue;
            }
            if name.is_empty() || is_attribute(name) {
                continue;
            }
            pairs.push((name.to_owned(), value.to_owned()));
        }
    }
    pairs
}

/// Merge `Set-Cookie` values into an existing `Cookie` header.
///
/// Returns `None` when there is nothing to send.
#[must_use]
pub fn merge_cookies<'a, I>(existing: Option<&str>, set_cookies: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut jar: Vec<(String, String)> = existing
        .into_iter()
        .flat_map(|header| header.split(';'))
        .filter_map(split_pair)
        .map(|(n, v)| (n.to_owned(), v.to_owned()))
        .collect();

    for value in set_cookies {
        for (name, value) in set_cookie_pairs(value) {
            match jar.iter_mut().find(|(n, _)| *n == name) {
                Some(entry) => entry.1 = value,
                None => jar.push((name, value)),
            }
        }
    }

    if jar.is_empty() {
        return None;
    }
    Some(
        jar.iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; "),
    )
}
