//! Compact-URI (CURIE) helpers
//!
//! Every node identifier in the graph is a `PREFIX:LOCAL` string. Prefix
//! comparison is case-sensitive string equality; the first colon is the
//! separator and later colons belong to the local part.

/// Split an identifier into `(prefix, local)` at the first colon.
///
/// Returns `None` for strings without a colon or with an empty prefix;
/// full IRIs (`http://...`) are not CURIEs and also return `None`.
pub fn split(id: &str) -> Option<(&str, &str)> {
    if id.starts_with("http://") || id.starts_with("https://") {
        return None;
    }
    let (prefix, local) = id.split_once(':')?;
    if prefix.is_empty() {
        return None;
    }
    Some((prefix, local))
}

/// The prefix of an identifier, if it is a CURIE
pub fn prefix(id: &str) -> Option<&str> {
    split(id).map(|(p, _)| p)
}

/// The local part of an identifier, if it is a CURIE
pub fn local(id: &str) -> Option<&str> {
    split(id).map(|(_, l)| l)
}

/// True when `id` is a CURIE with exactly this prefix
pub fn has_prefix(id: &str, wanted: &str) -> bool {
    prefix(id) == Some(wanted)
}
