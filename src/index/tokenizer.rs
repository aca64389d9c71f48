//! Fixed tokenizer and key=value extraction over raw payloads.
//!
//! Both are part of the on-disk format contract: changing them changes
//! what existing indexes mean, so they are deliberately simple and
//! versioned implicitly through the index file magic.

/// Split `raw` into normalized tokens: runs of alphanumerics and
/// underscore, lowercased, deduplicated, sorted.
pub fn tokenize(raw: &[u8]) -> Vec<String> {
    let mut tokens = std::collections::BTreeSet::new();
    let mut current = String::new();
    for &b in raw {
        let c = b as char;
        if c.is_ascii_alphanumeric() || c == '_' {
            current.push(c.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.insert(current);
    }
    tokens.into_iter().collect()
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Extract `k=v` and `k="..."` pairs from a raw payload.
///
/// A key is a run of alphanumerics/underscore not preceded by another key
/// byte; an unquoted value runs to the next whitespace. No escape
/// processing inside quotes. Pairs are returned in occurrence order and
/// may repeat.
pub fn extract_kv_pairs(raw: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        if !is_key_byte(raw[i]) || (i > 0 && is_key_byte(raw[i - 1])) {
            i += 1;
            continue;
        }
        let key_start = i;
        while i < raw.len() && is_key_byte(raw[i]) {
            i += 1;
        }
        if i >= raw.len() || raw[i] != b'=' {
            continue;
        }
        let key_end = i;
        i += 1; // '='

        let value: &[u8];
        if i < raw.len() && raw[i] == b'"' {
            i += 1;
            let val_start = i;
            while i < raw.len() && raw[i] != b'"' {
                i += 1;
            }
            if i >= raw.len() {
                // unterminated quote, not a pair
                continue;
            }
            value = &raw[val_start..i];
            i += 1; // closing quote
        } else {
            let val_start = i;
            while i < raw.len() && !raw[i].is_ascii_whitespace() {
                i += 1;
            }
            value = &raw[val_start..i];
            if value.is_empty() {
                continue;
            }
        }

        if let (Ok(k), Ok(v)) = (
            std::str::from_utf8(&raw[key_start..key_end]),
            std::str::from_utf8(value),
        ) {
            pairs.push((k.to_owned(), v.to_owned()));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_normalizes_and_dedupes() {
        let tokens = tokenize(b"User login OK; user=alice login_count=3");
        assert_eq!(
            tokens,
            vec!["3", "alice", "login", "login_count", "ok", "user"]
        );
    }

    #[test]
    fn tokenize_empty_and_separators_only() {
        assert!(tokenize(b"").is_empty());
        assert!(tokenize(b" .,;! ").is_empty());
    }

    #[test]
    fn kv_unquoted() {
        let pairs = extract_kv_pairs(b"level=info msg=started pid=42");
        assert_eq!(
            pairs,
            vec![
                ("level".into(), "info".into()),
                ("msg".into(), "started".into()),
                ("pid".into(), "42".into()),
            ]
        );
    }

    #[test]
    fn kv_quoted_values_keep_spaces() {
        let pairs = extract_kv_pairs(b"msg=\"user logged in\" user=bob");
        assert_eq!(
            pairs,
            vec![
                ("msg".into(), "user logged in".into()),
                ("user".into(), "bob".into()),
            ]
        );
    }

    #[test]
    fn kv_ignores_malformed() {
        // empty values and unterminated quotes are not pairs
        assert!(extract_kv_pairs(b"key= other=\"unterminated").is_empty());
        // '=' with no key on the left is not a pair either
        assert!(extract_kv_pairs(b"= =value").is_empty());
    }
}
