//! SQL issued against the ledger's `posts`, `pulses` and `accounts` tables.

use vend_spec::envelope::{var_prefix, ReturnEnvelope, CALL_PREFIX, LAST_READ_PREFIX};
use vend_spec::PostId;

/// Highest post id on the ledger.
pub const MAX_POST_ID: &str = "SELECT MAX(post_id) FROM posts";

/// Quote `value` as an SQL string literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

const LIKE_ESCAPE: char = '!';

// Only prefixes carrying LIKE metacharacters get an ESCAPE clause.
fn starts_with(prefix: &str) -> String {
    let is_meta = |c: char| matches!(c, '%' | '_') || c == LIKE_ESCAPE;
    if !prefix.contains(is_meta) {
        return sql_literal(&format!("{prefix}%"));
    }
    let mut pattern = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if is_meta(c) {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    format!("{} ESCAPE '{LIKE_ESCAPE}'", sql_literal(&pattern))
}

// SUBSTRING positions are 1-based.
fn after_prefix(prefix: &str) -> String {
    format!("SUBSTRING(data, {}, LENGTH(data))", prefix.len() + 1)
}

/// Latest `l:` marker posted by `address`, as text.
pub fn last_read_marker(address: &str) -> String {
    format!(
        "SELECT {} FROM posts WHERE address = {} AND data LIKE {} ORDER BY post_id DESC LIMIT 1",
        after_prefix(LAST_READ_PREFIX),
        sql_literal(address),
        starts_with(LAST_READ_PREFIX),
    )
}

/// Call pulses to `address` above its last-read marker, oldest first.
///
/// Columns: pulse id, sender, value, post id, post data.
pub fn pending_calls(address: &str, min_fee: u64) -> String {
    format!(
        "SELECT pulses.pulse_id, pulses.from_address, pulses.value, pulses.post_id, posts.data \
         FROM pulses LEFT JOIN posts ON pulses.post_id = posts.post_id \
         WHERE pulses.to_address = {address} \
         AND pulses.pulse_id > IFNULL(({marker}), 0) \
         AND pulses.value >= {min_fee} \
         AND posts.data LIKE {calls} \
         ORDER BY pulses.pulse_id ASC",
        address = sql_literal(address),
        marker = last_read_marker(address),
        calls = starts_with(CALL_PREFIX),
    )
}

/// First reply to `request` posted by `service` after post `after`.
pub fn reply_to(after: PostId, service: &str, request: PostId) -> String {
    format!(
        "SELECT data FROM posts WHERE post_id > {after} AND address = {} AND data LIKE {} LIMIT 1",
        sql_literal(service),
        starts_with(&ReturnEnvelope::prefix_for(request)),
    )
}

/// Balance of `address`.
pub fn balance(address: &str) -> String {
    format!(
        "SELECT balance FROM accounts WHERE address = {}",
        sql_literal(address)
    )
}

/// Latest value of the variable `name` published by `address`, as JSON text.
pub fn latest_var(address: &str, name: &str) -> String {
    let prefix = var_prefix(name);
    format!(
        "SELECT {} FROM posts WHERE address = {} AND data LIKE {} ORDER BY post_id DESC LIMIT 1",
        after_prefix(&prefix),
        sql_literal(address),
        starts_with(&prefix),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_double_quotes() {
        assert_eq!(sql_literal("abc"), "'abc'");
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn pending_calls_nests_marker_lookup() {
        let sql = pending_calls("svc1", 5);
        assert_eq!(
            sql,
            "SELECT pulses.pulse_id, pulses.from_address, pulses.value, pulses.post_id, posts.data \
             FROM pulses LEFT JOIN posts ON pulses.post_id = posts.post_id \
             WHERE pulses.to_address = 'svc1' \
             AND pulses.pulse_id > IFNULL((SELECT SUBSTRING(data, 3, LENGTH(data)) FROM posts \
             WHERE address = 'svc1' AND data LIKE 'l:%' ORDER BY post_id DESC LIMIT 1), 0) \
             AND pulses.value >= 5 \
             AND posts.data LIKE 'c:%' \
             ORDER BY pulses.pulse_id ASC"
        );
    }

    #[test]
    fn reply_lookup_scopes_to_request() {
        assert_eq!(
            reply_to(40, "svc1", 37),
            "SELECT data FROM posts WHERE post_id > 40 AND address = 'svc1' \
             AND data LIKE 'r:37:%' LIMIT 1"
        );
    }

    #[test]
    fn var_lookup_strips_prefix() {
        let sql = latest_var("abc", "motd");
        assert!(sql.starts_with("SELECT SUBSTRING(data, 13, LENGTH(data)) FROM posts"));
        assert!(sql.contains("data LIKE 'v:json:motd:%'"));
        assert!(sql.ends_with("ORDER BY post_id DESC LIMIT 1"));
    }

    #[test]
    fn like_metacharacters_in_names_match_literally() {
        let sql = latest_var("abc", "my_var!");
        assert!(sql.contains("data LIKE 'v:json:my!_var!!:%' ESCAPE '!'"));
        assert!(!latest_var("abc", "plain").contains("ESCAPE"));
    }
}
