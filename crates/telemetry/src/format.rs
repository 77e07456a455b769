//! SQL text shaping for logs.

/// Replace line breaks and tabs so a statement stays on one log line.
pub fn flatten_query(sql: &str) -> String {
    sql.chars()
        .map(|c| if matches!(c, '\r' | '\n' | '\t') { ' ' } else { c })
        .collect()
}

/// Truncate `sql` to `max_len` bytes (0 = unlimited), quoting the kept
/// prefix and appending the original length, then flatten it.
pub fn format_sql(sql: &str, max_len: usize) -> String {
    if max_len == 0 || sql.len() <= max_len {
        return flatten_query(sql);
    }
    let mut cut = max_len;
    while !sql.is_char_boundary(cut) {
        cut -= 1;
    }
    flatten_query(&format!("{:?}(len:{})", &sql[..cut], sql.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sql_is_only_flattened() {
        assert_eq!(format_sql("select 1\nfrom\tt", 100), "select 1 from t");
    }

    #[test]
    fn long_sql_is_truncated_with_length() {
        let sql = "select * from orders where id = 1";
        assert_eq!(format_sql(sql, 8), "\"select *\"(len:33)");
    }

    #[test]
    fn zero_disables_truncation() {
        let sql = "x".repeat(10_000);
        assert_eq!(format_sql(&sql, 0).len(), 10_000);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let sql = "select 'héllo'";
        let out = format_sql(sql, 10);
        assert!(out.starts_with("\"select 'h"));
    }
}
