//! Deterministic, dependency-free CSV rendering.
//!
//! The export format is small and fixed-column (no quoting edge cases
//! beyond commas/quotes/newlines in free-text fields), so this hand-rolls
//! RFC 4180 escaping rather than pulling in a CSV crate the rest of the
//! stack has no other use for.

pub fn escape_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_row(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push_str(&header.iter().map(|h| escape_field(h)).collect::<Vec<_>>().join(","));
    out.push_str("\r\n");
    for row in rows {
        out.push_str(&render_row(row));
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_commas_and_quotes() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn renders_deterministic_table() {
        let table = render_table(
            &["a", "b"],
            &[vec!["1".to_string(), "2".to_string()], vec!["3".to_string(), "4".to_string()]],
        );
        assert_eq!(table, "a,b\r\n1,2\r\n3,4\r\n");
    }
}
