//! Query fingerprints: a statement with its literal values stripped.
//!
//! `SELECT * FROM t WHERE id = 42` and `select *  from t where id=7`
//! share the fingerprint `select * from t where id = ?`.

use regex::{Captures, Regex};

/// Compiled normalization rules.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    /// String literals, quoted identifiers and comments, matched in one
    /// left-to-right pass so a `--` inside a literal is not a comment.
    lexeme: Regex,
    placeholder: Regex,
    number: Regex,
    in_list: Regex,
    operator: Regex,
    whitespace: Regex,
}

impl Fingerprinter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // Unterminated literals and comments run to the end of input.
            lexeme: Regex::new(
                r#"(?s)'(?:[^']|'')*(?:'|$)|"(?:[^"]|"")*(?:"|$)|`(?:[^`]|``)*(?:`|$)|--[^\n]*|/\*.*?(?:\*/|$)"#,
            )?,
            placeholder: Regex::new(r"\$\d+|%\(\w+\)s|%s")?,
            number: Regex::new(r"\b\d+(?:\.\d+)?(?:[eE][-+]?\d+)?\b")?,
            in_list: Regex::new(r"(?i)\bin\s*\(\s*\?(?:\s*,\s*\?)*\s*\)")?,
            operator: Regex::new(r"\s*(<>|!=|<=|>=|=|<|>)\s*")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    /// Normalize `sql` into its fingerprint.
    pub fn fingerprint(&self, sql: &str) -> String {
        let s = self.lexeme.replace_all(sql, |caps: &Captures<'_>| {
            let lexeme = &caps[0];
            if lexeme.starts_with('\'') {
                "?".to_string()
            } else if lexeme.starts_with("--") || lexeme.starts_with("/*") {
                " ".to_string()
            } else {
                lexeme.to_string()
            }
        });
        let s = self.placeholder.replace_all(&s, "?");
        let s = self.number.replace_all(&s, "?");
        let s = self.in_list.replace_all(&s, "in (?)");
        let s = self.operator.replace_all(&s, " $1 ");
        let s = self.whitespace.replace_all(&s, " ");
        s.trim().trim_end_matches(';').trim_end().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(sql: &str) -> String {
        Fingerprinter::new().unwrap().fingerprint(sql)
    }

    #[test]
    fn literals_are_stripped() {
        assert_eq!(fp("SELECT * FROM t WHERE id = 42"), "select * from t where id = ?");
        assert_eq!(
            fp("SELECT * FROM users WHERE name = 'O''Brien' AND score > 3.5"),
            "select * from users where name = ? and score > ?"
        );
    }

    #[test]
    fn equivalent_queries_share_a_fingerprint() {
        assert_eq!(
            fp("SELECT * FROM t WHERE id = 42;"),
            fp("select *\n  from t  where id=7")
        );
        assert_eq!(fp("SELECT a FROM t WHERE id = $1"), fp("SELECT a FROM t WHERE id = 9"));
    }

    #[test]
    fn in_lists_collapse() {
        assert_eq!(
            fp("SELECT * FROM t WHERE id IN (1, 2, 3)"),
            fp("SELECT * FROM t WHERE id in (4)")
        );
    }

    #[test]
    fn identifiers_with_digits_are_kept() {
        assert_eq!(fp("SELECT c1 FROM t2"), "select c1 from t2");
    }

    #[test]
    fn comments_are_dropped() {
        assert_eq!(fp("SELECT 1 -- ping\n"), "select ?");
        assert_eq!(fp("/* app:orders */ SELECT 1"), "select ?");
    }

    #[test]
    fn comment_markers_inside_literals_are_literal() {
        assert_eq!(
            fp("SELECT * FROM t WHERE note = '--' FOR UPDATE"),
            "select * from t where note = ? for update"
        );
        assert_eq!(
            fp("SELECT * FROM t WHERE note = '/*' FOR UPDATE"),
            "select * from t where note = ? for update"
        );
        assert_ne!(
            fp("SELECT * FROM t WHERE note = '--'"),
            fp("SELECT * FROM t WHERE note = '--' FOR UPDATE")
        );
    }

    #[test]
    fn quotes_inside_comments_do_not_open_literals() {
        assert_eq!(fp("SELECT 1 -- it's fine\nFOR UPDATE"), "select ? for update");
    }

    #[test]
    fn quoted_identifiers_are_kept() {
        assert_eq!(fp(r#"SELECT "--x" FROM t"#), r#"select "--x" from t"#);
    }
}
