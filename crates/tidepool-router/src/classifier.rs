//! Stateless query classifier.
//!
//! Purely syntactic: keywords and structure, never execution. Anything that
//! cannot be shown to be a read is treated as a write, because sending a
//! write-like statement to a replica is the riskier mistake.

use serde::{Deserialize, Serialize};

use tidepool_core::{ParamShape, QueryCategory, TransactionControl};

/// Result of classifying one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: QueryCategory,
    /// Set for `TransactionStatement`s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionControl>,
}

impl Classification {
    fn of(category: QueryCategory) -> Self {
        Self {
            category,
            transaction: None,
        }
    }

    fn transaction(control: TransactionControl) -> Self {
        Self {
            category: QueryCategory::TransactionStatement,
            transaction: Some(control),
        }
    }
}

const AGGREGATES: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "ARRAY_AGG", "STRING_AGG", "JSON_AGG", "GROUP_CONCAT",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "JOIN", "UNION", "INTERSECT", "EXCEPT", "GROUP", "HAVING", "DISTINCT", "OVER", "WINDOW",
];

/// Keywords that end a FROM clause at depth 0.
const FROM_TERMINATORS: &[&str] = &[
    "WHERE", "ORDER", "LIMIT", "GROUP", "HAVING", "OFFSET", "FETCH", "FOR", "UNION", "WINDOW", ";",
];

const WRITE_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "REPLACE", "UPSERT"];

/// Classify `sql` executed with `params`.
pub fn classify(sql: &str, params: &serde_json::Value) -> Classification {
    let tokens = tokenize(sql);
    classify_tokens(&tokens, ParamShape::of(params))
}

fn classify_tokens(tokens: &[String], shape: ParamShape) -> Classification {
    let Some(first) = tokens.first() else {
        return Classification::of(QueryCategory::WriteSimple);
    };
    let has = |word: &str| tokens.iter().any(|t| t == word);

    match first.as_str() {
        "BEGIN" => Classification::transaction(TransactionControl::Begin),
        "START" if tokens.get(1).is_some_and(|t| t == "TRANSACTION") => {
            Classification::transaction(TransactionControl::Begin)
        }
        "COMMIT" | "END" => Classification::transaction(TransactionControl::Commit),
        "ROLLBACK" | "ABORT" if has("TO") => {
            Classification::transaction(TransactionControl::RollbackToSavepoint)
        }
        "ROLLBACK" | "ABORT" => Classification::transaction(TransactionControl::Rollback),
        "SAVEPOINT" => Classification::transaction(TransactionControl::Savepoint),
        "RELEASE" => Classification::transaction(TransactionControl::ReleaseSavepoint),

        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "RENAME" | "COMMENT" | "GRANT" | "REVOKE" => {
            Classification::of(QueryCategory::Ddl)
        }

        "SELECT" => Classification::of(classify_select(tokens)),
        "WITH" if tokens.iter().any(|t| WRITE_VERBS.contains(&t.as_str())) => {
            Classification::of(QueryCategory::WriteSimple)
        }
        "WITH" => Classification::of(QueryCategory::ReadComplex),
        "SHOW" | "DESCRIBE" | "DESC" => Classification::of(QueryCategory::ReadSimple),
        "EXPLAIN" => {
            // EXPLAIN ANALYZE runs the statement, so classify what it wraps.
            let inner = tokens
                .iter()
                .position(|t| matches!(t.as_str(), "SELECT" | "WITH") || WRITE_VERBS.contains(&t.as_str()));
            match inner {
                Some(i) => classify_tokens(&tokens[i..], shape),
                None => Classification::of(QueryCategory::WriteSimple),
            }
        }

        "INSERT" | "REPLACE" | "UPSERT" => Classification::of(classify_insert(tokens, shape)),
        "UPDATE" | "DELETE" => {
            if shape.rows() > 1 || !has("WHERE") {
                Classification::of(QueryCategory::WriteBulk)
            } else {
                Classification::of(QueryCategory::WriteSimple)
            }
        }
        "MERGE" | "COPY" | "LOAD" => Classification::of(QueryCategory::WriteBulk),

        _ => Classification::of(QueryCategory::WriteSimple),
    }
}

fn classify_select(tokens: &[String]) -> QueryCategory {
    // Row locks and SELECT INTO need the primary.
    let locks = tokens
        .windows(2)
        .any(|w| w[0] == "FOR" && matches!(w[1].as_str(), "UPDATE" | "SHARE" | "NO" | "KEY"));
    if locks || tokens.iter().any(|t| t == "INTO") {
        return QueryCategory::WriteSimple;
    }

    let selects = tokens.iter().filter(|t| *t == "SELECT").count();
    let keyword = tokens.iter().any(|t| COMPLEX_KEYWORDS.contains(&t.as_str()));
    let aggregate = tokens
        .windows(2)
        .any(|w| AGGREGATES.contains(&w[0].as_str()) && w[1] == "(");

    if selects > 1 || keyword || aggregate || multi_table_from(tokens) {
        QueryCategory::ReadComplex
    } else {
        QueryCategory::ReadSimple
    }
}

/// `FROM a, b`, an implicit join.
fn multi_table_from(tokens: &[String]) -> bool {
    let mut depth = 0i32;
    let mut in_from = false;
    for t in tokens {
        match t.as_str() {
            "(" => depth += 1,
            ")" => depth -= 1,
            "FROM" if depth == 0 => in_from = true,
            "," if depth == 0 && in_from => return true,
            word if depth == 0 && in_from && FROM_TERMINATORS.contains(&word) => in_from = false,
            _ => {}
        }
    }
    false
}

fn classify_insert(tokens: &[String], shape: ParamShape) -> QueryCategory {
    if shape.rows() > 1 || tokens.iter().any(|t| t == "SELECT") {
        return QueryCategory::WriteBulk;
    }
    let Some(values) = tokens.iter().position(|t| t == "VALUES") else {
        return QueryCategory::WriteSimple;
    };

    let mut depth = 0i32;
    let mut tuples = 0;
    for t in &tokens[values + 1..] {
        match t.as_str() {
            "(" => {
                if depth == 0 {
                    tuples += 1;
                }
                depth += 1;
            }
            ")" => depth -= 1,
            "ON" | "RETURNING" | ";" if depth == 0 => break,
            _ => {}
        }
    }
    if tuples > 1 {
        QueryCategory::WriteBulk
    } else {
        QueryCategory::WriteSimple
    }
}

/// Split SQL into uppercase words and structural punctuation.
///
/// Comments are dropped and literals become `?`, so keywords inside
/// strings or comments never influence the result.
fn tokenize(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '\'' | '"' | '`' => {
                let quote = c;
                i += 1;
                while i < chars.len() {
                    if chars[i] == quote {
                        // Doubled quote is an escaped quote.
                        if chars.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
                tokens.push("?".to_string());
            }
            '(' | ')' | ',' | ';' => {
                tokens.push(c.to_string());
                i += 1;
            }
            c if c.is_alphanumeric() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(chars[start..i].iter().collect::<String>().to_uppercase());
            }
            _ => i += 1,
        }
    }
    tokens
}
