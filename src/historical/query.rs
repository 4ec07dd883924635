//! SQL text handling for the historical workflow
//!
//! A small lexer is enough for what the workflow needs: rejecting anything
//! that is not a single read query, and comparing WHERE-clause literals
//! between a generated query and its revalidated version.

use super::QueryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    /// String or numeric literal, raw text including quotes.
    Literal(String),
    Symbol(char),
}

/// Strip markdown fences and trailing terminators from model output.
pub fn clean_query(raw: &str) -> String {
    raw.replace("```sql", "")
        .replace("```SQL", "")
        .replace("```", "")
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .trim()
        .to_string()
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>, QueryError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if (c == '-' && chars.get(i + 1) == Some(&'-')) || (c == '/' && chars.get(i + 1) == Some(&'*')) {
            return Err(QueryError::Rejected("comments are not allowed".to_string()));
        }

        match c {
            '\'' => {
                let start = i;
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(QueryError::Rejected("unterminated string literal".to_string()))
                        }
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => i += 2,
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                tokens.push(Token::Literal(chars[start..i].iter().collect()));
            }
            '"' | '`' => {
                let quote = c;
                let start = i + 1;
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(QueryError::Rejected("unterminated quoted identifier".to_string()));
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Literal(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => {
                tokens.push(Token::Symbol(other));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

const FORBIDDEN: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "GRANT", "REVOKE", "MERGE", "UPSERT",
];

fn is_word(token: &Token, word: &str) -> bool {
    matches!(token, Token::Word(w) if w.eq_ignore_ascii_case(word))
}

/// Accept only a single SELECT (or WITH ... SELECT) statement.
pub fn ensure_read_only(sql: &str) -> Result<(), QueryError> {
    let tokens = tokenize(sql)?;

    let first = tokens
        .first()
        .ok_or_else(|| QueryError::Rejected("empty query".to_string()))?;

    if !(is_word(first, "SELECT") || is_word(first, "WITH")) {
        return Err(QueryError::Rejected(
            "only SELECT queries are allowed".to_string(),
        ));
    }

    if tokens.iter().any(|t| *t == Token::Symbol(';')) {
        return Err(QueryError::Rejected(
            "multiple statements are not allowed".to_string(),
        ));
    }

    for (idx, token) in tokens.iter().enumerate() {
        if let Token::Word(word) = token {
            let upper = word.to_ascii_uppercase();
            if FORBIDDEN.contains(&upper.as_str()) {
                return Err(QueryError::Rejected(format!(
                    "statement contains forbidden keyword {}",
                    upper
                )));
            }
            // replace() is a scalar function; REPLACE INTO is a write.
            if upper == "REPLACE" && tokens.get(idx + 1).map(|t| is_word(t, "INTO")).unwrap_or(false) {
                return Err(QueryError::Rejected(
                    "statement contains forbidden keyword REPLACE".to_string(),
                ));
            }
        }
    }

    Ok(())
}

const CLAUSE_END: &[&str] = &[
    "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "EXCEPT", "INTERSECT", "WINDOW", "OFFSET",
];

/// Literals appearing inside WHERE predicates, in order of appearance.
/// Unlexable text yields no literals.
pub fn where_literals(sql: &str) -> Vec<String> {
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(_) => return Vec::new(),
    };

    let mut literals = Vec::new();
    let mut depth: i32 = 0;
    let mut open_where: Vec<i32> = Vec::new();

    for token in &tokens {
        match token {
            Token::Symbol('(') => depth += 1,
            Token::Symbol(')') => {
                depth -= 1;
                open_where.retain(|d| *d <= depth);
            }
            Token::Word(w) if w.eq_ignore_ascii_case("WHERE") => open_where.push(depth),
            Token::Word(w) if CLAUSE_END.iter().any(|k| w.eq_ignore_ascii_case(k)) => {
                open_where.retain(|d| *d != depth);
            }
            Token::Literal(lit) if !open_where.is_empty() => literals.push(lit.clone()),
            _ => {}
        }
    }

    literals
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revalidation {
    /// The revalidated query is used.
    Accepted(String),
    /// The original query is kept.
    Restored { query: String, reason: String },
}

impl Revalidation {
    pub fn query(&self) -> &str {
        match self {
            Revalidation::Accepted(q) => q,
            Revalidation::Restored { query, .. } => query,
        }
    }
}

/// Decide between the generated query and its revalidated version.
///
/// Every literal of the original WHERE predicates must appear byte-identical
/// in the revalidated predicates, and the revalidated text must still be a
/// single read query. Otherwise the original is kept.
pub fn reconcile(original: &str, revalidated: &str) -> Revalidation {
    let candidate = clean_query(revalidated);

    if candidate.is_empty() {
        return Revalidation::Restored {
            query: original.to_string(),
            reason: "revalidation returned nothing".to_string(),
        };
    }

    if let Err(e) = ensure_read_only(&candidate) {
        return Revalidation::Restored {
            query: original.to_string(),
            reason: format!("revalidated query rejected: {}", e),
        };
    }

    let mut remaining = where_literals(&candidate);
    for literal in where_literals(original) {
        match remaining.iter().position(|l| *l == literal) {
            Some(pos) => {
                remaining.remove(pos);
            }
            None => {
                return Revalidation::Restored {
                    query: original.to_string(),
                    reason: format!("filter literal {} was altered", literal),
                }
            }
        }
    }

    Revalidation::Accepted(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_fences_and_terminator() {
        assert_eq!(
            clean_query("```sql\nSELECT close FROM prices WHERE ticker = 'MSFT';\n```"),
            "SELECT close FROM prices WHERE ticker = 'MSFT'"
        );
        assert_eq!(clean_query("  SELECT 1 ;; "), "SELECT 1");
    }

    #[test]
    fn read_only_guard() {
        assert!(ensure_read_only("SELECT close FROM prices WHERE ticker = 'AAPL'").is_ok());
        assert!(ensure_read_only("with t as (select 1) select * from t").is_ok());
        assert!(ensure_read_only("SELECT replace(name, 'a', 'b') FROM companies").is_ok());
        assert!(ensure_read_only("SELECT * FROM t WHERE note = 'drop table x; delete'").is_ok());

        for bad in [
            "",
            "DELETE FROM prices",
            "UPDATE prices SET close = 0",
            "SELECT 1; DROP TABLE prices",
            "SELECT * FROM prices -- comment",
            "SELECT * FROM prices /* c */",
            "WITH x AS (SELECT 1) INSERT INTO t SELECT * FROM x",
            "PRAGMA table_info(prices)",
            "ATTACH DATABASE 'x.db' AS x",
            "SELECT 'unterminated",
            "REPLACE INTO prices VALUES (1)",
        ] {
            assert!(
                matches!(ensure_read_only(bad), Err(QueryError::Rejected(_))),
                "accepted: {bad}"
            );
        }
    }

    #[test]
    fn collects_where_literals_only() {
        let sql = "SELECT date, close FROM prices WHERE ticker = 'AAPL' AND date >= '2021-01-01' ORDER BY date LIMIT 5";
        assert_eq!(where_literals(sql), vec!["'AAPL'", "'2021-01-01'"]);

        let nested = "SELECT * FROM (SELECT * FROM prices WHERE ticker = 'O''NEIL') p LIMIT 3";
        assert_eq!(where_literals(nested), vec!["'O''NEIL'"]);

        assert!(where_literals("SELECT 'AAPL' FROM prices").is_empty());
    }

    #[test]
    fn ticker_substitution_keeps_original() {
        let original = "SELECT close FROM prices WHERE ticker = 'MSFT'";
        let result = reconcile(original, "SELECT close FROM prices WHERE ticker = 'AAPL'");
        assert!(matches!(result, Revalidation::Restored { .. }));
        assert_eq!(result.query(), original);

        let dropped = reconcile(original, "SELECT close FROM prices");
        assert_eq!(dropped.query(), original);
    }

    #[test]
    fn harmless_revalidation_is_accepted() {
        let original = "SELECT close FROM prices WHERE ticker = 'MSFT'";
        let revalidated = "```sql\nSELECT p.close FROM prices p WHERE p.ticker = 'MSFT' ORDER BY p.date\n```";
        let result = reconcile(original, revalidated);
        assert_eq!(
            result,
            Revalidation::Accepted(
                "SELECT p.close FROM prices p WHERE p.ticker = 'MSFT' ORDER BY p.date".to_string()
            )
        );
    }

    #[test]
    fn unsafe_revalidation_is_discarded() {
        let original = "SELECT close FROM prices WHERE ticker = 'MSFT'";
        let result = reconcile(original, "DELETE FROM prices WHERE ticker = 'MSFT'");
        assert_eq!(result.query(), original);
    }
}
