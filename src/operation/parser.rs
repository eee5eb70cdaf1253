//! Statement Parser
//!
//! A small tokenizer and recursive-descent parser for the statement shapes
//! the coordinator needs to understand. Anything outside those shapes
//! becomes `Statement::Other` and is forwarded to the store verbatim.

use super::{Filter, Projection, Statement, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(String),
    Op(String),
    Sym(char),
}

/// Split SQL string on semicolons, respecting string literals
pub(super) fn split_sql_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut string_char = '"';
    let mut chars = sql.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if in_string {
            if c == '\\' {
                chars.next();
            } else if c == string_char {
                if chars.peek().map(|(_, nc)| *nc == string_char).unwrap_or(false) {
                    chars.next();
                } else {
                    in_string = false;
                }
            }
        } else {
            match c {
                '\'' | '"' | '`' => {
                    in_string = true;
                    string_char = c;
                }
                ';' => {
                    let stmt = sql[start..i].trim();
                    if !stmt.is_empty() {
                        statements.push(stmt);
                    }
                    start = i + 1;
                }
                _ => {}
            }
        }
    }

    let remaining = sql[start..].trim();
    if !remaining.is_empty() {
        statements.push(remaining);
    }

    statements
}

/// Strip leading SQL comments from a query
pub fn strip_leading_comments(query: &str) -> &str {
    let mut s = query.trim();
    loop {
        if s.starts_with("/*") {
            if let Some(end) = s.find("*/") {
                s = s[end + 2..].trim_start();
                continue;
            }
        }
        if s.starts_with("--") || s.starts_with('#') {
            match s.find('\n') {
                Some(end) => {
                    s = s[end + 1..].trim_start();
                    continue;
                }
                None => return "",
            }
        }
        break;
    }
    s
}

/// Check if a query modifies state
pub(super) fn is_write_query(query: &str) -> bool {
    let stripped = strip_leading_comments(query);
    let keyword = stripped
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    matches!(
        keyword.as_str(),
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE"
            | "CREATE" | "ALTER" | "DROP" | "RENAME" | "TRUNCATE"
            | "LOAD" | "CALL" | "GRANT" | "REVOKE"
    )
}

fn tokenize(sql: &str) -> Option<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = sql.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '`' {
            chars.next();
            let mut ident = String::new();
            loop {
                match chars.next() {
                    Some((_, '`')) => break,
                    Some((_, ch)) => ident.push(ch),
                    None => return None,
                }
            }
            tokens.push((start, Token::Word(ident)));
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut literal = String::new();
            loop {
                match chars.next() {
                    Some((_, '\\')) => literal.push(chars.next()?.1),
                    Some((_, ch)) if ch == c => {
                        if chars.peek().map(|(_, nc)| *nc == c).unwrap_or(false) {
                            chars.next();
                            literal.push(c);
                        } else {
                            break;
                        }
                    }
                    Some((_, ch)) => literal.push(ch),
                    None => return None,
                }
            }
            tokens.push((start, Token::Str(literal)));
        } else if c.is_ascii_digit() {
            let mut number = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if ch.is_ascii_digit() || ch == '.' || ch == 'e' || ch == 'E' {
                    number.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((start, Token::Num(number)));
        } else if c.is_alphabetic() || c == '_' || c == '@' {
            let mut word = String::new();
            while let Some(&(_, ch)) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' || ch == '$' || ch == '.' || ch == '@' {
                    word.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((start, Token::Word(word)));
        } else if matches!(c, '<' | '>' | '!' | '=') {
            chars.next();
            let mut op = c.to_string();
            if let Some(&(_, next)) = chars.peek() {
                if matches!(next, '=' | '>') {
                    op.push(next);
                    chars.next();
                }
            }
            tokens.push((start, Token::Op(op)));
        } else {
            chars.next();
            tokens.push((start, Token::Sym(c)));
        }
    }

    Some(tokens)
}

/// Unqualified name (`db.trans` -> `trans`)
fn unqualify(name: &str) -> String {
    name.rsplit('.').next().unwrap_or(name).to_string()
}

struct Parser<'a> {
    sql: &'a str,
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn rest(&self) -> &'a str {
        match self.tokens.get(self.pos) {
            Some((offset, _)) => self.sql[*offset..].trim(),
            None => "",
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> Option<()> {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    fn symbol(&mut self, symbol: char) -> Option<()> {
        match self.peek() {
            Some(Token::Sym(c)) if *c == symbol => {
                self.pos += 1;
                Some(())
            }
            _ => None,
        }
    }

    fn equals(&mut self) -> Option<()> {
        match self.next()? {
            Token::Op(op) if op == "=" => Some(()),
            _ => None,
        }
    }

    fn identifier(&mut self) -> Option<String> {
        match self.next()? {
            Token::Word(w) => Some(unqualify(&w)),
            _ => None,
        }
    }

    fn literal(&mut self) -> Option<Value> {
        let negative = self.symbol('-').is_some();
        match self.next()? {
            Token::Num(n) => {
                let n = if negative { format!("-{}", n) } else { n };
                match n.parse::<i64>() {
                    Ok(i) => Some(Value::Int(i)),
                    Err(_) => n.parse::<f64>().ok().map(Value::Float),
                }
            }
            Token::Str(s) if !negative => Some(Value::String(s)),
            Token::Word(w) if !negative => match w.to_ascii_uppercase().as_str() {
                "NULL" => Some(Value::Null),
                "TRUE" => Some(Value::Int(1)),
                "FALSE" => Some(Value::Int(0)),
                _ => None,
            },
            _ => None,
        }
    }

    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Option<T>) -> Option<Vec<T>> {
        let mut items = vec![item(self)?];
        while self.symbol(',').is_some() {
            items.push(item(self)?);
        }
        Some(items)
    }

    /// Optional WHERE clause running to the end of the statement
    fn filter(&mut self) -> Option<Filter> {
        if self.at_end() {
            return Some(Filter::All);
        }
        self.keyword("WHERE")?;

        let rest = self.rest().to_string();
        let mut terms = Vec::new();
        loop {
            let term = (|| {
                let column = self.identifier()?;
                self.equals()?;
                Some((column, self.literal()?))
            })();
            match term {
                Some(term) => terms.push(term),
                None => break,
            }
            if self.keyword("AND").is_none() {
                break;
            }
        }

        if !terms.is_empty() && self.at_end() {
            Some(Filter::Equals(terms))
        } else {
            self.pos = self.tokens.len();
            Some(Filter::Unsupported(rest))
        }
    }

    fn select(&mut self) -> Option<Statement> {
        self.keyword("SELECT")?;
        let projection = if self.symbol('*').is_some() {
            Projection::All
        } else {
            Projection::Columns(self.list(|p| p.identifier())?)
        };
        self.keyword("FROM")?;
        let table = self.identifier()?;
        let filter = self.filter()?;
        Some(Statement::Select {
            table,
            projection,
            filter,
        })
    }

    fn insert(&mut self) -> Option<Statement> {
        self.keyword("INSERT")?;
        let _ = self.keyword("INTO");
        let table = self.identifier()?;
        self.symbol('(')?;
        let columns = self.list(|p| p.identifier())?;
        self.symbol(')')?;
        if self.keyword("VALUES").is_none() {
            self.keyword("VALUE")?;
        }
        self.symbol('(')?;
        let values = self.list(|p| p.literal())?;
        self.symbol(')')?;
        if !self.at_end() || columns.len() != values.len() {
            return None;
        }
        Some(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn update(&mut self) -> Option<Statement> {
        self.keyword("UPDATE")?;
        let table = self.identifier()?;
        self.keyword("SET")?;
        let assignments = self.list(|p| {
            let column = p.identifier()?;
            p.equals()?;
            Some((column, p.literal()?))
        })?;
        let filter = self.filter()?;
        Some(Statement::Update {
            table,
            assignments,
            filter,
        })
    }

    fn delete(&mut self) -> Option<Statement> {
        self.keyword("DELETE")?;
        self.keyword("FROM")?;
        let table = self.identifier()?;
        let filter = self.filter()?;
        Some(Statement::Delete { table, filter })
    }
}

/// Best-effort table name for statements the parser does not model
fn extract_table_name(sql: &str) -> Option<String> {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
    let after = |keyword: &str| {
        upper
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|w| unqualify(w.trim_matches(|c| c == '`' || c == '(' || c == ';')))
    };

    match upper.first().map(String::as_str) {
        Some("INSERT") | Some("REPLACE") => after("INTO"),
        Some("UPDATE") => words.get(1).map(|w| unqualify(w.trim_matches('`'))),
        Some("DELETE") | Some("SELECT") => after("FROM"),
        Some("CREATE") | Some("DROP") | Some("ALTER") | Some("TRUNCATE") => after("TABLE"),
        _ => None,
    }
}

/// Parse a single statement (comments allowed before it)
pub(super) fn parse_statement(sql: &str) -> Statement {
    let sql = strip_leading_comments(sql);
    let fallback = || Statement::Other {
        table: extract_table_name(sql),
    };

    let Some(tokens) = tokenize(sql) else {
        return fallback();
    };
    let mut parser = Parser { sql, tokens, pos: 0 };

    let parsed = match parser.peek() {
        Some(Token::Word(w)) => match w.to_ascii_uppercase().as_str() {
            "SELECT" => parser.select(),
            "INSERT" => parser.insert(),
            "UPDATE" => parser.update(),
            "DELETE" => parser.delete(),
            _ => None,
        },
        _ => None,
    };

    parsed.unwrap_or_else(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_literals() {
        let parts = split_sql_statements("UPDATE t SET k = 'a;b' WHERE id = 1; SELECT 1;");
        assert_eq!(parts, vec!["UPDATE t SET k = 'a;b' WHERE id = 1", "SELECT 1"]);
    }

    #[test]
    fn test_write_detection_skips_comments() {
        assert!(is_write_query("/* app */ INSERT INTO trans (a) VALUES (1)"));
        assert!(is_write_query("-- note\nupdate trans set a = 1"));
        assert!(!is_write_query("SELECT * FROM trans"));
        assert!(!is_write_query("SHOW TABLES"));
    }

    #[test]
    fn test_parse_select_with_key() {
        let stmt = parse_statement("SELECT trans_id, `amount` FROM financedata.trans WHERE trans_id = 7");
        assert_eq!(
            stmt,
            Statement::Select {
                table: "trans".into(),
                projection: Projection::Columns(vec!["trans_id".into(), "amount".into()]),
                filter: Filter::Equals(vec![("trans_id".into(), Value::Int(7))]),
            }
        );
    }

    #[test]
    fn test_parse_update_with_escaped_string_and_negative() {
        let stmt = parse_statement("UPDATE trans SET k_symbol = 'it''s', balance = -12.5 WHERE trans_id = 'T-1'");
        assert_eq!(
            stmt,
            Statement::Update {
                table: "trans".into(),
                assignments: vec![
                    ("k_symbol".into(), Value::String("it's".into())),
                    ("balance".into(), Value::Float(-12.5)),
                ],
                filter: Filter::Equals(vec![("trans_id".into(), Value::String("T-1".into()))]),
            }
        );
    }

    #[test]
    fn test_unsupported_filter_is_kept_verbatim() {
        let stmt = parse_statement("DELETE FROM trans WHERE amount > 100 AND trans_id = 3");
        assert_eq!(
            stmt,
            Statement::Delete {
                table: "trans".into(),
                filter: Filter::Unsupported("amount > 100 AND trans_id = 3".into()),
            }
        );
    }

    #[test]
    fn test_unmodelled_statements_fall_back() {
        assert_eq!(
            parse_statement("INSERT INTO trans SELECT * FROM staging"),
            Statement::Other { table: Some("trans".into()) }
        );
        assert_eq!(
            parse_statement("SELECT COUNT(*) FROM trans"),
            Statement::Other { table: Some("trans".into()) }
        );
        assert_eq!(parse_statement("SHOW TABLES"), Statement::Other { table: None });
    }
}
