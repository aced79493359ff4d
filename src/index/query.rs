//! Parser and evaluator for the Solr query subset the filter translator
//! emits: `*:*`, `field:term`, `field:[lo TO hi]` (with `{`/`}` for
//! exclusive bounds and `*` for open ones), `AND`, `OR`, `NOT` and
//! parentheses. Backslash escapes are honoured in field names and terms.

use thiserror::Error;

use super::IndexDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    All,
    Term {
        field: String,
        value: String,
    },
    Range {
        field: String,
        lower: Option<String>,
        upper: Option<String>,
        include_lower: bool,
        include_upper: bool,
    },
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid query at offset {offset}: {message}")]
pub struct QueryParseError {
    pub offset: usize,
    pub message: String,
}

impl Query {
    pub fn matches(&self, doc: &IndexDocument) -> bool {
        match self {
            Query::All => true,
            Query::Term { field, value } => doc.values(field).any(|v| v == value),
            Query::Range {
                field,
                lower,
                upper,
                include_lower,
                include_upper,
            } => doc.values(field).any(|v| {
                let above = match lower {
                    Some(l) if *include_lower => v >= l.as_str(),
                    Some(l) => v > l.as_str(),
                    None => true,
                };
                let below = match upper {
                    Some(u) if *include_upper => v <= u.as_str(),
                    Some(u) => v < u.as_str(),
                    None => true,
                };
                above && below
            }),
            Query::And(a, b) => a.matches(doc) && b.matches(doc),
            Query::Or(a, b) => a.matches(doc) || b.matches(doc),
            Query::Not(q) => !q.matches(doc),
        }
    }
}

pub fn parse(input: &str) -> Result<Query, QueryParseError> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let query = parser.parse_or()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(query)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn error(&self, message: &str) -> QueryParseError {
        QueryParseError {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        let end = self.pos + keyword.len();
        if end > self.chars.len() {
            return false;
        }
        let matches = self.chars[self.pos..end].iter().copied().eq(keyword.chars());
        matches
            && self
                .chars
                .get(end)
                .map_or(true, |c| c.is_whitespace() || *c == '(')
    }

    fn parse_or(&mut self) -> Result<Query, QueryParseError> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.at_keyword("OR") {
                self.pos += 2;
                let right = self.parse_and()?;
                left = Query::Or(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Query, QueryParseError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_ws();
            if self.at_keyword("AND") {
                self.pos += 3;
                let right = self.parse_unary()?;
                left = Query::And(Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Query, QueryParseError> {
        self.skip_ws();
        if self.at_keyword("NOT") {
            self.pos += 3;
            let inner = self.parse_unary()?;
            return Ok(Query::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Query, QueryParseError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of query")),
            Some('(') => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.error("expected ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(_) => self.parse_clause(),
        }
    }

    fn parse_clause(&mut self) -> Result<Query, QueryParseError> {
        if self.at_match_all() {
            self.pos += 3;
            return Ok(Query::All);
        }

        let field = self.read_escaped(|c| c == ':' || c == '(' || c == ')' || c.is_whitespace());
        if field.is_empty() || self.peek() != Some(':') {
            return Err(self.error("expected field:value"));
        }
        self.pos += 1;

        match self.peek() {
            Some('[') | Some('{') => self.parse_range(field),
            _ => {
                let value = self.read_escaped(|c| c == ')' || c.is_whitespace());
                if value.is_empty() {
                    return Err(self.error("empty term"));
                }
                Ok(Query::Term { field, value })
            }
        }
    }

    fn at_match_all(&self) -> bool {
        self.chars.get(self.pos..self.pos + 3) == Some(&['*', ':', '*'][..])
    }

    fn parse_range(&mut self, field: String) -> Result<Query, QueryParseError> {
        let include_lower = self.peek() == Some('[');
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ']' || c == '}' {
                break;
            }
            self.pos += 1;
        }
        let close = self.peek().ok_or_else(|| self.error("unterminated range"))?;
        let body: String = self.chars[start..self.pos].iter().collect();
        self.pos += 1;

        let parts: Vec<&str> = body.split_whitespace().collect();
        if parts.len() != 3 || parts[1] != "TO" {
            return Err(self.error("range must be [lower TO upper]"));
        }
        let bound = |s: &str| (s != "*").then(|| s.to_string());
        Ok(Query::Range {
            field,
            lower: bound(parts[0]),
            upper: bound(parts[2]),
            include_lower,
            include_upper: close == ']',
        })
    }

    /// Read until `stop` matches an unescaped char, unescaping as we go.
    fn read_escaped(&mut self, stop: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                if let Some(next) = self.chars.get(self.pos + 1) {
                    out.push(*next);
                    self.pos += 2;
                    continue;
                }
            }
            if stop(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }
}
