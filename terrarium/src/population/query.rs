//! The row-filter expression language.
//!
//! Views and observations filter the population with small predicate
//! strings: `column op literal` terms combined with `and`/`or`, with
//! parentheses and `not`. Literals are quoted strings, integers, floats,
//! and booleans. Null cells never match a comparison.

use super::table::{Frame, PopulationError, SimIndex, StateTable, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp {
        column: String,
        op: CmpOp,
        literal: Value,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// A parsed filter. The empty query matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    text: String,
    expr: Option<Expr>,
}

impl Query {
    pub fn empty() -> Self {
        Query::default()
    }

    pub fn parse(text: &str) -> Result<Self, PopulationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Query::empty());
        }
        let tokens = tokenize(trimmed).map_err(|reason| PopulationError::InvalidQuery {
            query: text.to_string(),
            reason,
        })?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser
            .parse_or()
            .and_then(|expr| {
                if parser.pos == parser.tokens.len() {
                    Ok(expr)
                } else {
                    Err(format!("unexpected trailing input at token {}", parser.pos))
                }
            })
            .map_err(|reason| PopulationError::InvalidQuery {
                query: text.to_string(),
                reason,
            })?;
        Ok(Query {
            text: trimmed.to_string(),
            expr: Some(expr),
        })
    }

    /// A `column == value` query built directly, bypassing the parser.
    pub fn equals(column: &str, value: impl Into<Value>) -> Self {
        let literal = value.into();
        let text = format!("{column} == {literal}");
        Query {
            text,
            expr: Some(Expr::Cmp {
                column: column.to_string(),
                op: CmpOp::Eq,
                literal,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.expr.is_none()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The conjunction of two queries.
    pub fn and(self, other: Query) -> Query {
        match (self.expr, other.expr) {
            (None, None) => Query::empty(),
            (Some(e), None) => Query {
                text: self.text,
                expr: Some(e),
            },
            (None, Some(e)) => Query {
                text: other.text,
                expr: Some(e),
            },
            (Some(a), Some(b)) => Query {
                text: format!("{} and {}", self.text, other.text),
                expr: Some(Expr::And(Box::new(a), Box::new(b))),
            },
        }
    }

    /// Evaluate against a single row through a cell lookup. A null cell
    /// fails any comparison it appears in.
    pub fn matches(
        &self,
        lookup: &dyn Fn(&str) -> Result<Option<Value>, PopulationError>,
    ) -> Result<bool, PopulationError> {
        match &self.expr {
            None => Ok(true),
            Some(expr) => eval(expr, lookup, &self.text),
        }
    }
}

fn eval(
    expr: &Expr,
    lookup: &dyn Fn(&str) -> Result<Option<Value>, PopulationError>,
    query_text: &str,
) -> Result<bool, PopulationError> {
    match expr {
        Expr::And(a, b) => Ok(eval(a, lookup, query_text)? && eval(b, lookup, query_text)?),
        Expr::Or(a, b) => Ok(eval(a, lookup, query_text)? || eval(b, lookup, query_text)?),
        Expr::Not(inner) => Ok(!eval(inner, lookup, query_text)?),
        Expr::Cmp {
            column,
            op,
            literal,
        } => {
            let Some(cell) = lookup(column)? else {
                return Ok(false);
            };
            let Some(ordering) = cell.partial_cmp_value(literal) else {
                return Err(PopulationError::InvalidQuery {
                    query: query_text.to_string(),
                    reason: format!(
                        "cannot compare column '{column}' ({}) with {} literal",
                        cell.dtype(),
                        literal.dtype()
                    ),
                });
            };
            Ok(match op {
                CmpOp::Eq => ordering.is_eq(),
                CmpOp::Ne => !ordering.is_eq(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(Value),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (op, len) = match two.as_str() {
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    "<=" => (CmpOp::Le, 2),
                    ">=" => (CmpOp::Ge, 2),
                    _ if c == '<' => (CmpOp::Lt, 1),
                    _ if c == '>' => (CmpOp::Gt, 1),
                    other => return Err(format!("unrecognised operator '{other}'")),
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j == chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                let s: String = chars[start..j].iter().collect();
                tokens.push(Token::Literal(Value::Str(s)));
                i = j + 1;
            }
            _ if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len()
                    && (chars[j].is_ascii_digit() || chars[j] == '.' || chars[j] == 'e' || chars[j] == '-')
                {
                    j += 1;
                }
                let s: String = chars[start..j].iter().collect();
                let value = if s.contains('.') || s.contains('e') {
                    Value::Float(s.parse::<f64>().map_err(|_| format!("bad number '{s}'"))?)
                } else {
                    Value::Int(s.parse::<i64>().map_err(|_| format!("bad number '{s}'"))?)
                };
                tokens.push(Token::Literal(value));
                i = j;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Value::Bool(true)),
                    "false" | "False" => Token::Literal(Value::Bool(false)),
                    _ => Token::Ident(word),
                });
                i = j;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_primary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.parse_primary()?))),
            Some(Token::Ident(column)) => {
                let Some(Token::Op(op)) = self.next() else {
                    return Err(format!("expected a comparison operator after '{column}'"));
                };
                let Some(Token::Literal(literal)) = self.next() else {
                    return Err(format!("expected a literal after '{column} {op}'"));
                };
                Ok(Expr::Cmp {
                    column,
                    op,
                    literal,
                })
            }
            other => Err(format!("expected a comparison, got {other:?}")),
        }
    }
}

impl StateTable {
    /// Rows of `index` matching the query, evaluated against the full table
    /// (queries may reference columns a view does not carry).
    pub fn filter_index(
        &self,
        index: &SimIndex,
        query: &Query,
    ) -> Result<SimIndex, PopulationError> {
        if query.is_empty() {
            return Ok(index.clone());
        }
        let mut out = Vec::with_capacity(index.len());
        for &row in index.iter() {
            let lookup = |name: &str| -> Result<Option<Value>, PopulationError> {
                let column = self
                    .column(name)
                    .ok_or_else(|| PopulationError::MissingColumns(vec![name.to_string()]))?;
                Ok(column.get(row))
            };
            if query.matches(&lookup)? {
                out.push(row);
            }
        }
        Ok(SimIndex::new(out))
    }
}

impl Frame {
    /// Row positions matching the query, evaluated against this frame's
    /// columns (which may include synthetic observation inputs).
    pub fn filter_positions(&self, query: &Query) -> Result<Vec<usize>, PopulationError> {
        if query.is_empty() {
            return Ok((0..self.len()).collect());
        }
        let mut out = Vec::with_capacity(self.len());
        for pos in 0..self.len() {
            let lookup = |name: &str| -> Result<Option<Value>, PopulationError> {
                if !self.has_column(name) {
                    return Err(PopulationError::MissingColumns(vec![name.to_string()]));
                }
                Ok(self.cell(pos, name))
            };
            if query.matches(&lookup)? {
                out.push(pos);
            }
        }
        Ok(out)
    }

    pub fn filter(&self, query: &Query) -> Result<Frame, PopulationError> {
        Ok(self.take_rows(&self.filter_positions(query)?))
    }
}

#[cfg(test)]
mod tests {
    use super::super::table::Series;
    use super::*;

    fn table() -> StateTable {
        let mut table = StateTable::new("population_manager");
        let index = table.grow(4);
        table
            .add_column(
                "c",
                &Series::strs(
                    "group",
                    index.clone(),
                    vec!["A".into(), "B".into(), "A".into(), "B".into()],
                ),
            )
            .unwrap();
        table
            .add_column(
                "c",
                &Series::floats("age", index, vec![10.0, 20.0, 30.0, 40.0]),
            )
            .unwrap();
        table
    }

    #[test]
    fn comparisons_and_conjunctions() {
        let table = table();
        let index = table.full_index();
        let q = Query::parse("group == 'A' and age >= 20").unwrap();
        assert_eq!(SimIndex::new(vec![2]), table.filter_index(&index, &q).unwrap());

        let q = Query::parse("group == \"A\" or age > 35").unwrap();
        assert_eq!(
            SimIndex::new(vec![0, 2, 3]),
            table.filter_index(&index, &q).unwrap()
        );
    }

    #[test]
    fn parens_and_not() {
        let table = table();
        let index = table.full_index();
        let q = Query::parse("not (group == 'A' or age > 35)").unwrap();
        assert_eq!(SimIndex::new(vec![1]), table.filter_index(&index, &q).unwrap());
    }

    #[test]
    fn tracked_style_boolean_terms() {
        let table = table();
        let q = Query::parse("tracked == True").unwrap();
        assert_eq!(4, table.filter_index(&table.full_index(), &q).unwrap().len());
    }

    #[test]
    fn missing_query_column_is_an_error() {
        let table = table();
        let q = Query::parse("nope == 1").unwrap();
        assert!(matches!(
            table.filter_index(&table.full_index(), &q),
            Err(PopulationError::MissingColumns(_))
        ));
    }

    #[test]
    fn type_confusion_is_an_error() {
        let table = table();
        let q = Query::parse("age == 'young'").unwrap();
        assert!(matches!(
            table.filter_index(&table.full_index(), &q),
            Err(PopulationError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn malformed_queries_fail_to_parse() {
        assert!(Query::parse("group ==").is_err());
        assert!(Query::parse("and group == 'A'").is_err());
        assert!(Query::parse("group = 'A'").is_err());
    }

    #[test]
    fn int_literals_compare_against_float_columns() {
        let table = table();
        let q = Query::parse("age <= 20").unwrap();
        assert_eq!(
            SimIndex::new(vec![0, 1]),
            table.filter_index(&table.full_index(), &q).unwrap()
        );
    }
}
