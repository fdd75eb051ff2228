//! Combination filter expressions.
//!
//! A small boolean language over axis comparisons, used both to prune
//! the cartesian product of a matrix and to pick the touchstone set:
//!
//! ```text
//! os == "linux" && !(arch != "amd64") || jdk == "21"
//! ```
//!
//! Malformed input is rejected when the filter is constructed, never at
//! evaluation time, so a stored filter can always be applied.

use crucible_core::axes::Combination;
use crucible_core::error::{Error, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Value(String),
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Expr {
    /// `axis == "value"` or, negated, `axis != "value"`. A combination
    /// without the axis fails `==` and passes `!=`.
    Cmp {
        axis: String,
        value: String,
        negated: bool,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed, reusable filter over combinations.
#[derive(Debug, Clone)]
pub struct CombinationFilter {
    expression: String,
    root: Expr,
}

impl CombinationFilter {
    pub fn parse(expression: &str) -> Result<Self> {
        let malformed = |message: String| Error::MalformedFilter {
            expression: expression.to_string(),
            message,
        };
        let tokens = tokenize(expression).map_err(malformed)?;
        if tokens.is_empty() {
            return Err(malformed("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or_expr().map_err(malformed)?;
        if parser.pos != parser.tokens.len() {
            return Err(malformed(format!(
                "unexpected trailing input at token {}",
                parser.pos + 1
            )));
        }
        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    pub fn eval(&self, combination: &Combination) -> bool {
        eval(&self.root, combination)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for CombinationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

fn eval(expr: &Expr, combination: &Combination) -> bool {
    match expr {
        Expr::Cmp {
            axis,
            value,
            negated,
        } => {
            let matches = combination.get(axis) == Some(value.as_str());
            matches != *negated
        }
        Expr::Not(inner) => !eval(inner, combination),
        Expr::And(a, b) => eval(a, combination) && eval(b, combination),
        Expr::Or(a, b) => eval(a, combination) || eval(b, combination),
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Eq),
                    _ => return Err("expected `==`".to_string()),
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some('&') => tokens.push(Token::And),
                    _ => return Err("expected `&&`".to_string()),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some('|') => tokens.push(Token::Or),
                    _ => return Err("expected `||`".to_string()),
                }
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Value(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => return Err(format!("unexpected character `{c}`")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

// Precedence, loosest first: `||`, `&&`, `!`, comparison/parens.
impl Parser {
    fn or_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat(&Token::LParen) {
            let inner = self.or_expr()?;
            if !self.eat(&Token::RParen) {
                return Err("expected `)`".to_string());
            }
            return Ok(inner);
        }
        let axis = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(format!("expected an axis name, found {other:?}")),
        };
        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            other => return Err(format!("expected `==` or `!=` after axis, found {other:?}")),
        };
        let value = match self.next() {
            Some(Token::Value(v)) | Some(Token::Ident(v)) => v,
            other => return Err(format!("expected a value, found {other:?}")),
        };
        Ok(Expr::Cmp {
            axis,
            value,
            negated,
        })
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}
