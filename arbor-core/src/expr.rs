//! Small boolean expression language used by queries and access rules.
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | primary
//! primary := "(" expr ")" | operand ( cmp operand )?
//! cmp     := "==" | "!=" | "<" | "<=" | ">" | ">="
//! operand := number | 'string' | "string" | true | false | null | ident
//! ident   := name ( "." name )*        e.g. age, auth.username, $uid
//! ```
//!
//! Identifiers are resolved by the caller, so the same grammar serves
//! `age > 25` against a query candidate and `auth.id == $uid` against an
//! access rule. A lone operand is truthy unless it is missing, `null` or
//! `false`.

use serde_json::Number;
use thiserror::Error;

use crate::node::Value;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Unexpected character '{ch}' at {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("Unterminated string starting at {0}")]
    UnterminatedString(usize),

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Ident(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(Vec<String>),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Literal(v) => write!(f, "{}", v.to_json()),
            Token::Ident(parts) => write!(f, "{}", parts.join(".")),
            Token::Cmp(op) => write!(f, "{op:?}"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
        }
    }
}

/// A parsed expression, ready to evaluate any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if let Some(extra) = parser.tokens.get(parser.pos) {
            return Err(ExprError::UnexpectedToken(extra.to_string()));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with `resolve` supplying identifier values.
    pub fn evaluate(&self, resolve: &dyn Fn(&[String]) -> Option<Value>) -> bool {
        eval(&self.root, resolve)
    }
}

fn eval(expr: &Expr, resolve: &dyn Fn(&[String]) -> Option<Value>) -> bool {
    match expr {
        Expr::Or(a, b) => eval(a, resolve) || eval(b, resolve),
        Expr::And(a, b) => eval(a, resolve) && eval(b, resolve),
        Expr::Not(inner) => !eval(inner, resolve),
        Expr::Truthy(operand) => truthy(operand_value(operand, resolve).as_ref()),
        Expr::Compare(lhs, op, rhs) => compare(
            operand_value(lhs, resolve).as_ref(),
            *op,
            operand_value(rhs, resolve).as_ref(),
        ),
    }
}

fn operand_value(operand: &Operand, resolve: &dyn Fn(&[String]) -> Option<Value>) -> Option<Value> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Ident(parts) => resolve(parts),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
}

fn compare(lhs: Option<&Value>, op: CmpOp, rhs: Option<&Value>) -> bool {
    let lhs = lhs.unwrap_or(&Value::Null);
    let rhs = rhs.unwrap_or(&Value::Null);
    match op {
        CmpOp::Eq => loosely_equal(lhs, rhs),
        CmpOp::Ne => !loosely_equal(lhs, rhs),
        _ => {
            let ordering = match (lhs, rhs) {
                (Value::Number(_), Value::Number(_)) => {
                    lhs.as_f64().zip(rhs.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
                }
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            }
        }
    }
}

// 30 == 30.0
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64() == b.as_f64(),
        _ => a == b,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '\'' | '"' => {
                let start = i;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::UnterminatedString(start)),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == c => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(text)));
            }
            _ if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text, start)?));
            }
            _ if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word.split('.').map(str::to_string).collect()),
                });
            }
            _ => return Err(ExprError::UnexpectedChar { pos: i, ch: c }),
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str, pos: usize) -> Result<Value, ExprError> {
    let invalid = || ExprError::UnexpectedChar {
        pos,
        ch: text.chars().next().unwrap_or('?'),
    };
    if text.contains('.') {
        let n: f64 = text.parse().map_err(|_| invalid())?;
        Number::from_f64(n).map(Value::Number).ok_or_else(invalid)
    } else {
        let n: i64 = text.parse().map_err(|_| invalid())?;
        Ok(Value::Number(n.into()))
    }
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
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
                None => Err(ExprError::UnexpectedEnd),
            };
        }
        let lhs = self.parse_operand()?;
        if let Some(Token::Cmp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.parse_operand()?;
            return Ok(Expr::Compare(lhs, op, rhs));
        }
        Ok(Expr::Truthy(lhs))
    }

    fn parse_operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(Token::Ident(parts)) => Ok(Operand::Ident(parts)),
            Some(other) => Err(ExprError::UnexpectedToken(other.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}
