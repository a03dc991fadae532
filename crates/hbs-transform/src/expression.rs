//! Restricted expression language for schema instructions.
//!
//! Two uses: numeric formulas in `create_column` (`Expenditure / Members`)
//! and row predicates in `apply_filter` (`Weight > 0 and Sex == 'Female'`).
//! Supported syntax:
//!
//! - column names as bare identifiers, or in backticks when they contain spaces
//! - integer, float, `'string'` / `"string"`, `true` / `false` literals
//! - `+ - * /`, unary `-`, parentheses
//! - `== != < <= > >=`, `and` / `&`, `or` / `|`, `not` / `~`
//! - membership: `Code in [11111, 11112]`, `Sex not in ['Male']`

use polars::prelude::*;
use thiserror::Error;

/// An expression that failed to parse.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at position {position}")]
pub struct ExpressionError {
    pub position: usize,
    pub message: String,
}

impl ExpressionError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Column(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    In {
        value: Box<Node>,
        list: Vec<Node>,
        negated: bool,
    },
}

/// How column references are compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Columns cast to `Float64` with nulls replaced by zero.
    Numeric,
    /// Columns used as-is.
    Predicate,
}

/// A parsed expression and its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        let root = Parser::new(tokens, source.chars().count()).parse()?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Referenced column names, in first-use order.
    pub fn columns(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_columns(&self.root, &mut names);
        names
    }

    /// Arithmetic expression with nulls treated as zero.
    pub fn to_numeric_expr(&self) -> Expr {
        compile(&self.root, Mode::Numeric)
    }

    /// Row predicate; columns keep their dtype and nulls.
    pub fn to_predicate(&self) -> Expr {
        compile(&self.root, Mode::Predicate)
    }
}

fn collect_columns<'a>(node: &'a Node, names: &mut Vec<&'a str>) {
    match node {
        Node::Column(name) => {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        Node::Neg(inner) | Node::Not(inner) => collect_columns(inner, names),
        Node::Binary { left, right, .. } => {
            collect_columns(left, names);
            collect_columns(right, names);
        }
        Node::In { value, list, .. } => {
            collect_columns(value, names);
            for item in list {
                collect_columns(item, names);
            }
        }
        Node::Int(_) | Node::Float(_) | Node::Str(_) | Node::Bool(_) => {}
    }
}

fn compile(node: &Node, mode: Mode) -> Expr {
    match node {
        Node::Column(name) => match mode {
            Mode::Numeric => col(name.as_str())
                .cast(DataType::Float64)
                .fill_null(lit(0.0)),
            Mode::Predicate => col(name.as_str()),
        },
        Node::Int(value) => lit(*value),
        Node::Float(value) => lit(*value),
        Node::Str(value) => lit(value.clone()),
        Node::Bool(value) => lit(*value),
        Node::Neg(inner) => {
            use std::ops::Neg;
            compile(inner, mode).neg()
        }
        Node::Not(inner) => compile(inner, mode).not(),
        Node::Binary { op, left, right } => {
            let left = compile(left, mode);
            let right = compile(right, mode);
            match op {
                BinaryOp::Add => left + right,
                BinaryOp::Sub => left - right,
                BinaryOp::Mul => left * right,
                BinaryOp::Div => left / right,
                BinaryOp::Eq => left.eq(right),
                BinaryOp::NotEq => left.neq(right),
                BinaryOp::Lt => left.lt(right),
                BinaryOp::LtEq => left.lt_eq(right),
                BinaryOp::Gt => left.gt(right),
                BinaryOp::GtEq => left.gt_eq(right),
                BinaryOp::And => left.and(right),
                BinaryOp::Or => left.or(right),
            }
        }
        Node::In {
            value,
            list,
            negated,
        } => {
            let value = compile(value, mode);
            let membership = list
                .iter()
                .map(|item| value.clone().eq(compile(item, mode)))
                .reduce(Expr::or)
                .unwrap_or_else(|| lit(false));
            if *negated {
                membership.not()
            } else {
                membership
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Identifier(String),
    Number(String),
    Str(String),
    Bool(bool),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    In,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut index = 0usize;

    while index < chars.len() {
        let ch = chars[index];
        let position = index;

        if ch.is_whitespace() {
            index += 1;
            continue;
        }

        if ch == '\'' || ch == '"' || ch == '`' {
            index += 1;
            let mut text = String::new();
            let mut terminated = false;
            while index < chars.len() {
                if chars[index] == '\\' && ch != '`' {
                    let Some(escaped) = chars.get(index + 1) else {
                        break;
                    };
                    text.push(*escaped);
                    index += 2;
                    continue;
                }
                if chars[index] == ch {
                    index += 1;
                    terminated = true;
                    break;
                }
                text.push(chars[index]);
                index += 1;
            }
            if !terminated {
                return Err(ExpressionError::new(position, "unterminated quote"));
            }
            let kind = if ch == '`' {
                TokenKind::Identifier(text)
            } else {
                TokenKind::Str(text)
            };
            tokens.push(Token { kind, position });
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            index += 1;
            while index < chars.len() && (chars[index].is_alphanumeric() || chars[index] == '_') {
                index += 1;
            }
            let word: String = chars[position..index].iter().collect();
            let kind = match word.as_str() {
                "and" | "AND" => TokenKind::And,
                "or" | "OR" => TokenKind::Or,
                "not" | "NOT" => TokenKind::Not,
                "in" | "IN" => TokenKind::In,
                "true" | "True" => TokenKind::Bool(true),
                "false" | "False" => TokenKind::Bool(false),
                _ => TokenKind::Identifier(word),
            };
            tokens.push(Token { kind, position });
            continue;
        }

        if ch.is_ascii_digit()
            || (ch == '.' && chars.get(index + 1).is_some_and(char::is_ascii_digit))
        {
            index += 1;
            while index < chars.len() && (chars[index].is_ascii_digit() || chars[index] == '.') {
                index += 1;
            }
            let number: String = chars[position..index].iter().collect();
            tokens.push(Token {
                kind: TokenKind::Number(number),
                position,
            });
            continue;
        }

        let next = chars.get(index + 1).copied();
        let (kind, width) = match (ch, next) {
            ('=', Some('=')) => (TokenKind::Eq, 2),
            ('!', Some('=')) => (TokenKind::NotEq, 2),
            ('<', Some('=')) => (TokenKind::LtEq, 2),
            ('>', Some('=')) => (TokenKind::GtEq, 2),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('[', _) => (TokenKind::LBracket, 1),
            (']', _) => (TokenKind::RBracket, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('&', _) => (TokenKind::And, 1),
            ('|', _) => (TokenKind::Or, 1),
            ('~', _) => (TokenKind::Not, 1),
            _ => {
                return Err(ExpressionError::new(
                    position,
                    format!("unexpected character '{ch}'"),
                ));
            }
        };
        tokens.push(Token { kind, position });
        index += width;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    end: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, end: usize) -> Self {
        Self {
            tokens,
            cursor: 0,
            end,
        }
    }

    fn parse(mut self) -> Result<Node, ExpressionError> {
        if self.tokens.is_empty() {
            return Err(ExpressionError::new(0, "empty expression"));
        }
        let node = self.parse_or()?;
        if let Some(token) = self.tokens.get(self.cursor) {
            return Err(ExpressionError::new(token.position, "unexpected trailing input"));
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_and()?;
        while self.consume(&TokenKind::Or) {
            let right = self.parse_and()?;
            node = binary(BinaryOp::Or, node, right);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_not()?;
        while self.consume(&TokenKind::And) {
            let right = self.parse_not()?;
            node = binary(BinaryOp::And, node, right);
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<Node, ExpressionError> {
        if self.consume(&TokenKind::Not) {
            let inner = self.parse_not()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ExpressionError> {
        let left = self.parse_additive()?;

        if self.peek() == Some(&TokenKind::Not) && self.peek_at(1) == Some(&TokenKind::In) {
            self.cursor += 2;
            let list = self.parse_list()?;
            return Ok(Node::In {
                value: Box::new(left),
                list,
                negated: true,
            });
        }
        if self.consume(&TokenKind::In) {
            let list = self.parse_list()?;
            return Ok(Node::In {
                value: Box::new(left),
                list,
                negated: false,
            });
        }

        let op = match self.peek() {
            Some(TokenKind::Eq) => BinaryOp::Eq,
            Some(TokenKind::NotEq) => BinaryOp::NotEq,
            Some(TokenKind::Lt) => BinaryOp::Lt,
            Some(TokenKind::LtEq) => BinaryOp::LtEq,
            Some(TokenKind::Gt) => BinaryOp::Gt,
            Some(TokenKind::GtEq) => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.cursor += 1;
        let right = self.parse_additive()?;
        Ok(binary(op, left, right))
    }

    fn parse_list(&mut self) -> Result<Vec<Node>, ExpressionError> {
        let close = if self.consume(&TokenKind::LBracket) {
            TokenKind::RBracket
        } else if self.consume(&TokenKind::LParen) {
            TokenKind::RParen
        } else {
            return Err(self.error_here("expected a list after 'in'"));
        };

        let mut items = Vec::new();
        if self.consume(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_additive()?);
            if self.consume(&TokenKind::Comma) {
                continue;
            }
            if self.consume(&close) {
                return Ok(items);
            }
            return Err(self.error_here("expected ',' or end of list"));
        }
    }

    fn parse_additive(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_multiplicative()?;
        loop {
            let op = if self.consume(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.consume(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_multiplicative(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = if self.consume(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.consume(&TokenKind::Slash) {
                BinaryOp::Div
            } else {
                break;
            };
            let right = self.parse_unary()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        if self.consume(&TokenKind::Minus) {
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Node::Int(value) => Node::Int(-value),
                Node::Float(value) => Node::Float(-value),
                other => Node::Neg(Box::new(other)),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, ExpressionError> {
        let Some(token) = self.tokens.get(self.cursor).cloned() else {
            return Err(ExpressionError::new(self.end, "unexpected end of expression"));
        };
        self.cursor += 1;

        match token.kind {
            TokenKind::LParen => {
                let node = self.parse_or()?;
                if !self.consume(&TokenKind::RParen) {
                    return Err(self.error_here("missing closing ')'"));
                }
                Ok(node)
            }
            TokenKind::Identifier(name) => Ok(Node::Column(name)),
            TokenKind::Number(text) => {
                if let Ok(value) = text.parse::<i64>() {
                    return Ok(Node::Int(value));
                }
                text.parse::<f64>().map(Node::Float).map_err(|_| {
                    ExpressionError::new(token.position, format!("invalid number '{text}'"))
                })
            }
            TokenKind::Str(text) => Ok(Node::Str(text)),
            TokenKind::Bool(value) => Ok(Node::Bool(value)),
            _ => Err(ExpressionError::new(token.position, "expected a value")),
        }
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<&TokenKind> {
        self.tokens.get(self.cursor + offset).map(|token| &token.kind)
    }

    fn error_here(&self, message: &str) -> ExpressionError {
        let position = self
            .tokens
            .get(self.cursor)
            .map_or(self.end, |token| token.position);
        ExpressionError::new(position, message)
    }
}

fn binary(op: BinaryOp, left: Node, right: Node) -> Node {
    Node::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
