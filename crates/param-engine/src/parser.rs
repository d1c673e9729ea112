//! Formula lexer and parser.
//!
//! Parses the evaluation sandbox grammar: numeric literals, identifiers,
//! unary `+`/`-`, binary `+ - * / % **` (with `**` right-associative and
//! binding tighter than a leading unary minus, so `-2**2 == -4`),
//! parentheses and function calls. Anything else fails closed with a
//! [`ParseError`]; unparseable input is never treated as "no symbols".

use thiserror::Error;

use crate::ast::{BinaryOp, Expr, UnaryOp};

/// Guard against pathological inputs overflowing the stack or chewing CPU
/// during lexing/parsing.
const MAX_FORMULA_CHARS: usize = 8_192;
const MAX_NESTED_CALLS: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message} at offset {}", .span.start)]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl ParseError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    kind: TokenKind,
    span: Span,
}

pub(crate) fn is_ident_start(c: char) -> bool {
    c == '_' || unicode_ident::is_xid_start(c)
}

pub(crate) fn is_ident_continue(c: char) -> bool {
    c == '_' || unicode_ident::is_xid_continue(c)
}

fn lex(src: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let simple = match c {
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '/' => Some(TokenKind::Slash),
            '%' => Some(TokenKind::Percent),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            ',' => Some(TokenKind::Comma),
            _ => None,
        };
        if let Some(kind) = simple {
            chars.next();
            tokens.push(Token {
                kind,
                span: Span::new(start, start + c.len_utf8()),
            });
            continue;
        }

        if c == '*' {
            chars.next();
            if let Some(&(_, '*')) = chars.peek() {
                chars.next();
                tokens.push(Token {
                    kind: TokenKind::StarStar,
                    span: Span::new(start, start + 2),
                });
            } else {
                tokens.push(Token {
                    kind: TokenKind::Star,
                    span: Span::new(start, start + 1),
                });
            }
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && starts_number(src, start)) {
            let end = scan_number(src, start);
            let text = &src[start..end];
            let value: f64 = text.parse().map_err(|_| {
                ParseError::new(
                    format!("invalid numeric literal `{text}`"),
                    Span::new(start, end),
                )
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                span: Span::new(start, end),
            });
            while matches!(chars.peek(), Some(&(idx, _)) if idx < end) {
                chars.next();
            }
            continue;
        }

        if is_ident_start(c) {
            let mut end = start + c.len_utf8();
            chars.next();
            while let Some(&(idx, ch)) = chars.peek() {
                if is_ident_continue(ch) {
                    end = idx + ch.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Ident(src[start..end].to_string()),
                span: Span::new(start, end),
            });
            continue;
        }

        return Err(ParseError::new(
            format!("unexpected character `{c}`"),
            Span::new(start, start + c.len_utf8()),
        ));
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(src.len(), src.len()),
    });
    Ok(tokens)
}

fn starts_number(src: &str, dot: usize) -> bool {
    src[dot + 1..]
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit())
}

fn scan_number(src: &str, start: usize) -> usize {
    let bytes = src.as_bytes();
    let mut pos = start;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp = pos + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            pos = exp;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    pos
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    call_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ParseError> {
        if &self.peek().kind == kind {
            self.bump();
            Ok(())
        } else {
            Err(ParseError::new(format!("expected {what}"), self.peek().span))
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (op, lbp, rbp) = match self.peek().kind {
                TokenKind::Plus => (BinaryOp::Add, 1, 2),
                TokenKind::Minus => (BinaryOp::Sub, 1, 2),
                TokenKind::Star => (BinaryOp::Mul, 3, 4),
                TokenKind::Slash => (BinaryOp::Div, 3, 4),
                TokenKind::Percent => (BinaryOp::Mod, 3, 4),
                // Right-associative, and binds tighter than a unary prefix
                // on its left (so `-2**2` parses as `-(2**2)`).
                TokenKind::StarStar => (BinaryOp::Pow, 7, 6),
                _ => break,
            };
            if lbp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.parse_expr(rbp)?;
            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, ParseError> {
        let token = self.bump();
        match token.kind {
            TokenKind::Number(value) => Ok(Expr::Number(value)),
            TokenKind::Plus => Ok(Expr::Unary {
                op: UnaryOp::Plus,
                expr: Box::new(self.parse_expr(5)?),
            }),
            TokenKind::Minus => Ok(Expr::Unary {
                op: UnaryOp::Minus,
                expr: Box::new(self.parse_expr(5)?),
            }),
            TokenKind::LParen => {
                let expr = self.parse_expr(0)?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.parse_call(name, token.span)
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            _ => Err(ParseError::new("expected an expression", token.span)),
        }
    }

    fn parse_call(&mut self, name: String, span: Span) -> Result<Expr, ParseError> {
        self.call_depth += 1;
        if self.call_depth > MAX_NESTED_CALLS {
            return Err(ParseError::new("function calls nested too deeply", span));
        }
        self.bump(); // LParen
        let mut args: Vec<Expr> = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                args.push(self.parse_expr(0)?);
                match self.peek().kind {
                    TokenKind::Comma => {
                        self.bump();
                    }
                    _ => break,
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)` to close the argument list")?;
        self.call_depth -= 1;
        Ok(Expr::Call { name, args })
    }
}

/// Parse a formula string into an [`Expr`].
pub fn parse_formula(formula: &str) -> Result<Expr, ParseError> {
    let char_len = formula.chars().count();
    if char_len > MAX_FORMULA_CHARS {
        return Err(ParseError::new(
            format!("formula exceeds the {MAX_FORMULA_CHARS}-character limit (got {char_len})"),
            Span::new(0, formula.len()),
        ));
    }

    let tokens = lex(formula)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        call_depth: 0,
    };
    let expr = parser.parse_expr(0)?;
    if parser.peek().kind != TokenKind::Eof {
        return Err(ParseError::new(
            "unexpected trailing input",
            parser.peek().span,
        ));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::Interpreter;

    fn eval(src: &str) -> f64 {
        Interpreter::new()
            .eval_expr(&parse_formula(src).unwrap())
            .unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3"), 7.0);
        assert_eq!(eval("(1 + 2) * 3"), 9.0);
        assert_eq!(eval("7 % 4"), 3.0);
        assert_eq!(eval("2 * 2 * 2"), 8.0);
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(eval("2 ** 3"), 8.0);
        assert_eq!(eval("2 ** 3 ** 2"), 512.0);
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        assert_eq!(eval("-2 ** 2"), -4.0);
        assert_eq!(eval("2 ** -2"), 0.25);
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(eval("0.5 + .5"), 1.0);
        assert_eq!(eval("1e3"), 1000.0);
        assert_eq!(eval("2.5e-1"), 0.25);
    }

    #[test]
    fn calls_and_constants() {
        assert_eq!(eval("sqrt(16)"), 4.0);
        assert_eq!(eval("max(1, 2, 3)"), 3.0);
        assert!((eval("cos(pi)") + 1.0).abs() < 1e-12);
    }

    #[test]
    fn fails_closed_on_junk() {
        assert!(parse_formula("").is_err());
        assert!(parse_formula("1 +").is_err());
        assert!(parse_formula("foo(1").is_err());
        assert!(parse_formula("a; b").is_err());
        assert!(parse_formula("x = 3").is_err());
        assert!(parse_formula("'string'").is_err());
    }

    #[test]
    fn unicode_identifiers() {
        let expr = parse_formula("größe + _x1").unwrap();
        let mut names = Vec::new();
        expr.for_each_name(&mut |n| names.push(n.to_string()));
        assert_eq!(names, vec!["größe".to_string(), "_x1".to_string()]);
    }
}
