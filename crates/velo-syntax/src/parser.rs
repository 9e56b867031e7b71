//! Parser: token stream → expression sequence.

use crate::ast::{Expr, ExprKind, Span};
use crate::lexer::{LexError, Lexer, Token, TokenKind};
use thiserror::Error;

/// Parse error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("unexpected ')'")]
    UnexpectedClose { span: Span },

    #[error("unclosed '('")]
    UnclosedParen { span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::Lex(e) => e.span(),
            ParseError::UnexpectedClose { span } | ParseError::UnclosedParen { span } => *span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a whole source file into a sequence of top-level expressions.
pub fn parse(source: &str) -> ParseResult<Vec<Expr>> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut exprs = Vec::new();
    while !parser.peek().is_eof() {
        exprs.push(parser.expr()?);
    }
    Ok(exprs)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> ParseResult<Expr> {
        let token = self.bump();
        let span = token.span;
        match token.kind {
            TokenKind::Integer(i) => Ok(Expr::new(ExprKind::Integer(i), span)),
            TokenKind::Double(d) => Ok(Expr::new(ExprKind::Double(d), span)),
            TokenKind::Str(s) => Ok(Expr::new(ExprKind::Str(s), span)),
            TokenKind::Symbol(s) => Ok(Expr::new(atom_kind(s), span)),
            TokenKind::LParen => {
                let mut parts = Vec::new();
                loop {
                    match &self.peek().kind {
                        TokenKind::RParen => {
                            let close = self.bump();
                            return Ok(Expr::new(ExprKind::Call(parts), span.merge(close.span)));
                        }
                        TokenKind::Eof => return Err(ParseError::UnclosedParen { span }),
                        _ => parts.push(self.expr()?),
                    }
                }
            }
            TokenKind::RParen => Err(ParseError::UnexpectedClose { span }),
            TokenKind::Eof => Err(ParseError::UnclosedParen { span }),
        }
    }
}

/// Resolve reserved words; everything else is a symbol.
fn atom_kind(s: String) -> ExprKind {
    match s.as_str() {
        "TRUE" => ExprKind::Logical(Some(true)),
        "FALSE" => ExprKind::Logical(Some(false)),
        "NA" => ExprKind::Logical(None),
        "NULL" => ExprKind::Null,
        "NA-int" => ExprKind::NaInt,
        "NA-real" => ExprKind::NaReal,
        "NA-str" => ExprKind::NaStr,
        "Inf" => ExprKind::Double(f64::INFINITY),
        "-Inf" => ExprKind::Double(f64::NEG_INFINITY),
        _ => ExprKind::Symbol(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_calls() {
        let exprs = parse("(+ (* x 2) 1)").unwrap();
        assert_eq!(exprs.len(), 1);
        assert_eq!(exprs[0].head(), Some("+"));
        match &exprs[0].kind {
            ExprKind::Call(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[1].head(), Some("*"));
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn reserved_words() {
        let exprs = parse("TRUE FALSE NA NULL Inf").unwrap();
        let kinds: Vec<_> = exprs.into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExprKind::Logical(Some(true)),
                ExprKind::Logical(Some(false)),
                ExprKind::Logical(None),
                ExprKind::Null,
                ExprKind::Double(f64::INFINITY),
            ]
        );
    }

    #[test]
    fn error_on_unclosed_paren() {
        assert!(matches!(
            parse("(+ 1 2"),
            Err(ParseError::UnclosedParen { .. })
        ));
    }

    #[test]
    fn error_on_stray_close() {
        assert!(matches!(
            parse(")"),
            Err(ParseError::UnexpectedClose { .. })
        ));
    }

    #[test]
    fn display_round_trip() {
        let src = "(<- s 0) (for i (: 1 100) (<- s (+ s i)))";
        let exprs = parse(src).unwrap();
        let printed: Vec<String> = exprs.iter().map(|e| e.to_string()).collect();
        assert_eq!(printed.join(" "), src);
    }
}
