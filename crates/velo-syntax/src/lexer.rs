//! Lexer for the Velo surface syntax.
//!
//! Converts source text into a stream of tokens. Numbers without a
//! decimal point or exponent are integers; `;` starts a line comment.

use crate::ast::Span;

/// Token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    Integer(i64),
    Double(f64),
    Str(String),
    Symbol(String),
    Eof,
}

/// A token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }
}

/// Lexer state.
pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    token_start: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            token_start: 0,
        }
    }

    /// Tokenize the entire source, including the trailing EOF token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.is_eof();
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia();
        self.token_start = self.pos;

        let Some(c) = self.peek() else {
            return Ok(self.make(TokenKind::Eof));
        };

        match c {
            b'(' => {
                self.pos += 1;
                Ok(self.make(TokenKind::LParen))
            }
            b')' => {
                self.pos += 1;
                Ok(self.make(TokenKind::RParen))
            }
            b'"' => self.lex_string(),
            c if c.is_ascii_digit() => self.lex_number(),
            b'-' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number(),
            _ => self.lex_symbol(),
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b';' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn lex_string(&mut self) -> Result<Token, LexError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(LexError::UnterminatedString {
                        span: self.span(),
                    })
                }
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(self.make(TokenKind::Str(out)));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let esc = self.peek().ok_or(LexError::UnterminatedString {
                        span: self.span(),
                    })?;
                    self.pos += 1;
                    out.push(match esc {
                        b'n' => '\n',
                        b't' => '\t',
                        b'r' => '\r',
                        b'\\' => '\\',
                        b'"' => '"',
                        other => {
                            return Err(LexError::BadEscape {
                                escape: other as char,
                                span: self.span(),
                            })
                        }
                    });
                }
                Some(_) => {
                    let ch = self.source[self.pos..].chars().next().unwrap();
                    self.pos += ch.len_utf8();
                    out.push(ch);
                }
            }
        }
    }

    fn lex_number(&mut self) -> Result<Token, LexError> {
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_double = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    is_double = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_double = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = &self.source[self.token_start..self.pos];
        if is_double {
            let d: f64 = text.parse().map_err(|_| LexError::BadNumber {
                text: text.to_string(),
                span: self.span(),
            })?;
            Ok(self.make(TokenKind::Double(d)))
        } else {
            let i: i64 = text.parse().map_err(|_| LexError::BadNumber {
                text: text.to_string(),
                span: self.span(),
            })?;
            Ok(self.make(TokenKind::Integer(i)))
        }
    }

    fn lex_symbol(&mut self) -> Result<Token, LexError> {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() || c == b'(' || c == b')' || c == b';' || c == b'"' {
                break;
            }
            self.pos += 1;
        }
        let text = self.source[self.token_start..self.pos].to_string();
        Ok(self.make(TokenKind::Symbol(text)))
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn span(&self) -> Span {
        Span::new(self.token_start, self.pos)
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            span: self.span(),
        }
    }
}

/// Lexing error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },

    #[error("bad escape sequence '\\{escape}'")]
    BadEscape { escape: char, span: Span },

    #[error("malformed number '{text}'")]
    BadNumber { text: String, span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnterminatedString { span }
            | LexError::BadEscape { span, .. }
            | LexError::BadNumber { span, .. } => *span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn numbers_integer_vs_double() {
        assert_eq!(
            kinds("1 2.5 -3 1e3"),
            vec![
                TokenKind::Integer(1),
                TokenKind::Double(2.5),
                TokenKind::Integer(-3),
                TokenKind::Double(1000.0),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn symbols_and_parens() {
        assert_eq!(
            kinds("(+ x 1)"),
            vec![
                TokenKind::LParen,
                TokenKind::Symbol("+".to_string()),
                TokenKind::Symbol("x".to_string()),
                TokenKind::Integer(1),
                TokenKind::RParen,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#),
            vec![TokenKind::Str("a\nb".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 ; a comment\n2"),
            vec![TokenKind::Integer(1), TokenKind::Integer(2), TokenKind::Eof]
        );
    }

    #[test]
    fn minus_symbol_vs_negative_number() {
        assert_eq!(
            kinds("(- x 1) -2"),
            vec![
                TokenKind::LParen,
                TokenKind::Symbol("-".to_string()),
                TokenKind::Symbol("x".to_string()),
                TokenKind::Integer(1),
                TokenKind::RParen,
                TokenKind::Integer(-2),
                TokenKind::Eof
            ]
        );
    }
}
