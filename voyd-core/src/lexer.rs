//! Lexer for the normalized expression tree text form.
//!
//! The text form is a plain s-expression syntax: parentheses, atoms,
//! numeric, boolean and string literals, and `;` line comments. Operators such
//! as `+`, `<=` or `::` are ordinary identifier atoms.

use std::sync::Arc;

use crate::error::CoreError;
use crate::span::SourceLocation;

/// Kind of a token produced by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LParen,
    RParen,
    Ident,
    IntLiteral,
    FloatLiteral,
    BoolLiteral,
    StringLiteral,
}

/// A single token. `text_start` / `text_end` are byte offsets into the
/// lexed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text_start: u32,
    pub text_end: u32,
    pub line: u32,
    pub column: u32,
}

impl Token {
    pub fn text<'src>(&self, source: &'src str) -> &'src str {
        &source[self.text_start as usize..self.text_end as usize]
    }
}

/// Lex a source string into tokens.
pub fn lex(file: &Arc<str>, source: &str) -> Result<Vec<Token>, CoreError> {
    let mut lexer = Lexer {
        file: file.clone(),
        chars: source.as_bytes(),
        index: 0,
        line: 1,
        column: 1,
    };
    lexer.run()
}

struct Lexer<'src> {
    file: Arc<str>,
    chars: &'src [u8],
    index: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    fn run(&mut self) -> Result<Vec<Token>, CoreError> {
        let mut tokens = Vec::new();

        while let Some(ch) = self.peek_char() {
            if is_whitespace(ch) {
                self.consume_char();
                continue;
            }
            if ch == b';' {
                while self.peek_char().is_some_and(|c| c != b'\n') {
                    self.consume_char();
                }
                continue;
            }

            let start = self.index as u32;
            let (line, column) = (self.line, self.column);
            let kind = match ch {
                b'(' => {
                    self.consume_char();
                    TokenKind::LParen
                }
                b')' => {
                    self.consume_char();
                    TokenKind::RParen
                }
                b'"' => self.lex_string(start)?,
                b'0'..=b'9' => self.lex_number(start)?,
                b'-' | b'+' if self.peek_next().is_some_and(|c| c.is_ascii_digit()) => {
                    self.consume_char();
                    self.lex_number(start)?
                }
                _ => self.lex_atom(start),
            };

            tokens.push(Token {
                kind,
                text_start: start,
                text_end: self.index as u32,
                line,
                column,
            });
        }

        Ok(tokens)
    }

    fn lex_number(&mut self, start: u32) -> Result<TokenKind, CoreError> {
        self.consume_digits();

        let mut is_float = false;
        if self.peek_char() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.consume_char();
            self.consume_digits();
        }

        let suffix_start = self.index;
        while self.peek_char().is_some_and(is_atom_char) {
            self.consume_char();
        }
        let suffix = &self.chars[suffix_start..self.index];
        match suffix {
            b"" => {}
            b"i32" | b"i64" if !is_float => {}
            b"f32" | b"f64" => is_float = true,
            _ => {
                return Err(self.error(
                    start,
                    &format!(
                        "invalid numeric literal suffix `{}`",
                        String::from_utf8_lossy(suffix)
                    ),
                ));
            }
        }

        Ok(if is_float {
            TokenKind::FloatLiteral
        } else {
            TokenKind::IntLiteral
        })
    }

    /// Strings have no escapes and end on the same line.
    fn lex_string(&mut self, start: u32) -> Result<TokenKind, CoreError> {
        self.consume_char();
        loop {
            match self.peek_char() {
                Some(b'"') => {
                    self.consume_char();
                    return Ok(TokenKind::StringLiteral);
                }
                Some(b'\n') | None => {
                    return Err(self.error(start, "unterminated string literal"));
                }
                Some(_) => self.consume_char(),
            }
        }
    }

    fn lex_atom(&mut self, start: u32) -> TokenKind {
        while self.peek_char().is_some_and(is_atom_char) {
            self.consume_char();
        }
        match &self.chars[start as usize..self.index] {
            b"true" | b"false" => TokenKind::BoolLiteral,
            _ => TokenKind::Ident,
        }
    }

    fn consume_digits(&mut self) {
        while self
            .peek_char()
            .is_some_and(|c| c.is_ascii_digit() || c == b'_')
        {
            self.consume_char();
        }
    }

    fn error(&self, start: u32, message: &str) -> CoreError {
        CoreError::LexError {
            location: SourceLocation::new(
                self.file.clone(),
                self.line,
                self.column,
                start,
                self.index as u32,
            ),
            message: message.to_string(),
        }
    }

    fn peek_char(&self) -> Option<u8> {
        self.chars.get(self.index).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.chars.get(self.index + 1).copied()
    }

    fn consume_char(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.index += 1;
            if ch == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }
}

fn is_whitespace(ch: u8) -> bool {
    matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b',')
}

fn is_atom_char(ch: u8) -> bool {
    !is_whitespace(ch) && !matches!(ch, b'(' | b')' | b';' | b'"')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(&Arc::from("test.vast"), source)
            .expect("lex")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_lists_atoms_and_literals() {
        use TokenKind::*;
        assert_eq!(
            kinds("(+ 1 2.5 -3 1i64 2f32 true x::y)"),
            vec![
                LParen,
                Ident,
                IntLiteral,
                FloatLiteral,
                IntLiteral,
                IntLiteral,
                FloatLiteral,
                BoolLiteral,
                Ident,
                RParen
            ]
        );
    }

    #[test]
    fn skips_comments_and_tracks_lines() {
        let source = "; header\n(fib\n  10)";
        let tokens = lex(&Arc::from("test.vast"), source).expect("lex");
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[1].text(source), "fib");
        assert_eq!((tokens[2].line, tokens[2].column), (3, 3));
    }

    #[test]
    fn minus_alone_is_an_identifier() {
        assert_eq!(
            kinds("(- n 1)"),
            vec![
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::IntLiteral,
                TokenKind::RParen
            ]
        );
    }

    #[test]
    fn rejects_bad_suffixes() {
        let err = lex(&Arc::from("t"), "12abc").unwrap_err();
        assert!(matches!(err, CoreError::LexError { .. }));
        let err = lex(&Arc::from("t"), "1.5i32").unwrap_err();
        assert!(matches!(err, CoreError::LexError { .. }));
    }

    #[test]
    fn strings_end_on_their_line() {
        let source = "(declare \"env\")";
        let tokens = lex(&Arc::from("t"), source).expect("lex");
        assert_eq!(tokens[2].kind, TokenKind::StringLiteral);
        assert_eq!(tokens[2].text(source), "\"env\"");
        let err = lex(&Arc::from("t"), "\"open\n\"").unwrap_err();
        assert!(matches!(err, CoreError::LexError { .. }));
    }
}
