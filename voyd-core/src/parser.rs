use std::sync::Arc;

use crate::ast::{Syntax, SyntaxKind};
use crate::error::CoreError;
use crate::lexer::{Token, TokenKind, lex};
use crate::span::SourceLocation;
use crate::types::Prim;

/// Parse every top-level form of `source`.
pub fn parse(file: &str, source: &str) -> Result<Vec<Syntax>, CoreError> {
    let file: Arc<str> = Arc::from(file);
    let tokens = lex(&file, source)?;
    let mut parser = Parser {
        file,
        source,
        tokens: &tokens,
        position: 0,
    };
    let mut forms = Vec::new();
    while parser.position < tokens.len() {
        forms.push(parser.parse_form()?);
    }
    Ok(forms)
}

struct Parser<'src> {
    file: Arc<str>,
    source: &'src str,
    tokens: &'src [Token],
    position: usize,
}

impl<'src> Parser<'src> {
    fn parse_form(&mut self) -> Result<Syntax, CoreError> {
        let tokens = self.tokens;
        let token = &tokens[self.position];
        self.position += 1;
        let location = self.location(token, token);
        let text = token.text(self.source);
        let kind = match token.kind {
            TokenKind::LParen => return self.parse_list(token),
            TokenKind::RParen => return Err(self.error(location, "unexpected ')'")),
            TokenKind::Ident => SyntaxKind::Ident(text.to_string()),
            TokenKind::BoolLiteral => SyntaxKind::Bool(text == "true"),
            TokenKind::StringLiteral => SyntaxKind::Str(text[1..text.len() - 1].to_string()),
            TokenKind::IntLiteral => {
                let (digits, suffix) = split_suffix(text);
                let ty = Prim::from_name(suffix).unwrap_or(Prim::I32);
                if ty.is_float() {
                    let value = digits
                        .parse::<f64>()
                        .map_err(|_| self.error(location.clone(), "malformed float literal"))?;
                    SyntaxKind::Float { value, ty }
                } else {
                    let value = digits
                        .parse::<i64>()
                        .map_err(|_| self.error(location.clone(), "integer literal out of range"))?;
                    if ty == Prim::I32 && i32::try_from(value).is_err() {
                        return Err(self.error(location, "integer literal out of range for i32"));
                    }
                    SyntaxKind::Int { value, ty }
                }
            }
            TokenKind::FloatLiteral => {
                let (digits, suffix) = split_suffix(text);
                let ty = Prim::from_name(suffix).unwrap_or(Prim::F64);
                let value = digits
                    .parse::<f64>()
                    .map_err(|_| self.error(location.clone(), "malformed float literal"))?;
                SyntaxKind::Float { value, ty }
            }
        };
        Ok(Syntax { kind, location })
    }

    fn parse_list(&mut self, open: &Token) -> Result<Syntax, CoreError> {
        let tokens = self.tokens;
        let mut items = Vec::new();
        loop {
            let Some(token) = tokens.get(self.position) else {
                let location = self.location(open, open);
                return Err(self.error(location, "unterminated list"));
            };
            if token.kind == TokenKind::RParen {
                self.position += 1;
                return Ok(Syntax {
                    kind: SyntaxKind::List(items),
                    location: self.location(open, token),
                });
            }
            items.push(self.parse_form()?);
        }
    }

    fn location(&self, first: &Token, last: &Token) -> SourceLocation {
        SourceLocation::new(
            self.file.clone(),
            first.line,
            first.column,
            first.text_start,
            last.text_end,
        )
    }

    fn error(&self, location: SourceLocation, message: &str) -> CoreError {
        CoreError::ParseError {
            location,
            message: message.to_string(),
        }
    }
}

/// Splits `12i64` into (`12`, `i64`), dropping digit separators.
fn split_suffix(text: &str) -> (String, &str) {
    let split = text
        .char_indices()
        .skip(1)
        .find(|(_, c)| c.is_ascii_alphabetic())
        .map_or(text.len(), |(index, _)| index);
    let digits = text[..split].replace('_', "");
    (digits, &text[split..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_forms() {
        let forms = parse("test.vast", "(fn main (parameters) (+ 1 (* 2 3)))").expect("parse");
        assert_eq!(forms.len(), 1);
        let form = &forms[0];
        assert!(form.is_call("fn"));
        assert_eq!(form.tail()[0].ident(), Some("main"));
        let body = &form.tail()[2];
        assert!(body.is_call("+"));
        assert_eq!(
            body.tail()[0].kind,
            SyntaxKind::Int {
                value: 1,
                ty: Prim::I32
            }
        );
    }

    #[test]
    fn reads_literal_suffixes() {
        let forms = parse("test.vast", "1i64 2.5f32 3f64 1.5 -7 false").expect("parse");
        let kinds: Vec<_> = forms.into_iter().map(|form| form.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SyntaxKind::Int {
                    value: 1,
                    ty: Prim::I64
                },
                SyntaxKind::Float {
                    value: 2.5,
                    ty: Prim::F32
                },
                SyntaxKind::Float {
                    value: 3.0,
                    ty: Prim::F64
                },
                SyntaxKind::Float {
                    value: 1.5,
                    ty: Prim::F64
                },
                SyntaxKind::Int {
                    value: -7,
                    ty: Prim::I32
                },
                SyntaxKind::Bool(false),
            ]
        );
    }

    #[test]
    fn list_locations_span_both_parentheses() {
        let forms = parse("test.vast", "\n  (a b)").expect("parse");
        let location = &forms[0].location;
        assert_eq!((location.line, location.column), (2, 3));
        assert_eq!((location.start, location.end), (3, 8));
        assert_eq!(location.to_string(), "test.vast:2:3");
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        let err = parse("test.vast", "(a (b)").unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
        let err = parse("test.vast", "a)").unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn strings_drop_their_quotes() {
        let forms = parse("test.vast", "\"imports\"").expect("parse");
        assert_eq!(forms[0].string(), Some("imports"));
    }

    #[test]
    fn rejects_out_of_range_i32() {
        let err = parse("test.vast", "3000000000").unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
        parse("test.vast", "3000000000i64").expect("i64 literal fits");
    }
}
