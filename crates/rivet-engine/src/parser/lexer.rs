//! Lexer: converts source text into a token stream using the `logos`
//! generated scanner, then interns identifiers through a shared
//! [`Interner`](super::interner::Interner).

use logos::Logos;
use thiserror::Error;

use super::interner::Interner;
use super::token::{Span, Token};

/// Errors a malformed literal can raise while scanning.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("malformed number literal '{0}' at line {1}")]
    MalformedNumber(String, u32),
    #[error("unexpected character '{0}' at line {1}")]
    UnexpectedChar(char, u32),
}

/// The logos-generated scanner. Kept private: downstream code only ever
/// sees the converted [`Token`]/[`Span`] pairs produced by [`Lexer::tokenize`].
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
enum Raw {
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("elseif")]
    ElseIf,
    #[token("loop")]
    Loop,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("fn")]
    Fn,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("nil")]
    Nil,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Identifier(String),

    #[regex(r"0[xX][0-9a-fA-F]+", |lex| parse_radix(lex.slice(), 2, 16))]
    #[regex(r"0[oO][0-7]+", |lex| parse_radix(lex.slice(), 2, 8))]
    #[regex(r"0[bB][01]+", |lex| parse_radix(lex.slice(), 2, 2))]
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse().ok())]
    Number(f64),

    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("<=")]
    LessEqual,
    #[token(">=")]
    GreaterEqual,
    #[token("+=")]
    PlusEqual,
    #[token("-=")]
    MinusEqual,
    #[token("*=")]
    StarEqual,
    #[token("/=")]
    SlashEqual,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("!")]
    Bang,
    #[token("=")]
    Equal,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
}

fn parse_radix(slice: &str, skip: usize, radix: u32) -> Option<f64> {
    i64::from_str_radix(&slice[skip..], radix)
        .ok()
        .map(|n| n as f64)
}

/// Tokenizes a full source string, interning identifiers into `interner`.
///
/// Returns the token/span pairs (terminated by `Token::Eof`) or the first
/// malformed-literal/unrecognised-character error, matching the compiler's
/// one-error-wins failure model.
pub fn tokenize(source: &str, interner: &mut Interner) -> Result<Vec<(Token, Span)>, LexError> {
    let mut out = Vec::new();
    let mut raw_lexer = Raw::lexer(source);
    let mut line: u32 = 1;
    let mut consumed = 0usize;

    while let Some(result) = raw_lexer.next() {
        let slice_start = raw_lexer.span().start;
        line += source[consumed..slice_start].matches('\n').count() as u32;
        consumed = slice_start;

        let raw = result.map_err(|()| {
            let bad = raw_lexer.slice().chars().next().unwrap_or('\0');
            LexError::UnexpectedChar(bad, line)
        })?;

        let token = match raw {
            Raw::Let => Token::Let,
            Raw::If => Token::If,
            Raw::Else => Token::Else,
            Raw::ElseIf => Token::ElseIf,
            Raw::Loop => Token::Loop,
            Raw::While => Token::While,
            Raw::For => Token::For,
            Raw::Fn => Token::Fn,
            Raw::True => Token::True,
            Raw::False => Token::False,
            Raw::Nil => Token::Nil,
            Raw::Identifier(name) => Token::Identifier(interner.intern(&name)),
            Raw::Number(n) => {
                if n.is_nan() {
                    return Err(LexError::MalformedNumber(raw_lexer.slice().to_string(), line));
                }
                Token::Number(n)
            }
            Raw::AmpAmp => Token::AmpAmp,
            Raw::PipePipe => Token::PipePipe,
            Raw::EqualEqual => Token::EqualEqual,
            Raw::BangEqual => Token::BangEqual,
            Raw::LessEqual => Token::LessEqual,
            Raw::GreaterEqual => Token::GreaterEqual,
            Raw::PlusEqual => Token::PlusEqual,
            Raw::MinusEqual => Token::MinusEqual,
            Raw::StarEqual => Token::StarEqual,
            Raw::SlashEqual => Token::SlashEqual,
            Raw::Plus => Token::Plus,
            Raw::Minus => Token::Minus,
            Raw::Star => Token::Star,
            Raw::Slash => Token::Slash,
            Raw::Bang => Token::Bang,
            Raw::Equal => Token::Equal,
            Raw::Less => Token::Less,
            Raw::Greater => Token::Greater,
            Raw::LeftParen => Token::LeftParen,
            Raw::RightParen => Token::RightParen,
            Raw::LeftBrace => Token::LeftBrace,
            Raw::RightBrace => Token::RightBrace,
            Raw::Comma => Token::Comma,
            Raw::Semicolon => Token::Semicolon,
        };
        out.push((token, Span::new(line)));
    }

    line += source[consumed..].matches('\n').count() as u32;
    out.push((Token::Eof, Span::new(line)));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        let mut interner = Interner::new();
        tokenize(src, &mut interner)
            .unwrap()
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        let mut interner = Interner::new();
        let expected_sym = interner.intern("x");
        let toks = lex("let x = nil");
        assert_eq!(
            toks,
            vec![Token::Let, Token::Identifier(expected_sym), Token::Equal, Token::Nil, Token::Eof]
        );
    }

    #[test]
    fn numeric_literal_formats() {
        assert_eq!(lex("3.1415926535"), vec![Token::Number(3.1415926535), Token::Eof]);
        assert_eq!(lex("0x1F"), vec![Token::Number(31.0), Token::Eof]);
        assert_eq!(lex("0o17"), vec![Token::Number(15.0), Token::Eof]);
        assert_eq!(lex("0b101"), vec![Token::Number(5.0), Token::Eof]);
        assert_eq!(lex("1e3"), vec![Token::Number(1000.0), Token::Eof]);
    }

    #[test]
    fn tracks_line_numbers() {
        let mut interner = Interner::new();
        let toks = tokenize("let a = 1\nlet b = 2", &mut interner).unwrap();
        assert_eq!(toks[0].1.line, 1);
        let second_let_line = toks
            .iter()
            .filter(|(t, _)| matches!(t, Token::Let))
            .nth(1)
            .unwrap()
            .1
            .line;
        assert_eq!(second_let_line, 2);
    }

    #[test]
    fn operators() {
        let mut interner = Interner::new();
        let a = interner.intern("a");
        let b = interner.intern("b");
        let toks = lex("a == 3 && b != 4");
        assert_eq!(
            toks,
            vec![
                Token::Identifier(a),
                Token::EqualEqual,
                Token::Number(3.0),
                Token::AmpAmp,
                Token::Identifier(b),
                Token::BangEqual,
                Token::Number(4.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn unexpected_char_is_an_error() {
        let mut interner = Interner::new();
        assert!(tokenize("let a = @", &mut interner).is_err());
    }
}
