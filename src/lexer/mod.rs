use logos::Logos;

use crate::value::INTSCALED_SHIFT;

pub type Span = std::ops::Range<usize>;

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\x0b\x0c]+")]
pub enum Token {
    // Keywords
    #[token("unit")]
    Unit,
    #[token("on")]
    On,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("end")]
    End,
    #[token("var")]
    Var,
    #[token("nil")]
    Nil,
    #[token("as")]
    As,
    #[token("return")]
    Return,
    #[token("item")]
    Item,

    #[token("true", |_| true)]
    #[token("false", |_| false)]
    Bool(bool),

    // Literals. Numbers are quantized to Q32.32 at lex time; the decimal
    // fraction is clamped to 9 digits before scaling.
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| parse_scaled(lex.slice()))]
    Number(i64),

    #[regex(r#""([^"\\]|\\.)*""#, unescape)]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Multi-char operators before single-char
    #[token("==")]
    EqEq,

    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,

    // Catch-all for anything no other pattern claims. The parser surfaces
    // these as diagnostics and skips one token.
    #[regex(r".", |lex| lex.slice().to_string(), priority = 0)]
    Bad(String),

    // A NUL terminates the stream, matching the original scanner's
    // sentinel; lex() also appends one Eof past the last byte.
    #[token("\0")]
    Eof,
}

/// Parse a number literal into a Q32.32 scaled integer.
fn parse_scaled(s: &str) -> i64 {
    match s.split_once('.') {
        None => s.parse::<i64>().unwrap_or(0) << INTSCALED_SHIFT,
        Some((int_s, frac_s)) => {
            let intpart = int_s.parse::<i64>().unwrap_or(0);
            let frac_s = &frac_s[..frac_s.len().min(9)];
            if frac_s.is_empty() {
                return intpart << INTSCALED_SHIFT;
            }
            let frac = frac_s.parse::<u64>().unwrap_or(0);
            let pow10 = 10u128.pow(frac_s.len() as u32);
            let frac_q = (((frac as u128) << INTSCALED_SHIFT) + pow10 / 2) / pow10;
            (intpart << INTSCALED_SHIFT) + frac_q as i64
        }
    }
}

/// Strip quotes and process `\n \t \\ \"`; an unknown escape drops the
/// backslash and keeps the character.
fn unescape(lex: &mut logos::Lexer<Token>) -> String {
    let s = lex.slice();
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Lex source into a token stream with byte spans. Never fails: unknown
/// characters become `Token::Bad` entries, and a trailing `Token::Eof` is
/// always appended.
pub fn lex(source: &str) -> Vec<(Token, Span)> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(tok) => tokens.push((tok, lexer.span())),
            Err(()) => tokens.push((Token::Bad(source[lexer.span()].to_string()), lexer.span())),
        }
    }
    tokens.push((Token::Eof, source.len()..source.len()));
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::INTSCALED_ONE;

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lex_keywords_vs_idents() {
        let toks = kinds("unit on if else while end var nil as return item units");
        assert_eq!(toks[0], Token::Unit);
        assert_eq!(toks[1], Token::On);
        assert_eq!(toks[10], Token::Item);
        assert_eq!(toks[11], Token::Ident("units".to_string()));
        assert_eq!(*toks.last().unwrap(), Token::Eof);
    }

    #[test]
    fn lex_punctuation() {
        let toks = kinds("+-*/=<>(){}[],.:");
        assert_eq!(
            toks,
            vec![
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::Assign,
                Token::Less,
                Token::Greater,
                Token::LParen,
                Token::RParen,
                Token::LBrace,
                Token::RBrace,
                Token::LBracket,
                Token::RBracket,
                Token::Comma,
                Token::Dot,
                Token::Colon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lex_eq_vs_assign() {
        assert_eq!(kinds("== ="), vec![Token::EqEq, Token::Assign, Token::Eof]);
    }

    #[test]
    fn lex_integer_scaled() {
        assert_eq!(kinds("42")[0], Token::Number(42 << INTSCALED_SHIFT));
    }

    #[test]
    fn lex_decimal_scaled() {
        assert_eq!(kinds("2.5")[0], Token::Number(2 * INTSCALED_ONE + INTSCALED_ONE / 2));
    }

    #[test]
    fn lex_fraction_clamped_to_nine_digits() {
        // The tenth digit must not shift the quantized payload.
        let a = match kinds("1.123456789")[0].clone() {
            Token::Number(q) => q,
            t => panic!("expected number, got {:?}", t),
        };
        let b = match kinds("1.1234567891")[0].clone() {
            Token::Number(q) => q,
            t => panic!("expected number, got {:?}", t),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn lex_fraction_quantizes_to_nearest() {
        let q = match kinds("0.5")[0].clone() {
            Token::Number(q) => q,
            t => panic!("expected number, got {:?}", t),
        };
        assert_eq!(q, INTSCALED_ONE / 2);
    }

    #[test]
    fn lex_string_escapes() {
        assert_eq!(kinds(r#""a\nb\tc\\d\"e""#)[0], Token::Str("a\nb\tc\\d\"e".to_string()));
    }

    #[test]
    fn lex_unknown_escape_drops_backslash() {
        assert_eq!(kinds(r#""a\qb""#)[0], Token::Str("aqb".to_string()));
    }

    #[test]
    fn lex_bad_token() {
        let toks = kinds("a $ b");
        assert_eq!(toks[1], Token::Bad("$".to_string()));
    }

    #[test]
    fn lex_member_chain() {
        let toks = kinds("p.x");
        assert_eq!(
            toks,
            vec![
                Token::Ident("p".to_string()),
                Token::Dot,
                Token::Ident("x".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lex_spans_track_bytes() {
        let toks = lex("ab cd");
        assert_eq!(toks[0].1, 0..2);
        assert_eq!(toks[1].1, 3..5);
        assert_eq!(toks[2].1, 5..5);
    }

    #[test]
    fn lex_whitespace_only() {
        assert_eq!(kinds("  \t\n "), vec![Token::Eof]);
    }
}
