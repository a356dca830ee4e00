use std::rc::Rc;

use crate::source::Source;
use crate::span::{Span, Spanned};
use crate::token::TokenKind;

/// Hand-rolled state-machine lexer. Scans the whole source eagerly into a
/// `Vec<Spanned<TokenKind>>` rather than lazily, since the compiler needs
/// the full source resident anyway.
pub struct Lexer {
    source: Rc<Source>,
    bytes: Vec<u8>,
    start: usize,
    current: usize,
    line: usize,
    in_interpolation: Vec<()>,
    just_closed_interp: bool,
}

impl Lexer {
    pub fn new(source: Rc<Source>) -> Lexer {
        let bytes = source.contents.as_bytes().to_vec();
        Lexer {
            source,
            bytes,
            start: 0,
            current: 0,
            line: 1,
            in_interpolation: Vec::new(),
            just_closed_interp: false,
        }
    }

    pub fn lex(source: Rc<Source>) -> Vec<Spanned<TokenKind>> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.scan_token();
            let is_eof = matches!(token.item, TokenKind::Eof);
            tokens.push(token);
            if is_eof { break; }
        }
        tokens
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.bytes[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() { 0 } else { self.bytes[self.current + 1] }
    }

    fn advance(&mut self) -> u8 {
        let c = self.bytes[self.current];
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.bytes[self.current] != expected { return false; }
        self.current += 1;
        true
    }

    fn make(&self, kind: TokenKind) -> Spanned<TokenKind> {
        let span = Span::new(&self.source, self.start, self.current - self.start);
        Spanned::new(kind, span)
    }

    fn lexeme(&self) -> &str {
        std::str::from_utf8(&self.bytes[self.start..self.current]).unwrap_or("")
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => { self.advance(); }
                b'\n' => { self.line += 1; self.advance(); }
                b'/' if self.peek_next() == b'/' => {
                    while self.peek() != b'\n' && !self.is_at_end() { self.advance(); }
                }
                b'/' if self.peek_next() == b'*' => {
                    self.advance();
                    self.advance();
                    while !(self.peek() == b'*' && self.peek_next() == b'/') && !self.is_at_end() {
                        if self.peek() == b'\n' { self.line += 1; }
                        self.advance();
                    }
                    if !self.is_at_end() {
                        self.advance();
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn is_digit(c: u8) -> bool { c.is_ascii_digit() }
    fn is_alpha(c: u8) -> bool { c.is_ascii_alphabetic() || c == b'_' }

    fn string(&mut self) -> Spanned<TokenKind> {
        loop {
            if self.peek() == b'"' || self.is_at_end() { break; }
            if self.peek() == b'$' && self.peek_next() == b'{' {
                self.in_interpolation.push(());
                let content = self.lexeme().to_string();
                self.advance(); // $
                self.advance(); // {
                return self.make(TokenKind::StringInterpStart(content));
            }
            if self.peek() == b'\n' { self.line += 1; }
            self.advance();
        }

        if self.is_at_end() {
            return self.make(TokenKind::Error("unterminated string".to_string()));
        }

        let content = self.lexeme().to_string();
        self.advance(); // closing quote
        self.make(TokenKind::String(content))
    }

    fn number(&mut self) -> Spanned<TokenKind> {
        while Self::is_digit(self.peek()) { self.advance(); }

        if self.peek() == b'.' && Self::is_digit(self.peek_next()) {
            self.advance();
            while Self::is_digit(self.peek()) { self.advance(); }
        }

        let value: f64 = self.lexeme().parse().unwrap_or(f64::NAN);
        self.make(TokenKind::Number(value))
    }

    fn identifier(&mut self) -> Spanned<TokenKind> {
        while Self::is_alpha(self.peek()) || Self::is_digit(self.peek()) { self.advance(); }

        let kind = match self.lexeme() {
            "and" => TokenKind::And,
            "break" => TokenKind::Break,
            "class" => TokenKind::Class,
            "const" => TokenKind::Const,
            "continue" => TokenKind::Continue,
            "else" => TokenKind::Else,
            "expands" => TokenKind::Expands,
            "false" => TokenKind::False,
            "fn" => TokenKind::Fn,
            "for" => TokenKind::For,
            "if" => TokenKind::If,
            "in" => TokenKind::In,
            "lambda" => TokenKind::Lambda,
            "match" => TokenKind::Match,
            "nil" => TokenKind::Nil,
            "or" => TokenKind::Or,
            "print" => TokenKind::Print,
            "return" => TokenKind::Return,
            "super" => TokenKind::Super,
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            name => TokenKind::Identifier(name.to_string()),
        };
        self.make(kind)
    }

    pub fn scan_token(&mut self) -> Spanned<TokenKind> {
        if self.just_closed_interp {
            self.just_closed_interp = false;
            return self.string_continuation();
        }

        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make(TokenKind::Eof);
        }

        let c = self.advance();

        if Self::is_digit(c) { return self.number(); }
        if Self::is_alpha(c) { return self.identifier(); }

        match c {
            b'[' => self.make(TokenKind::LeftSquareBrace),
            b']' => self.make(TokenKind::RightSquareBrace),
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => {
                if self.in_interpolation.pop().is_some() {
                    self.just_closed_interp = true;
                    self.make(TokenKind::Semicolon)
                } else {
                    self.make(TokenKind::RightBrace)
                }
            }
            b';' => self.make(TokenKind::Semicolon),
            b',' => self.make(TokenKind::Comma),
            b'.' => {
                let kind = if self.matches(b'.') { TokenKind::DoubleDots } else { TokenKind::Dot };
                self.make(kind)
            }
            b'-' => {
                let kind = if self.matches(b'=') { TokenKind::MinusEqual } else { TokenKind::Minus };
                self.make(kind)
            }
            b'+' => {
                let kind = if self.matches(b'=') { TokenKind::PlusEqual } else { TokenKind::Plus };
                self.make(kind)
            }
            b'/' => self.make(TokenKind::Slash),
            b'*' => self.make(TokenKind::Star),
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make(kind)
            }
            b'=' => {
                if self.matches(b'>') { self.make(TokenKind::MatchesTo) }
                else if self.matches(b'=') { self.make(TokenKind::EqualEqual) }
                else { self.make(TokenKind::Equal) }
            }
            b'<' => {
                let kind = if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make(kind)
            }
            b'>' => {
                let kind = if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make(kind)
            }
            b'?' => self.make(TokenKind::Question),
            b':' => self.make(TokenKind::Colon),
            b'"' => self.string(),
            other => self.make(TokenKind::Error(format!("unexpected character '{}'", other as char))),
        }
    }

    /// After an interpolated `${expr}` closes, the next text up to the
    /// closing quote (or a fresh `${`) continues the same string literal.
    fn string_continuation(&mut self) -> Spanned<TokenKind> {
        self.start = self.current;
        loop {
            if self.peek() == b'"' || self.is_at_end() { break; }
            if self.peek() == b'$' && self.peek_next() == b'{' {
                self.in_interpolation.push(());
                let content = self.lexeme().to_string();
                self.advance();
                self.advance();
                return self.make(TokenKind::StringInterpStart(content));
            }
            if self.peek() == b'\n' { self.line += 1; }
            self.advance();
        }

        if self.is_at_end() {
            return self.make(TokenKind::Error("unterminated string".to_string()));
        }

        let content = self.lexeme().to_string();
        self.advance();
        self.make(TokenKind::StringWithInterp(content))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::lex(Source::source(src)).into_iter().map(|t| t.item).collect()
    }

    #[test]
    fn basic_tokens() {
        let ks = kinds("var x = 1 + 2;");
        assert_eq!(ks, vec![
            TokenKind::Var,
            TokenKind::Identifier("x".to_string()),
            TokenKind::Equal,
            TokenKind::Number(1.0),
            TokenKind::Plus,
            TokenKind::Number(2.0),
            TokenKind::Semicolon,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn keywords_vs_identifiers() {
        let ks = kinds("for forever in inside");
        assert_eq!(ks, vec![
            TokenKind::For,
            TokenKind::Identifier("forever".to_string()),
            TokenKind::In,
            TokenKind::Identifier("inside".to_string()),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn equal_does_not_eat_next_char() {
        let ks = kinds("x=1");
        assert_eq!(ks, vec![
            TokenKind::Identifier("x".to_string()),
            TokenKind::Equal,
            TokenKind::Number(1.0),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn line_comment_skipped() {
        let ks = kinds("1 // hello\n2");
        assert_eq!(ks, vec![TokenKind::Number(1.0), TokenKind::Number(2.0), TokenKind::Eof]);
    }
}
