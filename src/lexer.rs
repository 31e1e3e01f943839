//! Lexer for expressions and kernels using logos
//!
//! Supports tokens like:
//! - Literals: 1, 2.5, 1e-3, 2j, "abc", 'abc', True, False
//! - Operators: + - * / // % ** == != < <= > >= & | ^ ~ << >> = += -= *= /=
//! - Keywords: def if elif else for in while break continue return and or not
//!
//! [`tokenize`] turns the raw token stream into lexemes with Python-style
//! `Newline` / `Indent` / `Dedent` layout markers.

use logos::Logos;
use std::fmt;

use crate::error::{CompileError, CompileResult, Pos};

fn indent_width(lex: &mut logos::Lexer<Token>) -> u32 {
    lex.slice()
        .chars()
        .skip(1)
        .map(|c| match c {
            ' ' => 1,
            '\t' => 4,
            _ => 0,
        })
        .sum()
}

fn parse_float(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_imag(lex: &mut logos::Lexer<Token>) -> Option<f64> {
    let slice = lex.slice();
    slice[..slice.len() - 1].parse().ok()
}

fn unquote(lex: &mut logos::Lexer<Token>) -> Option<String> {
    let slice = lex.slice();
    let body = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '0' => out.push('\0'),
            other => out.push(other),
        }
    }
    Some(out)
}

/// Token types for the expression and kernel language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    /// Line break followed by the next line's indentation width
    #[regex(r"\n[ \t\r]*", indent_width)]
    Newline(u32),

    // Literals
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", parse_float)]
    Float(f64),

    #[regex(r"([0-9]+(\.[0-9]*)?|\.[0-9]+)([eE][+-]?[0-9]+)?[jJ]", parse_imag)]
    Imag(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, unquote)]
    #[regex(r"'([^'\\\n]|\\.)*'", unquote)]
    Str(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Keywords
    #[token("def")]
    Def,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("while")]
    While,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("True")]
    True,
    #[token("False")]
    False,

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("**")]
    DoubleStar,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Newline(_) => write!(f, "newline"),
            Token::Int(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Imag(n) => write!(f, "{}j", n),
            Token::Str(s) => write!(f, "{:?}", s),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Def => write!(f, "def"),
            Token::If => write!(f, "if"),
            Token::Elif => write!(f, "elif"),
            Token::Else => write!(f, "else"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::While => write!(f, "while"),
            Token::Break => write!(f, "break"),
            Token::Continue => write!(f, "continue"),
            Token::Return => write!(f, "return"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::True => write!(f, "True"),
            Token::False => write!(f, "False"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::DoubleSlash => write!(f, "//"),
            Token::Percent => write!(f, "%"),
            Token::DoubleStar => write!(f, "**"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Tilde => write!(f, "~"),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::Assign => write!(f, "="),
            Token::PlusAssign => write!(f, "+="),
            Token::MinusAssign => write!(f, "-="),
            Token::StarAssign => write!(f, "*="),
            Token::SlashAssign => write!(f, "/="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
        }
    }
}

/// A token or a layout marker
#[derive(Debug, Clone, PartialEq)]
pub enum Lexeme {
    Tok(Token),
    /// End of a logical line (line break or `;`)
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Lexeme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lexeme::Tok(tok) => write!(f, "`{}`", tok),
            Lexeme::Newline => write!(f, "end of line"),
            Lexeme::Indent => write!(f, "indent"),
            Lexeme::Dedent => write!(f, "dedent"),
            Lexeme::Eof => write!(f, "end of input"),
        }
    }
}

/// A lexeme with its source position
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub lexeme: Lexeme,
    pub pos: Pos,
}

/// Maps byte offsets to line/column positions
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    pub fn pos(&self, offset: usize) -> Pos {
        let line = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Pos::new(line as u32 + 1, (offset - self.starts[line]) as u32 + 1)
    }
}

/// Tokenize source into lexemes with layout markers.
///
/// Line breaks inside parentheses are ignored, `;` ends a logical line without
/// changing indentation, and blank or comment-only lines produce nothing.
pub fn tokenize(source: &str) -> CompileResult<Vec<Spanned>> {
    let index = LineIndex::new(source);
    let mut out: Vec<Spanned> = Vec::new();
    let mut indents: Vec<u32> = Vec::new();
    let mut depth = 0usize;

    let first_indent: u32 = source
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum();
    let mut pending_indent = Some(first_indent);

    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let pos = index.pos(lexer.span().start);
        let token = result.map_err(|_| {
            CompileError::syntax(pos, format!("unexpected input `{}`", lexer.slice()))
        })?;

        match token {
            Token::Newline(width) => {
                if depth == 0 {
                    end_line(&mut out, pos);
                    pending_indent = Some(width);
                }
                continue;
            }
            Token::Semicolon if depth == 0 => {
                end_line(&mut out, pos);
                continue;
            }
            _ => {}
        }

        if let Some(width) = pending_indent.take() {
            match indents.last().copied() {
                None => indents.push(width),
                Some(top) if width > top => {
                    indents.push(width);
                    out.push(Spanned { lexeme: Lexeme::Indent, pos });
                }
                Some(top) if width < top => {
                    while indents.last().is_some_and(|&top| top > width) {
                        indents.pop();
                        out.push(Spanned { lexeme: Lexeme::Dedent, pos });
                    }
                    if indents.last() != Some(&width) {
                        return Err(CompileError::syntax(pos, "inconsistent dedent"));
                    }
                }
                Some(_) => {}
            }
        }

        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            _ => {}
        }
        out.push(Spanned { lexeme: Lexeme::Tok(token), pos });
    }

    let end = index.pos(source.len());
    end_line(&mut out, end);
    while indents.len() > 1 {
        indents.pop();
        out.push(Spanned { lexeme: Lexeme::Dedent, pos: end });
    }
    out.push(Spanned { lexeme: Lexeme::Eof, pos: end });
    Ok(out)
}

fn end_line(out: &mut Vec<Spanned>, pos: Pos) {
    let needs_newline = matches!(out.last(), Some(Spanned { lexeme: Lexeme::Tok(_), .. }));
    if needs_newline {
        out.push(Spanned { lexeme: Lexeme::Newline, pos });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lexemes(source: &str) -> Vec<Lexeme> {
        tokenize(source).unwrap().into_iter().map(|s| s.lexeme).collect()
    }

    fn tok(token: Token) -> Lexeme {
        Lexeme::Tok(token)
    }

    #[test]
    fn test_simple_tokens() {
        let tokens: Vec<_> = Token::lexer("x ** 2 // 3.5e1").filter_map(Result::ok).collect();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".to_string()),
                Token::DoubleStar,
                Token::Int(2),
                Token::DoubleSlash,
                Token::Float(35.0),
            ]
        );
    }

    #[test]
    fn test_literals() {
        let tokens: Vec<_> = Token::lexer(r#"2j .5 'ab\'c' "x" True"#)
            .filter_map(Result::ok)
            .collect();
        assert_eq!(
            tokens,
            vec![
                Token::Imag(2.0),
                Token::Float(0.5),
                Token::Str("ab'c".to_string()),
                Token::Str("x".to_string()),
                Token::True,
            ]
        );
    }

    #[test]
    fn test_keywords_beat_identifiers() {
        let tokens: Vec<_> = Token::lexer("if iffy not notx").filter_map(Result::ok).collect();
        assert_eq!(
            tokens,
            vec![
                Token::If,
                Token::Ident("iffy".to_string()),
                Token::Not,
                Token::Ident("notx".to_string()),
            ]
        );
    }

    #[test]
    fn test_indentation_layout() {
        let source = "def k(x):\n    if x > 0:\n        return 1\n    return 2\n";
        assert_eq!(
            lexemes(source),
            vec![
                tok(Token::Def),
                tok(Token::Ident("k".to_string())),
                tok(Token::LParen),
                tok(Token::Ident("x".to_string())),
                tok(Token::RParen),
                tok(Token::Colon),
                Lexeme::Newline,
                Lexeme::Indent,
                tok(Token::If),
                tok(Token::Ident("x".to_string())),
                tok(Token::Gt),
                tok(Token::Int(0)),
                tok(Token::Colon),
                Lexeme::Newline,
                Lexeme::Indent,
                tok(Token::Return),
                tok(Token::Int(1)),
                Lexeme::Newline,
                Lexeme::Dedent,
                tok(Token::Return),
                tok(Token::Int(2)),
                Lexeme::Newline,
                Lexeme::Dedent,
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_blank_lines_and_semicolons() {
        let source = "# me:fp=strict\n\ntemp = a + b;  # comment\n\n   \ntemp * 2";
        assert_eq!(
            lexemes(source),
            vec![
                tok(Token::Ident("temp".to_string())),
                tok(Token::Assign),
                tok(Token::Ident("a".to_string())),
                tok(Token::Plus),
                tok(Token::Ident("b".to_string())),
                Lexeme::Newline,
                tok(Token::Ident("temp".to_string())),
                tok(Token::Star),
                tok(Token::Int(2)),
                Lexeme::Newline,
                Lexeme::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_parentheses_are_ignored() {
        let source = "where(x > 0,\n      x,\n      0)";
        let layout: Vec<Lexeme> = lexemes(source)
            .into_iter()
            .filter(|l| !matches!(l, Lexeme::Tok(_)))
            .collect();
        assert_eq!(layout, vec![Lexeme::Newline, Lexeme::Eof]);
    }

    #[test]
    fn test_positions_and_errors() {
        let spanned = tokenize("a +\n  $").unwrap_err();
        assert_eq!(spanned.pos(), Some(Pos::new(2, 3)));

        let tokens = tokenize("x\n  + y").unwrap();
        assert_eq!(tokens[2].pos, Pos::new(2, 3));
        assert_eq!(tokens[2].lexeme, Lexeme::Indent);
    }

    #[test]
    fn test_inconsistent_dedent() {
        let err = tokenize("def k(x):\n    a = 1\n  return a").unwrap_err();
        assert_eq!(err.pos(), Some(Pos::new(3, 3)));
    }
}
