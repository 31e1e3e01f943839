//! Parser for expressions, statement sequences and kernels
//!
//! Parses programs like:
//! - `a * 2 + sum(b)`
//! - `temp = a + b; temp * 2`
//! - ```text
//!   # me:fp=contract
//!   def kernel(x):
//!       acc = 0
//!       for i in range(4):
//!           if x > i:
//!               acc += i
//!       return acc
//!   ```

use std::collections::HashSet;

use crate::arena::Arena;
use crate::ast::{
    Ast, Block, Dialect, Expr, ExprId, ExprNode, Form, FpMode, LogicalOp, Param, Pragmas, Stmt,
    StmtId, StmtNode,
};
use crate::error::{CompileError, CompileResult, Pos};
use crate::lexer::{tokenize, Lexeme, Spanned, Token};
use crate::ops::{BinaryOp, CompareOp, UnaryOp};

/// Parser for the expression and kernel language
pub struct Parser<'source> {
    source: &'source str,
    tokens: Vec<Spanned>,
    cursor: usize,
    exprs: Arena<ExprNode>,
    stmts: Arena<StmtNode>,
    in_kernel: bool,
    loop_depth: usize,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
            cursor: 0,
            exprs: Arena::new(),
            stmts: Arena::new(),
            in_kernel: false,
            loop_depth: 0,
        }
    }

    /// Current lexeme
    fn peek(&self) -> &Lexeme {
        self.tokens
            .get(self.cursor)
            .map(|s| &s.lexeme)
            .unwrap_or(&Lexeme::Eof)
    }

    /// Lexeme after the current one
    fn peek_next(&self) -> &Lexeme {
        self.tokens
            .get(self.cursor + 1)
            .map(|s| &s.lexeme)
            .unwrap_or(&Lexeme::Eof)
    }

    /// Position of the current lexeme
    fn pos(&self) -> Pos {
        self.tokens
            .get(self.cursor)
            .or_else(|| self.tokens.last())
            .map(|s| s.pos)
            .unwrap_or_default()
    }

    /// Advance to the next lexeme, returning the current one
    fn advance(&mut self) -> Lexeme {
        let lexeme = self.peek().clone();
        if self.cursor < self.tokens.len() {
            self.cursor += 1;
        }
        lexeme
    }

    /// Check if the current token matches expected (payloads ignored)
    fn check(&self, expected: &Token) -> bool {
        match self.peek() {
            Lexeme::Tok(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            _ => false,
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<Pos> {
        let pos = self.pos();
        if self.check(&expected) {
            self.advance();
            Ok(pos)
        } else if self.check(&Token::LBrace) {
            Err(brace_error(pos))
        } else {
            Err(CompileError::syntax(
                pos,
                format!("expected `{}`, found {}", expected, self.peek()),
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> CompileResult<(String, Pos)> {
        let pos = self.pos();
        match self.advance() {
            Lexeme::Tok(Token::Ident(name)) => Ok((name, pos)),
            other => Err(CompileError::syntax(
                pos,
                format!("expected {}, found {}", what, other),
            )),
        }
    }

    fn expect_line_end(&mut self) -> CompileResult<()> {
        match self.peek() {
            Lexeme::Newline => {
                self.advance();
                Ok(())
            }
            Lexeme::Eof | Lexeme::Dedent => Ok(()),
            Lexeme::Tok(Token::LBrace) | Lexeme::Tok(Token::RBrace) => Err(brace_error(self.pos())),
            other => Err(CompileError::syntax(
                self.pos(),
                format!("expected end of line, found {}", other),
            )),
        }
    }

    fn push_expr(&mut self, expr: Expr, pos: Pos) -> ExprId {
        self.exprs.append(ExprNode { expr, pos })
    }

    fn push_stmt(&mut self, stmt: Stmt, pos: Pos) -> StmtId {
        self.stmts.append(StmtNode { stmt, pos })
    }

    /// Parse a complete program
    pub fn parse_program(&mut self) -> CompileResult<Ast> {
        let pragmas = parse_pragmas(self.source)?;
        self.tokens = tokenize(self.source)?;

        while matches!(self.peek(), Lexeme::Newline) {
            self.advance();
        }
        if matches!(self.peek(), Lexeme::Eof) {
            return Err(CompileError::syntax(self.pos(), "empty program"));
        }

        let form = if self.check(&Token::Def) {
            let form = self.parse_kernel()?;
            if !matches!(self.peek(), Lexeme::Eof) {
                return Err(CompileError::syntax(
                    self.pos(),
                    "unexpected code after the kernel body",
                ));
            }
            form
        } else {
            let mut block = Vec::new();
            while !matches!(self.peek(), Lexeme::Eof) {
                if matches!(self.peek(), Lexeme::Indent) {
                    return Err(CompileError::syntax(self.pos(), "unexpected indent"));
                }
                block.push(self.parse_statement()?);
            }
            match block.as_slice() {
                [only] => match &self.stmts[*only].stmt {
                    Stmt::Expr(id) => Form::Expression(*id),
                    _ => Form::Statements(block),
                },
                _ => Form::Statements(block),
            }
        };

        Ok(Ast {
            exprs: std::mem::take(&mut self.exprs),
            stmts: std::mem::take(&mut self.stmts),
            form,
            pragmas,
        })
    }

    /// Parse `def name(params): body`
    fn parse_kernel(&mut self) -> CompileResult<Form> {
        self.expect(Token::Def)?;
        let (name, _) = self.expect_ident("kernel name")?;
        self.expect(Token::LParen)?;

        let mut params: Vec<Param> = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let (param, pos) = self.expect_ident("parameter name")?;
                if params.iter().any(|p| p.name == param) {
                    return Err(CompileError::syntax(
                        pos,
                        format!("duplicate parameter `{}`", param),
                    ));
                }
                params.push(Param { name: param, pos });
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        self.in_kernel = true;
        let body = self.parse_block()?;
        self.in_kernel = false;
        Ok(Form::Kernel { name, params, body })
    }

    /// Parse `: NEWLINE INDENT stmts DEDENT` or an inline `: stmt`
    fn parse_block(&mut self) -> CompileResult<Block> {
        self.expect(Token::Colon)?;
        if self.check(&Token::LBrace) {
            return Err(brace_error(self.pos()));
        }
        if !matches!(self.peek(), Lexeme::Newline) {
            return Ok(vec![self.parse_statement()?]);
        }
        self.advance();
        if !matches!(self.peek(), Lexeme::Indent) {
            return Err(CompileError::syntax(self.pos(), "expected an indented block"));
        }
        self.advance();

        let mut block = Vec::new();
        loop {
            match self.peek() {
                Lexeme::Dedent => {
                    self.advance();
                    break;
                }
                Lexeme::Eof => break,
                Lexeme::Indent => {
                    return Err(CompileError::syntax(self.pos(), "unexpected indent"));
                }
                _ => block.push(self.parse_statement()?),
            }
        }
        Ok(block)
    }

    /// Parse a single statement
    fn parse_statement(&mut self) -> CompileResult<StmtId> {
        let pos = self.pos();
        let keyword = match self.peek() {
            Lexeme::Tok(
                tok @ (Token::If
                | Token::For
                | Token::While
                | Token::Return
                | Token::Break
                | Token::Continue),
            ) => Some(tok.clone()),
            _ => None,
        };
        if let Some(keyword) = keyword {
            if !self.in_kernel {
                return Err(CompileError::syntax(
                    pos,
                    format!("`{}` statements require a `def kernel(...):` header", keyword),
                ));
            }
            return match keyword {
                Token::If => self.parse_if(),
                Token::For => self.parse_for(),
                Token::While => self.parse_while(),
                Token::Return => {
                    self.advance();
                    let value = self.parse_expr()?;
                    self.expect_line_end()?;
                    Ok(self.push_stmt(Stmt::Return(value), pos))
                }
                _ => self.parse_loop_jump(),
            };
        }

        match self.peek().clone() {
            Lexeme::Tok(Token::Def) => Err(CompileError::syntax(
                pos,
                if self.in_kernel {
                    "nested `def` is not supported"
                } else {
                    "`def` must start the program"
                },
            )),
            Lexeme::Tok(Token::LBrace) | Lexeme::Tok(Token::RBrace) => Err(brace_error(pos)),
            Lexeme::Tok(Token::Ident(name)) => {
                let augmented = match self.peek_next() {
                    Lexeme::Tok(Token::Assign) => Some(None),
                    Lexeme::Tok(Token::PlusAssign) => Some(Some(BinaryOp::Add)),
                    Lexeme::Tok(Token::MinusAssign) => Some(Some(BinaryOp::Sub)),
                    Lexeme::Tok(Token::StarAssign) => Some(Some(BinaryOp::Mul)),
                    Lexeme::Tok(Token::SlashAssign) => Some(Some(BinaryOp::Div)),
                    _ => None,
                };
                if let Some(op) = augmented {
                    self.advance();
                    let op_pos = self.pos();
                    self.advance();
                    let mut value = self.parse_expr()?;
                    if let Some(op) = op {
                        let target = self.push_expr(Expr::Name(name.clone()), pos);
                        value = self.push_expr(Expr::Binary { op, lhs: target, rhs: value }, op_pos);
                    }
                    self.expect_line_end()?;
                    return Ok(self.push_stmt(Stmt::Assign { target: name, value }, pos));
                }
                if name == "print" && matches!(self.peek_next(), Lexeme::Tok(Token::LParen)) {
                    self.advance();
                    let args = self.parse_args()?;
                    self.expect_line_end()?;
                    return Ok(self.push_stmt(Stmt::Print(args), pos));
                }
                self.parse_expr_statement(pos)
            }
            _ => self.parse_expr_statement(pos),
        }
    }

    fn parse_expr_statement(&mut self, pos: Pos) -> CompileResult<StmtId> {
        let expr = self.parse_expr()?;
        self.expect_line_end()?;
        Ok(self.push_stmt(Stmt::Expr(expr), pos))
    }

    /// Parse `break` / `continue`
    fn parse_loop_jump(&mut self) -> CompileResult<StmtId> {
        let pos = self.pos();
        let keyword = self.advance();
        let (stmt, word) = match keyword {
            Lexeme::Tok(Token::Break) => (Stmt::Break, "break"),
            _ => (Stmt::Continue, "continue"),
        };
        if self.check(&Token::If) {
            return Err(CompileError::syntax(
                pos,
                format!("deprecated `{word} if` syntax; use `if cond: {word}`"),
            ));
        }
        if self.loop_depth == 0 {
            return Err(CompileError::syntax(pos, format!("`{word}` outside of a loop")));
        }
        self.expect_line_end()?;
        Ok(self.push_stmt(stmt, pos))
    }

    /// Parse `if` / `elif` / `else`
    fn parse_if(&mut self) -> CompileResult<StmtId> {
        let pos = self.expect(Token::If)?;
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        branches.push((cond, self.parse_block()?));

        let mut orelse = None;
        loop {
            if self.eat(&Token::Elif) {
                let cond = self.parse_expr()?;
                branches.push((cond, self.parse_block()?));
            } else if self.eat(&Token::Else) {
                orelse = Some(self.parse_block()?);
                break;
            } else {
                break;
            }
        }
        Ok(self.push_stmt(Stmt::If { branches, orelse }, pos))
    }

    /// Parse `for var in range(...)`
    fn parse_for(&mut self) -> CompileResult<StmtId> {
        let pos = self.expect(Token::For)?;
        let (var, _) = self.expect_ident("loop variable")?;
        self.expect(Token::In)?;
        let (callee, callee_pos) = self.expect_ident("`range`")?;
        if callee != "range" {
            return Err(CompileError::syntax(
                callee_pos,
                format!("only `range(...)` loops are supported, found `{}`", callee),
            ));
        }
        let args = self.parse_args()?;
        if args.is_empty() || args.len() > 3 {
            return Err(CompileError::syntax(
                callee_pos,
                format!("range() takes 1 to 3 arguments, got {}", args.len()),
            ));
        }
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        Ok(self.push_stmt(Stmt::For { var, args, body: body? }, pos))
    }

    /// Parse `while cond:`
    fn parse_while(&mut self) -> CompileResult<StmtId> {
        let pos = self.expect(Token::While)?;
        let cond = self.parse_expr()?;
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        Ok(self.push_stmt(Stmt::While { cond, body: body? }, pos))
    }

    /// Parse an expression (handles operator precedence)
    pub fn parse_expr(&mut self) -> CompileResult<ExprId> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CompileResult<ExprId> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            let pos = self.pos();
            self.advance();
            let right = self.parse_and()?;
            left = self.push_expr(Expr::Logical { op: LogicalOp::Or, lhs: left, rhs: right }, pos);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CompileResult<ExprId> {
        let mut left = self.parse_not()?;
        while self.check(&Token::And) {
            let pos = self.pos();
            self.advance();
            let right = self.parse_not()?;
            left = self.push_expr(Expr::Logical { op: LogicalOp::And, lhs: left, rhs: right }, pos);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> CompileResult<ExprId> {
        if self.check(&Token::Not) {
            let pos = self.pos();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(self.push_expr(Expr::Unary { op: UnaryOp::Not, operand }, pos));
        }
        self.parse_comparison()
    }

    /// Parse comparisons: a < b, a == b (left associative, no chaining)
    fn parse_comparison(&mut self) -> CompileResult<ExprId> {
        let mut left = self.parse_bitor()?;
        loop {
            let op = match self.peek() {
                Lexeme::Tok(Token::EqEq) => CompareOp::Eq,
                Lexeme::Tok(Token::NotEq) => CompareOp::Ne,
                Lexeme::Tok(Token::Lt) => CompareOp::Lt,
                Lexeme::Tok(Token::Le) => CompareOp::Le,
                Lexeme::Tok(Token::Gt) => CompareOp::Gt,
                Lexeme::Tok(Token::Ge) => CompareOp::Ge,
                _ => break,
            };
            let pos = self.pos();
            self.advance();
            let right = self.parse_bitor()?;
            left = self.push_expr(Expr::Compare { op, lhs: left, rhs: right }, pos);
        }
        Ok(left)
    }

    /// Parse one left-associative binary precedence level
    fn parse_binary_level(
        &mut self,
        ops: &[(Token, BinaryOp)],
        next: fn(&mut Self) -> CompileResult<ExprId>,
    ) -> CompileResult<ExprId> {
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in ops {
                if self.check(token) {
                    let pos = self.pos();
                    self.advance();
                    let right = next(self)?;
                    left = self.push_expr(Expr::Binary { op: *op, lhs: left, rhs: right }, pos);
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(&[(Token::Pipe, BinaryOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(&[(Token::Caret, BinaryOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(&[(Token::Amp, BinaryOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(
            &[(Token::Shl, BinaryOp::Shl), (Token::Shr, BinaryOp::Shr)],
            Self::parse_additive,
        )
    }

    /// Parse additive expressions: a + b, a - b
    fn parse_additive(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::parse_multiplicative,
        )
    }

    /// Parse multiplicative expressions: a * b, a / b, a // b, a % b
    fn parse_multiplicative(&mut self) -> CompileResult<ExprId> {
        self.parse_binary_level(
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::DoubleSlash, BinaryOp::FloorDiv),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Mod),
            ],
            Self::parse_unary,
        )
    }

    /// Parse unary expressions: -a, +a, ~a
    fn parse_unary(&mut self) -> CompileResult<ExprId> {
        let pos = self.pos();
        let op = match self.peek() {
            Lexeme::Tok(Token::Minus) => Some(UnaryOp::Neg),
            Lexeme::Tok(Token::Tilde) => Some(UnaryOp::BitNot),
            Lexeme::Tok(Token::Plus) => {
                self.advance();
                return self.parse_unary();
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(self.push_expr(Expr::Unary { op, operand }, pos))
            }
            None => self.parse_power(),
        }
    }

    /// Parse power: a ** b (right associative, tighter than a leading unary minus)
    fn parse_power(&mut self) -> CompileResult<ExprId> {
        let base = self.parse_primary()?;
        if self.check(&Token::DoubleStar) {
            let pos = self.pos();
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(self.push_expr(
                Expr::Binary { op: BinaryOp::Pow, lhs: base, rhs: exponent },
                pos,
            ));
        }
        Ok(base)
    }

    /// Parse primary expressions: literals, names, calls, parenthesized
    fn parse_primary(&mut self) -> CompileResult<ExprId> {
        let pos = self.pos();
        match self.peek().clone() {
            Lexeme::Tok(Token::Int(v)) => {
                self.advance();
                Ok(self.push_expr(Expr::Int(v), pos))
            }
            Lexeme::Tok(Token::Float(v)) => {
                self.advance();
                Ok(self.push_expr(Expr::Float(v), pos))
            }
            Lexeme::Tok(Token::Imag(v)) => {
                self.advance();
                Ok(self.push_expr(Expr::Imag(v), pos))
            }
            Lexeme::Tok(Token::Str(s)) => {
                self.advance();
                Ok(self.push_expr(Expr::Str(s), pos))
            }
            Lexeme::Tok(Token::True) => {
                self.advance();
                Ok(self.push_expr(Expr::Bool(true), pos))
            }
            Lexeme::Tok(Token::False) => {
                self.advance();
                Ok(self.push_expr(Expr::Bool(false), pos))
            }
            Lexeme::Tok(Token::Ident(name)) => {
                self.advance();
                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    return Ok(self.push_expr(Expr::Call { name, args }, pos));
                }
                Ok(self.push_expr(Expr::Name(name), pos))
            }
            Lexeme::Tok(Token::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Lexeme::Tok(Token::LBrace) => Err(brace_error(pos)),
            other => Err(CompileError::syntax(
                pos,
                format!("expected an expression, found {}", other),
            )),
        }
    }

    /// Parse a parenthesized, comma-separated argument list
    fn parse_args(&mut self) -> CompileResult<Vec<ExprId>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat(&Token::Comma) || self.check(&Token::RParen) {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }
}

fn brace_error(pos: Pos) -> CompileError {
    CompileError::syntax(pos, "brace blocks are not supported; use `:` and indentation")
}

/// Collect `# me:key=value` pragmas from the comment header before the first code line
pub fn parse_pragmas(source: &str) -> CompileResult<Pragmas> {
    let mut pragmas = Pragmas::default();
    let mut seen = HashSet::new();

    for (line_no, line) in source.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix('#') else {
            break;
        };
        let Some(body) = comment.trim_start().strip_prefix("me:") else {
            continue;
        };
        let pos = Pos::new(line_no as u32 + 1, (line.len() - trimmed.len()) as u32 + 1);

        let (key, value) = match body.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => {
                return Err(CompileError::syntax(
                    pos,
                    format!("malformed pragma `me:{}`, expected `me:key=value`", body.trim()),
                ))
            }
        };
        if !seen.insert(key.to_string()) {
            return Err(CompileError::syntax(pos, format!("duplicate pragma `me:{}`", key)));
        }

        match key {
            "fp" => {
                pragmas.fp = match value {
                    "strict" => FpMode::Strict,
                    "contract" => FpMode::Contract,
                    "fast" => FpMode::Fast,
                    _ => {
                        return Err(CompileError::syntax(
                            pos,
                            format!(
                                "unknown fp mode `{}` (expected strict, contract or fast)",
                                value
                            ),
                        ))
                    }
                };
            }
            "dialect" => {
                pragmas.dialect = match value {
                    "vector" => Dialect::Vector,
                    "element" => Dialect::Element,
                    _ => {
                        return Err(CompileError::syntax(
                            pos,
                            format!("unknown dialect `{}` (expected vector or element)", value),
                        ))
                    }
                };
            }
            "compiler" => {
                if !matches!(value, "tcc" | "cc") {
                    return Err(CompileError::syntax(
                        pos,
                        format!("unknown compiler `{}` (expected tcc or cc)", value),
                    ));
                }
                pragmas.compiler = Some(value.to_string());
            }
            _ => {
                return Err(CompileError::syntax(pos, format!("unknown pragma `me:{}`", key)));
            }
        }
    }
    Ok(pragmas)
}
