//! Single-pass Pratt compiler: tokens go straight to bytecode, with no
//! intermediate AST. Scope resolution, upvalue capture, loop-jump
//! patching, and class/method emission all happen inline as the parser
//! walks the token stream.

pub mod rules;

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::gc::objects::{FunctionObj, ObjData};
use crate::gc::{GcRef, Heap};
use crate::lexer::Lexer;
use crate::numeric::split_u24;
use crate::opcode::Opcode;
use crate::source::Source;
use crate::span::{Span, Spanned};
use crate::syntax::Syntax;
use crate::token::TokenKind;
use crate::value::{fnv1a_hash, Value};
use rules::{get_rule, Handler, Precedence};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: u16 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
    Lambda,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
    is_const: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct LoopCtx {
    break_jumps: Vec<usize>,
    loop_scope_depth: i32,
    continue_target: usize,
}

struct ClassCtx {
    has_superclass: bool,
}

/// Per-function compiler record. The whole stack of these lives in
/// `Parser::scopes`, indexed directly rather than linked through an
/// `enclosing` pointer, since safe Rust makes that chain awkward to walk
/// mutably; `resolve_upvalue` recurses by index instead.
struct FnScope {
    kind: FunctionKind,
    function_name: Option<String>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopCtx>,
    nesting_level: i32,
}

impl FnScope {
    fn new(kind: FunctionKind, function_name: Option<String>) -> FnScope {
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // anonymous placeholder (the callee itself) otherwise.
        let slot0_name = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this".to_string(),
            _ => String::new(),
        };
        FnScope {
            kind,
            function_name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false, is_const: true }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            nesting_level: 0,
        }
    }
}

pub struct Parser<'h> {
    heap: &'h mut Heap,
    #[allow(dead_code)]
    source: Rc<Source>,
    tokens: Vec<Spanned<TokenKind>>,
    current: usize,
    scopes: Vec<FnScope>,
    classes: Vec<ClassCtx>,
    errors: Vec<Syntax>,
    panic_mode: bool,
}

/// Compiles a whole program into a top-level function. Errors accumulate
/// (panic-mode recovery resynchronizes at the next statement boundary);
/// if any were recorded the whole compilation fails.
pub fn compile(source: Rc<Source>, heap: &mut Heap) -> Result<GcRef, Vec<Syntax>> {
    let tokens = Lexer::lex(Rc::clone(&source));
    let parser = Parser::new(source, tokens, heap);
    parser.run()
}

impl<'h> Parser<'h> {
    fn new(source: Rc<Source>, tokens: Vec<Spanned<TokenKind>>, heap: &'h mut Heap) -> Parser<'h> {
        Parser {
            heap,
            source,
            tokens,
            current: 0,
            scopes: vec![FnScope::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    fn run(mut self) -> Result<GcRef, Vec<Syntax>> {
        while !self.check(&TokenKind::Eof) {
            match self.declaration() {
                Ok(()) => {}
                Err(e) => {
                    self.errors.push(e);
                    self.panic_mode = true;
                }
            }
            if self.panic_mode {
                self.synchronize();
            }
        }

        let line = self.previous_span().line() as u32;
        self.emit_return(line);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let scope = self.scopes.pop().expect("script scope always present");
        let function = FunctionObj { name: None, arity: 0, upvalue_count: 0, chunk: scope.chunk };
        Ok(self.heap.allocate(ObjData::Function(function)))
    }

    // ---- token access ----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.current].item
    }

    fn peek_span(&self) -> Span {
        self.tokens[self.current].span.clone()
    }

    fn previous(&self) -> &TokenKind {
        &self.tokens[self.current - 1].item
    }

    fn previous_span(&self) -> Span {
        self.tokens[self.current - 1].span.clone()
    }

    fn advance(&mut self) -> TokenKind {
        if self.current < self.tokens.len() - 1 {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(kind)
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Result<(), Syntax> {
        if self.check(kind) {
            self.advance();
            return Ok(());
        }
        Err(Syntax::error(message, &self.peek_span()))
    }

    fn consume_identifier(&mut self, message: &str) -> Result<String, Syntax> {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(Syntax::error(message, &self.peek_span())),
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(&TokenKind::Eof) {
            if matches!(self.previous(), TokenKind::Semicolon) {
                return;
            }
            match self.peek() {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ---- scope / chunk plumbing ----

    fn current_scope(&self) -> &FnScope {
        self.scopes.last().expect("at least one scope")
    }

    fn current_scope_mut(&mut self) -> &mut FnScope {
        self.scopes.last_mut().expect("at least one scope")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_scope_mut().chunk
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode, line: u32) {
        self.current_chunk().write_op(op, line);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        self.current_scope_mut().chunk.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value, line: u32) {
        let idx = self.make_constant(value);
        if idx <= u8::MAX as usize {
            self.emit_op(Opcode::Constant, line);
            self.emit_byte(idx as u8, line);
        } else {
            self.emit_op(Opcode::ConstantLong, line);
            for b in split_u24(idx) {
                self.emit_byte(b, line);
            }
        }
    }

    fn emit_global_op(&mut self, short: Opcode, long: Opcode, idx: usize, line: u32) {
        if idx <= u8::MAX as usize {
            self.emit_op(short, line);
            self.emit_byte(idx as u8, line);
        } else {
            self.emit_op(long, line);
            for b in split_u24(idx) {
                self.emit_byte(b, line);
            }
        }
    }

    fn emit_jump(&mut self, op: Opcode, line: u32) -> usize {
        self.emit_op(op, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> Result<(), Syntax> {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(Syntax::error("too much code to jump over", &self.previous_span()));
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.current_chunk();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<(), Syntax> {
        self.emit_op(Opcode::Loop, line);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(Syntax::error("loop body too large", &self.previous_span()));
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0], line);
        self.emit_byte(bytes[1], line);
        Ok(())
    }

    fn emit_return(&mut self, line: u32) {
        match self.current_scope().kind {
            FunctionKind::Initializer => {
                self.emit_op(Opcode::GetLocal, line);
                self.emit_byte(0, line);
            }
            _ => self.emit_op(Opcode::Nil, line),
        }
        self.emit_op(Opcode::Return, line);
    }

    fn intern(&mut self, s: &str) -> GcRef {
        let hash = fnv1a_hash(s.as_bytes());
        self.heap.intern_string(s, hash)
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let r = self.intern(name);
        self.make_constant(Value::Obj(r))
    }

    // ---- scopes and locals ----

    fn begin_scope(&mut self) {
        self.current_scope_mut().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let depth = self.current_scope().scope_depth - 1;
        self.current_scope_mut().scope_depth = depth;
        loop {
            let should_pop = match self.current_scope().locals.last() {
                Some(local) => local.depth > depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let local = self.current_scope_mut().locals.pop().unwrap();
            if local.is_captured {
                self.emit_op(Opcode::CloseUpvalue, line);
            } else {
                self.emit_op(Opcode::Pop, line);
            }
        }
    }

    fn resolve_local(&self, scope_idx: usize, name: &str) -> Result<Option<usize>, Syntax> {
        let scope = &self.scopes[scope_idx];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(Syntax::error(
                        &format!("can't read local variable '{}' in its own initializer", name),
                        &self.previous_span(),
                    ));
                }
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> Result<usize, Syntax> {
        let scope = &mut self.scopes[scope_idx];
        for (i, uv) in scope.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Ok(i);
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            return Err(Syntax::error("too many closure variables in function", &self.previous_span()));
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        Ok(scope.upvalues.len() - 1)
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Result<Option<usize>, Syntax> {
        if scope_idx == 0 {
            return Ok(None);
        }
        let enclosing_idx = scope_idx - 1;
        if let Some(local_idx) = self.resolve_local(enclosing_idx, name)? {
            self.scopes[enclosing_idx].locals[local_idx].is_captured = true;
            let index = self.add_upvalue(scope_idx, local_idx as u8, true)?;
            return Ok(Some(index));
        }
        if let Some(up_idx) = self.resolve_upvalue(enclosing_idx, name)? {
            let index = self.add_upvalue(scope_idx, up_idx as u8, false)?;
            return Ok(Some(index));
        }
        Ok(None)
    }

    fn add_local(&mut self, name: String, is_const: bool) -> Result<(), Syntax> {
        let scope = self.current_scope_mut();
        if scope.locals.len() >= MAX_LOCALS {
            return Err(Syntax::error("too many local variables in function", &self.previous_span()));
        }
        scope.locals.push(Local { name, depth: -1, is_captured: false, is_const });
        Ok(())
    }

    fn declare_variable(&mut self, name: &str, is_const: bool) -> Result<(), Syntax> {
        if self.current_scope().scope_depth == 0 {
            return Ok(());
        }
        let depth = self.current_scope().scope_depth;
        for local in self.current_scope().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                return Err(Syntax::error(
                    &format!("variable '{}' already declared in this scope", name),
                    &self.previous_span(),
                ));
            }
        }
        self.add_local(name.to_string(), is_const)
    }

    fn mark_initialized(&mut self) {
        if self.current_scope().scope_depth == 0 {
            return;
        }
        let depth = self.current_scope().scope_depth;
        if let Some(local) = self.current_scope_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn pop_locals_to_depth(&mut self, depth: i32, line: u32) {
        for local in self.current_scope().locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(Opcode::CloseUpvalue, line);
            } else {
                self.emit_op(Opcode::Pop, line);
            }
        }
    }

    // ---- variable reads/writes ----

    fn named_variable(&mut self, name: &str, can_assign: bool, line: u32) -> Result<(), Syntax> {
        let scope_idx = self.scopes.len() - 1;
        if let Some(i) = self.resolve_local(scope_idx, name)? {
            let is_const = self.scopes[scope_idx].locals[i].is_const;
            return self.emit_variable_access(Opcode::GetLocal, Opcode::SetLocal, i as u8, is_const, name, can_assign, line);
        }
        if let Some(i) = self.resolve_upvalue(scope_idx, name)? {
            return self.emit_variable_access(Opcode::GetUpvalue, Opcode::SetUpvalue, i as u8, false, name, can_assign, line);
        }
        self.named_global(name, can_assign, line)
    }

    fn emit_variable_access(
        &mut self,
        get_op: Opcode,
        set_op: Opcode,
        arg: u8,
        is_const: bool,
        name: &str,
        can_assign: bool,
        line: u32,
    ) -> Result<(), Syntax> {
        if can_assign && self.matches(&TokenKind::Equal) {
            if is_const {
                return Err(Syntax::error(&format!("can't assign to const variable '{}'", name), &self.previous_span()));
            }
            self.expression()?;
            self.emit_op(set_op, line);
            self.emit_byte(arg, line);
        } else if can_assign && (self.matches(&TokenKind::PlusEqual) || self.check_was_minus_equal()) {
            if is_const {
                return Err(Syntax::error(&format!("can't assign to const variable '{}'", name), &self.previous_span()));
            }
            let op = if matches!(self.previous(), TokenKind::PlusEqual) { Opcode::Add } else { Opcode::Subtract };
            self.emit_op(get_op, line);
            self.emit_byte(arg, line);
            self.expression()?;
            self.emit_op(op, line);
            self.emit_op(set_op, line);
            self.emit_byte(arg, line);
        } else {
            self.emit_op(get_op, line);
            self.emit_byte(arg, line);
        }
        Ok(())
    }

    /// Helper so `+=`/`-=` can share one branch above: consumes a
    /// `MinusEqual` if that's what's next, mirroring `matches`.
    fn check_was_minus_equal(&mut self) -> bool {
        self.matches(&TokenKind::MinusEqual)
    }

    fn named_global(&mut self, name: &str, can_assign: bool, line: u32) -> Result<(), Syntax> {
        let idx = self.identifier_constant(name);
        if can_assign && self.matches(&TokenKind::Equal) {
            self.expression()?;
            self.emit_global_op(Opcode::SetGlobal, Opcode::SetGlobalLong, idx, line);
        } else if can_assign && (self.matches(&TokenKind::PlusEqual) || self.check_was_minus_equal()) {
            let op = if matches!(self.previous(), TokenKind::PlusEqual) { Opcode::Add } else { Opcode::Subtract };
            self.emit_global_op(Opcode::GetGlobal, Opcode::GetGlobalLong, idx, line);
            self.expression()?;
            self.emit_op(op, line);
            self.emit_global_op(Opcode::SetGlobal, Opcode::SetGlobalLong, idx, line);
        } else {
            self.emit_global_op(Opcode::GetGlobal, Opcode::GetGlobalLong, idx, line);
        }
        Ok(())
    }

    // ---- Pratt core ----

    fn expression(&mut self) -> Result<(), Syntax> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), Syntax> {
        self.advance();
        let prefix = get_rule(self.previous()).prefix;
        if prefix == Handler::None {
            return Err(Syntax::error("expected an expression", &self.previous_span()));
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.dispatch(prefix, can_assign)?;

        while get_rule(self.peek()).precedence >= precedence {
            self.advance();
            let infix = get_rule(self.previous()).infix;
            self.dispatch(infix, can_assign)?;
        }

        if can_assign && self.matches(&TokenKind::Equal) {
            return Err(Syntax::error("invalid assignment target", &self.previous_span()));
        }
        Ok(())
    }

    fn dispatch(&mut self, handler: Handler, can_assign: bool) -> Result<(), Syntax> {
        match handler {
            Handler::None => Ok(()),
            Handler::Number => self.number(),
            Handler::StringLit => self.string_lit(),
            Handler::Literal => self.literal(),
            Handler::Grouping => self.grouping(),
            Handler::Unary => self.unary(),
            Handler::Binary => self.binary(),
            Handler::And => self.and_expr(),
            Handler::Or => self.or_expr(),
            Handler::Ternary => self.ternary(),
            Handler::Variable => self.variable(can_assign),
            Handler::Call => self.call(),
            Handler::Dot => self.dot(can_assign),
            Handler::ArrayLit => self.array_or_range_lit(),
            Handler::DictLit => self.dict_lit(),
            Handler::This => self.this_expr(),
            Handler::Super => self.super_expr(),
            Handler::Lambda => self.lambda_expr(),
            Handler::Match => self.match_expr(),
            Handler::Index => self.index_expr(can_assign),
        }
    }

    fn number(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        if let TokenKind::Number(n) = self.previous().clone() {
            self.emit_constant(Value::Number(n), line);
        }
        Ok(())
    }

    fn literal(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        match self.previous() {
            TokenKind::True => self.emit_op(Opcode::True, line),
            TokenKind::False => self.emit_op(Opcode::False, line),
            TokenKind::Nil => self.emit_op(Opcode::Nil, line),
            _ => unreachable!("literal dispatched for non-literal token"),
        }
        Ok(())
    }

    fn string_lit(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        match self.previous().clone() {
            TokenKind::String(s) => {
                let r = self.intern(&s);
                self.emit_constant(Value::Obj(r), line);
            }
            TokenKind::StringInterpStart(first) => {
                let r = self.intern(&first);
                self.emit_constant(Value::Obj(r), line);
                loop {
                    self.expression()?;
                    self.emit_op(Opcode::Add, line);
                    self.consume(&TokenKind::Semicolon, "expected end of interpolated expression")?;
                    match self.peek().clone() {
                        TokenKind::StringInterpStart(seg) => {
                            self.advance();
                            let r = self.intern(&seg);
                            self.emit_constant(Value::Obj(r), line);
                            self.emit_op(Opcode::Add, line);
                        }
                        TokenKind::StringWithInterp(seg) => {
                            self.advance();
                            let r = self.intern(&seg);
                            self.emit_constant(Value::Obj(r), line);
                            self.emit_op(Opcode::Add, line);
                            break;
                        }
                        _ => return Err(Syntax::error("malformed string interpolation", &self.peek_span())),
                    }
                }
            }
            _ => unreachable!("string_lit dispatched for non-string token"),
        }
        Ok(())
    }

    fn grouping(&mut self) -> Result<(), Syntax> {
        self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after expression")
    }

    fn unary(&mut self) -> Result<(), Syntax> {
        let op_kind = self.previous().clone();
        let line = self.previous_span().line() as u32;
        self.parse_precedence(Precedence::Unary)?;
        match op_kind {
            TokenKind::Minus => self.emit_op(Opcode::Negate, line),
            TokenKind::Bang => self.emit_op(Opcode::Not, line),
            _ => unreachable!("unary dispatched for non-unary token"),
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<(), Syntax> {
        let op_kind = self.previous().clone();
        let line = self.previous_span().line() as u32;
        let rule = get_rule(&op_kind);
        self.parse_precedence(rule.precedence.next())?;
        match op_kind {
            TokenKind::Plus => self.emit_op(Opcode::Add, line),
            TokenKind::Minus => self.emit_op(Opcode::Subtract, line),
            TokenKind::Star => self.emit_op(Opcode::Multiply, line),
            TokenKind::Slash => self.emit_op(Opcode::Divide, line),
            TokenKind::BangEqual => {
                self.emit_op(Opcode::Equal, line);
                self.emit_op(Opcode::Not, line);
            }
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal, line),
            TokenKind::Greater => self.emit_op(Opcode::Greater, line),
            TokenKind::GreaterEqual => {
                self.emit_op(Opcode::Less, line);
                self.emit_op(Opcode::Not, line);
            }
            TokenKind::Less => self.emit_op(Opcode::Less, line),
            TokenKind::LessEqual => {
                self.emit_op(Opcode::Greater, line);
                self.emit_op(Opcode::Not, line);
            }
            _ => unreachable!("binary dispatched for non-binary token"),
        }
        Ok(())
    }

    fn and_expr(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let end_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit_op(Opcode::Pop, line);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_expr(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let else_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        let end_jump = self.emit_jump(Opcode::Jump, line);
        self.patch_jump(else_jump)?;
        self.emit_op(Opcode::Pop, line);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn ternary(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let then_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit_op(Opcode::Pop, line);
        self.parse_precedence(Precedence::Ternary)?;
        let else_jump = self.emit_jump(Opcode::Jump, line);
        self.patch_jump(then_jump)?;
        self.emit_op(Opcode::Pop, line);
        self.consume(&TokenKind::Colon, "expected ':' in ternary expression")?;
        self.parse_precedence(Precedence::Ternary)?;
        self.patch_jump(else_jump)
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), Syntax> {
        let name = match self.previous().clone() {
            TokenKind::Identifier(n) => n,
            _ => unreachable!("variable dispatched for non-identifier token"),
        };
        let line = self.previous_span().line() as u32;
        self.named_variable(&name, can_assign, line)
    }

    fn this_expr(&mut self) -> Result<(), Syntax> {
        if self.classes.is_empty() {
            return Err(Syntax::error("can't use 'this' outside of a class", &self.previous_span()));
        }
        let line = self.previous_span().line() as u32;
        self.named_variable("this", false, line)
    }

    fn super_expr(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        match self.classes.last() {
            None => return Err(Syntax::error("can't use 'super' outside of a class", &self.previous_span())),
            Some(ctx) if !ctx.has_superclass => {
                return Err(Syntax::error("can't use 'super' in a class with no superclass", &self.previous_span()));
            }
            Some(_) => {}
        }
        self.consume(&TokenKind::Dot, "expected '.' after 'super'")?;
        let name = self.consume_identifier("expected superclass method name")?;
        let idx = self.identifier_constant(&name) as u8;

        self.named_variable("this", false, line)?;
        self.named_variable("super", false, line)?;
        self.emit_op(Opcode::GetSuper, line);
        self.emit_byte(idx, line);
        Ok(())
    }

    fn lambda_expr(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.function(FunctionKind::Lambda, None, line)
    }

    fn call(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let argc = self.argument_list()?;
        self.emit_op(Opcode::Call, line);
        self.emit_byte(argc, line);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, Syntax> {
        let mut count: u16 = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression()?;
                count += 1;
                if count > MAX_ARGS {
                    return Err(Syntax::error("can't have more than 255 arguments", &self.previous_span()));
                }
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after arguments")?;
        Ok(count as u8)
    }

    fn dot(&mut self, can_assign: bool) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let name = self.consume_identifier("expected property name after '.'")?;
        let idx = self.identifier_constant(&name) as u8;

        if can_assign && self.matches(&TokenKind::Equal) {
            self.expression()?;
            self.emit_op(Opcode::SetProperty, line);
            self.emit_byte(idx, line);
        } else if can_assign && (self.matches(&TokenKind::PlusEqual) || self.check_was_minus_equal()) {
            let op = if matches!(self.previous(), TokenKind::PlusEqual) { Opcode::Add } else { Opcode::Subtract };
            // Receiver is already on the stack (pushed by the left operand).
            // Duplicate it so we can read-then-write through two copies.
            self.emit_op(Opcode::Push, line);
            self.emit_op(Opcode::GetProperty, line);
            self.emit_byte(idx, line);
            self.expression()?;
            self.emit_op(op, line);
            self.emit_op(Opcode::SetProperty, line);
            self.emit_byte(idx, line);
        } else if self.matches(&TokenKind::LeftParen) {
            let argc = self.argument_list()?;
            self.emit_op(Opcode::Invoke, line);
            self.emit_byte(idx, line);
            self.emit_byte(argc, line);
        } else {
            self.emit_op(Opcode::GetProperty, line);
            self.emit_byte(idx, line);
        }
        Ok(())
    }

    /// Handles both `[e, e, …]` array literals and `[a..b]` range
    /// literals, since both start with a bare `[` and can't be told
    /// apart until the first element is parsed.
    fn array_or_range_lit(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        if self.matches(&TokenKind::RightSquareBrace) {
            self.emit_array_op(0, line);
            return Ok(());
        }

        self.expression()?;
        if self.matches(&TokenKind::DoubleDots) {
            self.expression()?;
            self.consume(&TokenKind::RightSquareBrace, "expected ']' after range")?;
            self.emit_op(Opcode::Range, line);
            return Ok(());
        }

        let mut count = 1usize;
        while self.matches(&TokenKind::Comma) {
            if self.check(&TokenKind::RightSquareBrace) {
                break;
            }
            self.expression()?;
            count += 1;
        }
        self.consume(&TokenKind::RightSquareBrace, "expected ']' after array elements")?;
        self.emit_array_op(count, line);
        Ok(())
    }

    fn emit_array_op(&mut self, count: usize, line: u32) {
        if count <= u8::MAX as usize {
            self.emit_op(Opcode::Array, line);
            self.emit_byte(count as u8, line);
        } else {
            self.emit_op(Opcode::ArrayLong, line);
            for b in split_u24(count) {
                self.emit_byte(b, line);
            }
        }
    }

    fn dict_lit(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let mut count = 0usize;
        if !self.check(&TokenKind::RightBrace) {
            loop {
                let key = self.dict_key()?;
                self.emit_constant(Value::Obj(key), line);
                self.consume(&TokenKind::Colon, "expected ':' after dict key")?;
                self.expression()?;
                count += 1;
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                if self.check(&TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after dict entries")?;
        self.emit_map_op(count, line);
        Ok(())
    }

    fn dict_key(&mut self) -> Result<GcRef, Syntax> {
        match self.peek().clone() {
            TokenKind::String(s) => {
                self.advance();
                Ok(self.intern(&s))
            }
            TokenKind::Identifier(s) => {
                self.advance();
                Ok(self.intern(&s))
            }
            _ => Err(Syntax::error("expected a dict key", &self.peek_span())),
        }
    }

    fn emit_map_op(&mut self, count: usize, line: u32) {
        if count <= u8::MAX as usize {
            self.emit_op(Opcode::Map, line);
            self.emit_byte(count as u8, line);
        } else {
            self.emit_op(Opcode::MapLong, line);
            for b in split_u24(count) {
                self.emit_byte(b, line);
            }
        }
    }

    /// Postfix `[` indexing: `a[i]`, chainable, with both plain (`a[i] =
    /// v`) and compound (`a[i] += v`) assignment. Chained indexing works
    /// for free because the Pratt loop re-invokes this handler on the
    /// value the previous `GET_ELEMENT` left on the stack.
    ///
    /// Compound assignment can't just do get/op/set the way a named
    /// variable does, since `container` and `index` are arbitrary
    /// expressions already evaluated onto the stack — re-running them
    /// would re-evaluate any side effects twice. Instead `GET_ELEMENT_FROM_TOP`
    /// reads through the `[container, index]` pair already on the stack
    /// without consuming them, and `INDIRECT_STORE` consumes that same
    /// pair plus the computed result to write back and leave the result
    /// as the expression's value.
    fn index_expr(&mut self, can_assign: bool) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.expression()?;
        self.consume(&TokenKind::RightSquareBrace, "expected ']' after index")?;

        if can_assign && self.matches(&TokenKind::Equal) {
            self.expression()?;
            self.emit_op(Opcode::SetElement, line);
        } else if can_assign && (self.matches(&TokenKind::PlusEqual) || self.check_was_minus_equal()) {
            let op = if matches!(self.previous(), TokenKind::PlusEqual) { Opcode::Add } else { Opcode::Subtract };
            self.emit_op(Opcode::GetElementFromTop, line);
            self.expression()?;
            self.emit_op(op, line);
            self.emit_op(Opcode::IndirectStore, line);
        } else {
            self.emit_op(Opcode::GetElement, line);
        }
        Ok(())
    }

    /// `match e { p1 => e1, p2 => e2, _ => e3 }`, sugar compiled as a
    /// chain of equality tests against the scrutinee. `_` is a wildcard
    /// arm that always matches (and must be checked for before emitting
    /// any comparison).
    fn match_expr(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.parse_precedence(Precedence::Or)?;
        self.consume(&TokenKind::LeftBrace, "expected '{' after match scrutinee")?;

        let mut end_jumps: Vec<usize> = Vec::new();
        let mut pending_check: Option<usize> = None;

        loop {
            if self.check(&TokenKind::RightBrace) {
                break;
            }
            if let Some(j) = pending_check.take() {
                self.patch_jump(j)?;
                self.emit_op(Opcode::Pop, line);
            }

            let is_wildcard = matches!(self.peek(), TokenKind::Identifier(n) if n == "_");
            if is_wildcard {
                self.advance();
            } else {
                self.emit_op(Opcode::Push, line);
                self.parse_precedence(Precedence::Ternary.next())?;
                self.emit_op(Opcode::Equal, line);
                pending_check = Some(self.emit_jump(Opcode::JumpIfFalse, line));
                self.emit_op(Opcode::Pop, line);
            }

            self.consume(&TokenKind::MatchesTo, "expected '=>' after match pattern")?;
            self.parse_precedence(Precedence::Assignment)?;
            self.emit_op(Opcode::Swap, line);
            self.emit_byte(0, line);
            self.emit_byte(1, line);
            self.emit_op(Opcode::Pop, line);
            end_jumps.push(self.emit_jump(Opcode::Jump, line));

            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after match arms")?;

        if let Some(j) = pending_check {
            self.patch_jump(j)?;
            self.emit_op(Opcode::Pop, line);
            self.emit_op(Opcode::Pop, line);
            self.emit_op(Opcode::Nil, line);
        }

        for j in end_jumps {
            self.patch_jump(j)?;
        }
        Ok(())
    }

    // ---- functions ----

    fn function(&mut self, kind: FunctionKind, name: Option<String>, line: u32) -> Result<(), Syntax> {
        self.scopes.push(FnScope::new(kind, name.clone()));
        self.begin_scope();

        self.consume(&TokenKind::LeftParen, "expected '(' after function name")?;
        if !self.check(&TokenKind::RightParen) {
            loop {
                let new_arity = self.current_scope().arity as u16 + 1;
                if new_arity > MAX_ARGS {
                    return Err(Syntax::error("can't have more than 255 parameters", &self.peek_span()));
                }
                self.current_scope_mut().arity = new_arity as u8;
                let pname = self.consume_identifier("expected parameter name")?;
                self.declare_variable(&pname, false)?;
                self.mark_initialized();
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "expected ')' after parameters")?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before function body")?;
        self.block()?;

        let end_line = self.previous_span().line() as u32;
        self.emit_return(end_line);

        let finished = self.scopes.pop().expect("pushed scope");
        let upvalue_count = finished.upvalues.len() as u8;
        let name_ref = finished.function_name.as_ref().map(|n| self.intern(n));
        let function = FunctionObj { name: name_ref, arity: finished.arity, upvalue_count, chunk: finished.chunk };
        let r = self.heap.allocate(ObjData::Function(function));
        let idx = self.make_constant(Value::Obj(r));

        if idx <= u8::MAX as usize {
            self.emit_op(Opcode::Closure, line);
            self.emit_byte(idx as u8, line);
        } else {
            self.emit_op(Opcode::ClosureLong, line);
            for b in split_u24(idx) {
                self.emit_byte(b, line);
            }
        }
        for uv in &finished.upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 }, line);
            self.emit_byte(uv.index, line);
        }
        Ok(())
    }

    // ---- declarations ----

    fn declaration(&mut self) -> Result<(), Syntax> {
        if self.matches(&TokenKind::Class) {
            self.class_declaration()
        } else if self.matches(&TokenKind::Fn) {
            self.fn_declaration()
        } else if self.matches(&TokenKind::Var) {
            self.var_declaration(false)
        } else if self.matches(&TokenKind::Const) {
            self.consume(&TokenKind::Var, "expected 'var' after 'const'")?;
            self.var_declaration(true)
        } else {
            self.statement()
        }
    }

    fn var_declaration(&mut self, is_const: bool) -> Result<(), Syntax> {
        let line = self.peek_span().line() as u32;
        let name = self.consume_identifier("expected variable name")?;
        let is_global = self.current_scope().scope_depth == 0;
        if !is_global {
            self.declare_variable(&name, is_const)?;
        }

        if self.matches(&TokenKind::Equal) {
            self.expression()?;
        } else if is_const {
            return Err(Syntax::error("const variable must be initialized", &self.previous_span()));
        } else {
            self.emit_op(Opcode::Nil, line);
        }
        self.consume(&TokenKind::Semicolon, "expected ';' after variable declaration")?;

        if is_global {
            let idx = self.identifier_constant(&name);
            let (short, long) = if is_const {
                (Opcode::DefineConstGlobal, Opcode::DefineConstGlobalLong)
            } else {
                (Opcode::DefineGlobal, Opcode::DefineGlobalLong)
            };
            self.emit_global_op(short, long, idx, line);
        } else {
            self.mark_initialized();
        }
        Ok(())
    }

    fn fn_declaration(&mut self) -> Result<(), Syntax> {
        let line = self.peek_span().line() as u32;
        let name = self.consume_identifier("expected function name")?;
        let is_global = self.current_scope().scope_depth == 0;
        if !is_global {
            self.declare_variable(&name, false)?;
            self.mark_initialized();
        }
        self.function(FunctionKind::Function, Some(name.clone()), line)?;
        if is_global {
            let idx = self.identifier_constant(&name);
            self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobalLong, idx, line);
        }
        Ok(())
    }

    fn class_declaration(&mut self) -> Result<(), Syntax> {
        let line = self.peek_span().line() as u32;
        let name = self.consume_identifier("expected class name")?;
        let name_idx = self.identifier_constant(&name);

        let is_global = self.current_scope().scope_depth == 0;
        if !is_global {
            self.declare_variable(&name, false)?;
            self.mark_initialized();
        }

        self.emit_op(Opcode::Class, line);
        self.emit_byte(name_idx as u8, line);
        if is_global {
            self.emit_global_op(Opcode::DefineGlobal, Opcode::DefineGlobalLong, name_idx, line);
        }

        let mut has_superclass = false;
        if self.matches(&TokenKind::Expands) {
            let super_name = self.consume_identifier("expected superclass name")?;
            if super_name == name {
                return Err(Syntax::error("a class can't inherit from itself", &self.previous_span()));
            }
            self.named_variable(&super_name, false, line)?;

            self.begin_scope();
            self.add_local("super".to_string(), true)?;
            self.mark_initialized();

            self.named_variable(&name, false, line)?;
            self.emit_op(Opcode::Inherit, line);
            has_superclass = true;
        }

        self.classes.push(ClassCtx { has_superclass });

        self.named_variable(&name, false, line)?;
        self.consume(&TokenKind::LeftBrace, "expected '{' before class body")?;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.matches(&TokenKind::Var) {
                self.class_field(false)?;
            } else if self.matches(&TokenKind::Const) {
                self.consume(&TokenKind::Var, "expected 'var' after 'const'")?;
                self.class_field(true)?;
            } else {
                self.method()?;
            }
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after class body")?;
        self.emit_op(Opcode::Pop, line);

        if has_superclass {
            self.end_scope(line);
        }
        self.classes.pop();
        Ok(())
    }

    fn class_field(&mut self, is_const: bool) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let name = self.consume_identifier("expected field name")?;
        let idx = self.identifier_constant(&name) as u8;
        self.consume(&TokenKind::Semicolon, "expected ';' after field declaration")?;
        self.emit_op(Opcode::DefineProperty, line);
        self.emit_byte(idx, line);
        self.emit_byte(if is_const { 1 } else { 0 }, line);
        Ok(())
    }

    fn method(&mut self) -> Result<(), Syntax> {
        let line = self.peek_span().line() as u32;
        let name = self.consume_identifier("expected method name")?;
        let idx = self.identifier_constant(&name) as u8;
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, Some(name), line)?;
        self.emit_op(Opcode::Method, line);
        self.emit_byte(idx, line);
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<(), Syntax> {
        if self.matches(&TokenKind::Print) {
            self.print_statement()
        } else if self.matches(&TokenKind::If) {
            self.if_statement()
        } else if self.matches(&TokenKind::While) {
            self.while_statement()
        } else if self.matches(&TokenKind::For) {
            self.for_statement()
        } else if self.matches(&TokenKind::Return) {
            self.return_statement()
        } else if self.matches(&TokenKind::Break) {
            self.break_statement()
        } else if self.matches(&TokenKind::Continue) {
            self.continue_statement()
        } else if self.matches(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block()?;
            let line = self.previous_span().line() as u32;
            self.end_scope(line);
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<(), Syntax> {
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration()?;
        }
        self.consume(&TokenKind::RightBrace, "expected '}' after block")
    }

    fn print_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.expression()?;
        self.consume(&TokenKind::Semicolon, "expected ';' after value")?;
        self.emit_op(Opcode::Print, line);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), Syntax> {
        self.expression()?;
        let line = self.previous_span().line() as u32;
        self.consume(&TokenKind::Semicolon, "expected ';' after expression")?;
        self.emit_op(Opcode::Pop, line);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.consume(&TokenKind::LeftParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after condition")?;

        let then_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit_op(Opcode::Pop, line);
        self.statement()?;

        let else_jump = self.emit_jump(Opcode::Jump, line);
        self.patch_jump(then_jump)?;
        self.emit_op(Opcode::Pop, line);

        if self.matches(&TokenKind::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let loop_start = self.current_chunk().code.len();
        self.current_scope_mut().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            loop_scope_depth: self.current_scope().scope_depth,
            continue_target: loop_start,
        });

        self.consume(&TokenKind::LeftParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.consume(&TokenKind::RightParen, "expected ')' after condition")?;

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit_op(Opcode::Pop, line);
        self.statement()?;

        let loop_line = self.previous_span().line() as u32;
        self.emit_loop(loop_start, loop_line)?;

        self.patch_jump(exit_jump)?;
        self.emit_op(Opcode::Pop, loop_line);

        let ctx = self.current_scope_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j)?;
        }
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), Syntax> {
        if self.check(&TokenKind::LeftParen) {
            self.c_style_for_statement()
        } else {
            self.for_in_statement()
        }
    }

    fn c_style_for_statement(&mut self) -> Result<(), Syntax> {
        self.begin_scope();
        self.consume(&TokenKind::LeftParen, "expected '(' after 'for'")?;

        if self.matches(&TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(&TokenKind::Var) {
            self.var_declaration(false)?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.matches(&TokenKind::Semicolon) {
            let line = self.peek_span().line() as u32;
            self.expression()?;
            self.consume(&TokenKind::Semicolon, "expected ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse, line));
            self.emit_op(Opcode::Pop, line);
        }

        if !self.check(&TokenKind::RightParen) {
            let line = self.peek_span().line() as u32;
            let body_jump = self.emit_jump(Opcode::Jump, line);
            let increment_start = self.current_chunk().code.len();
            self.expression()?;
            self.emit_op(Opcode::Pop, line);
            self.consume(&TokenKind::RightParen, "expected ')' after for clauses")?;

            self.emit_loop(loop_start, line)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        } else {
            self.consume(&TokenKind::RightParen, "expected ')' after for clauses")?;
        }

        self.current_scope_mut().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            loop_scope_depth: self.current_scope().scope_depth,
            continue_target: loop_start,
        });

        self.statement()?;

        let line = self.previous_span().line() as u32;
        self.emit_loop(loop_start, line)?;

        if let Some(j) = exit_jump {
            self.patch_jump(j)?;
            self.emit_op(Opcode::Pop, line);
        }

        let ctx = self.current_scope_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j)?;
        }

        self.end_scope(line);
        Ok(())
    }

    /// The "hard" loop: `for id in iterable stmt`. A synthetic counter
    /// local tracks position; `QUEUE`/`DEQUE`/`QUEUE_REWIND` preserve the
    /// evaluated iterable across a nested for-in's body so an outer
    /// iterable isn't re-evaluated on every inner iteration.
    ///
    /// Mirrors the C-style for's increment placement: the counter-advance
    /// code is emitted between the recheck and the body (skipped over on
    /// the way in via `body_jump`, looped back to on the way round), so
    /// `continue` can target it directly and still advance the counter,
    /// the same way it targets `increment_start` in `c_style_for_statement`.
    fn for_in_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        self.begin_scope();

        let var_name = self.consume_identifier("expected loop variable name")?;
        self.add_local(var_name, false)?;
        self.mark_initialized();
        self.emit_op(Opcode::Nil, line);

        self.add_local("__for_each_count".to_string(), false)?;
        self.mark_initialized();
        self.emit_constant(Value::Number(0.0), line);
        let counter_slot = (self.current_scope().locals.len() - 1) as u8;

        self.consume(&TokenKind::In, "expected 'in' after loop variable")?;
        self.expression()?;

        let nested = self.current_scope().nesting_level > 0;
        if nested {
            self.emit_op(Opcode::IncrementNestingLvl, line);
        }
        self.current_scope_mut().nesting_level += 1;
        self.emit_op(Opcode::Queue, line);

        let check_start = self.current_chunk().code.len();
        self.emit_op(Opcode::Deque, line);
        self.emit_op(Opcode::ForEach, line);
        self.emit_byte(counter_slot, line);
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse, line);
        self.emit_op(Opcode::Pop, line);

        let body_jump = self.emit_jump(Opcode::Jump, line);
        let increment_start = self.current_chunk().code.len();
        self.emit_op(Opcode::GetLocal, line);
        self.emit_byte(counter_slot, line);
        self.emit_constant(Value::Number(1.0), line);
        self.emit_op(Opcode::Add, line);
        self.emit_op(Opcode::SetLocal, line);
        self.emit_byte(counter_slot, line);
        self.emit_op(Opcode::Pop, line);
        self.emit_op(Opcode::QueueRewind, line);
        self.emit_loop(check_start, line)?;
        self.patch_jump(body_jump)?;

        self.current_scope_mut().loops.push(LoopCtx {
            break_jumps: Vec::new(),
            loop_scope_depth: self.current_scope().scope_depth,
            continue_target: increment_start,
        });

        self.statement()?;

        let body_line = self.previous_span().line() as u32;
        self.emit_loop(increment_start, body_line)?;

        self.patch_jump(exit_jump)?;
        self.emit_op(Opcode::Pop, body_line);

        let ctx = self.current_scope_mut().loops.pop().unwrap();
        for j in ctx.break_jumps {
            self.patch_jump(j)?;
        }

        self.current_scope_mut().nesting_level -= 1;
        if nested {
            self.emit_op(Opcode::DecrementNestingLvl, body_line);
        } else {
            self.emit_op(Opcode::QueueClear, body_line);
        }

        self.end_scope(body_line);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        if matches!(self.current_scope().kind, FunctionKind::Script) {
            return Err(Syntax::error("can't return from top-level code", &self.previous_span()));
        }
        if self.matches(&TokenKind::Semicolon) {
            self.emit_return(line);
        } else {
            if matches!(self.current_scope().kind, FunctionKind::Initializer) {
                return Err(Syntax::error("can't return a value from an initializer", &self.previous_span()));
            }
            self.expression()?;
            self.consume(&TokenKind::Semicolon, "expected ';' after return value")?;
            self.emit_op(Opcode::Return, line);
        }
        Ok(())
    }

    fn loop_info(&self, what: &str) -> Result<i32, Syntax> {
        match self.current_scope().loops.last() {
            Some(ctx) => Ok(ctx.loop_scope_depth),
            None => Err(Syntax::error(&format!("can't use '{}' outside of a loop", what), &self.previous_span())),
        }
    }

    fn break_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let depth = self.loop_info("break")?;
        self.pop_locals_to_depth(depth, line);
        self.consume(&TokenKind::Semicolon, "expected ';' after 'break'")?;
        let jump = self.emit_jump(Opcode::Jump, line);
        self.current_scope_mut().loops.last_mut().unwrap().break_jumps.push(jump);
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), Syntax> {
        let line = self.previous_span().line() as u32;
        let depth = self.loop_info("continue")?;
        self.pop_locals_to_depth(depth, line);
        self.consume(&TokenKind::Semicolon, "expected ';' after 'continue'")?;
        let target = self.current_scope().loops.last().unwrap().continue_target;
        self.emit_loop(target, line)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gc::Config;

    fn compiled(src: &str) -> Result<(GcRef, Heap), Vec<Syntax>> {
        let mut heap = Heap::new(Config::default());
        let source = Source::source(src);
        match compile(source, &mut heap) {
            Ok(r) => Ok((r, heap)),
            Err(e) => Err(e),
        }
    }

    fn disassembly(src: &str) -> String {
        let (r, heap) = compiled(src).expect("should compile");
        match heap.get(r) {
            ObjData::Function(f) => f.chunk.disassemble("test", &heap),
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn compiles_arithmetic() {
        let text = disassembly("print 1 + 2 * 3;");
        assert!(text.contains("OP_MULTIPLY"));
        assert!(text.contains("OP_ADD"));
        assert!(text.contains("OP_PRINT"));
    }

    #[test]
    fn compiles_global_var_and_read() {
        let text = disassembly("var x = 5; print x;");
        assert!(text.contains("OP_DEFINE_GLOBAL"));
        assert!(text.contains("OP_GET_GLOBAL"));
    }

    #[test]
    fn rejects_const_global_reassignment() {
        let result = compiled("const var PI = 3; PI = 4;");
        assert!(result.is_err());
    }

    #[test]
    fn compiles_local_scope_with_closing_pops() {
        let text = disassembly("{ var a = 1; var b = 2; print a + b; }");
        assert_eq!(text.matches("OP_POP").count(), 3); // expr stmt pop + 2 scope-exit pops
    }

    #[test]
    fn compiles_closure_capturing_local() {
        let text = disassembly("fn make(){ var c=0; fn inc(){ c=c+1; return c; } return inc; }");
        assert!(text.contains("OP_CLOSURE"));
    }

    #[test]
    fn compiles_class_with_inheritance() {
        let text = disassembly("class A { speak(){ print \"A\"; } } class B expands A { speak(){ super.speak(); } }");
        assert!(text.contains("OP_INHERIT"));
        assert!(text.contains("OP_GET_SUPER"));
    }

    #[test]
    fn compiles_indexed_assignment_and_chained_read() {
        let text = disassembly("var a = [1,2,3]; a[0] = 9; print a[0][0];");
        assert!(text.contains("OP_SET_ELEMENT"));
        assert!(text.contains("OP_GET_ELEMENT"));
    }

    #[test]
    fn compiles_compound_assignment_on_index() {
        let text = disassembly("var a = [1]; a[0] += 1;");
        assert!(text.contains("OP_GET_ELEMENT_FROM_TOP"));
        assert!(text.contains("OP_ADD"));
        assert!(text.contains("OP_INDIRECT_STORE"));
    }

    #[test]
    fn compiles_for_in_loop() {
        let text = disassembly("var a = [1,2,3]; for x in a print x;");
        assert!(text.contains("OP_QUEUE"));
        assert!(text.contains("OP_FOR_EACH"));
        assert!(text.contains("OP_QUEUE_REWIND"));
    }

    #[test]
    fn compiles_string_interpolation_as_concatenation() {
        let text = disassembly("var x = 1; print \"a${x}b\";");
        assert_eq!(text.matches("OP_ADD").count(), 2);
    }
}
