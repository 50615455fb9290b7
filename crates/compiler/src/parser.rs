//! Single-pass Pratt parser.
//!
//! Expressions are compiled straight to bytecode: every expression handler
//! receives a destination register and emits into the innermost function
//! builder, claiming LIFO temporaries for subexpressions. Each token maps
//! to a `(prefix, infix, precedence)` row; `parse_precedence` consumes one
//! prefix handler, then folds infix handlers while the next token's
//! precedence exceeds the minimum.
//!
//! Declarations are compile-time effects. A module-scope `func` or `class`
//! writes its finished object into the module's variable slots as soon as
//! its body closes, which is what lets `super` embed the base class in the
//! constant pool and lets `import` copy live values out of another module.
//!
//! On error the parser records a diagnostic, skips to the next `;` (or end
//! of input) and continues, so one compile can report several problems.

use std::collections::HashMap;

use crate::builder::FnBuilder;
use crate::env::{CompileEnv, ImportError};
use crate::error::{CompileError, CompileErrors};
use crate::lexer::{Lexer, Token, TokenKind};
use ember_core::bytecode::MAX_REGISTER;
use ember_core::{Instr, OpCode, Value};

/// `LoadBasic` immediate selectors.
const LB_TRUE: u32 = 0;
const LB_FALSE: u32 = 1;
const LB_NIL: u32 = 2;
const LB_MODULE: u32 = 3;
/// Constants start at `Bx == 4`; `constants[Bx - 4]` is loaded.
const LB_CONST_BASE: u32 = 4;

/// Operator precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assign,
    Or,
    And,
    Equality,
    Ternary,
    Comparison,
    Term,
    Factor,
    Unary,
    Prefix,
    Postfix,
    Call,
}

fn infix_prec(kind: &TokenKind) -> Prec {
    match kind {
        TokenKind::PipePipe => Prec::Or,
        TokenKind::AmpAmp => Prec::And,
        TokenKind::EqEq | TokenKind::BangEq => Prec::Equality,
        TokenKind::Question => Prec::Ternary,
        TokenKind::Lt | TokenKind::LtEq | TokenKind::Gt | TokenKind::GtEq => Prec::Comparison,
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
        TokenKind::StarStar => Prec::Unary,
        TokenKind::Dot | TokenKind::LBracket => Prec::Postfix,
        TokenKind::LParen => Prec::Call,
        _ => Prec::None,
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier '{name}'"),
        TokenKind::Number(n) => format!("number '{n}'"),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("'{other:?}'"),
    }
}

/// Compile `source` into `module`, returning the module's top-level
/// function. Declarations land in the module as a side effect of parsing.
pub fn compile(
    env: &mut dyn CompileEnv,
    module: Value,
    source: &str,
) -> Result<Value, CompileErrors> {
    let module_name = env.module_name(module);
    let top = FnBuilder::new(&module_name, &[], 1).map_err(|e| CompileErrors(vec![e]))?;
    let mut lexer = Lexer::new(source);
    let current = lexer.next_token();
    let mut parser = Parser {
        env,
        lexer,
        current,
        module,
        builders: vec![top],
        current_class: None,
        loop_depth: 0,
        errors: Vec::new(),
        strings: HashMap::new(),
    };

    while !parser.check(&TokenKind::Eof) {
        parser.declaration();
    }

    let mut errors = parser.errors;
    errors.append(&mut parser.lexer.errors);
    errors.sort_by_key(|e| e.line);
    if !errors.is_empty() {
        return Err(CompileErrors(errors));
    }

    let line = parser.current.line;
    let builder = match parser.builders.pop() {
        Some(b) => b,
        None => return Err(CompileErrors(vec![CompileError::new(line, "parser state lost")])),
    };
    Ok(env.new_function(module, builder.finish(line)))
}

struct Parser<'e, 'src> {
    env: &'e mut dyn CompileEnv,
    lexer: Lexer<'src>,
    current: Token,
    module: Value,
    /// Innermost function last; index 0 is the module's top-level function.
    builders: Vec<FnBuilder>,
    current_class: Option<Value>,
    loop_depth: usize,
    errors: Vec<CompileError>,
    /// Literal cache so identical string constants share one heap object.
    strings: HashMap<String, Value>,
}

type PResult<T = ()> = Result<T, CompileError>;

impl Parser<'_, '_> {
    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn advance(&mut self) -> Token {
        std::mem::replace(&mut self.current, self.lexer.next_token())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> PResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(CompileError::new(
                self.current.line,
                format!("expected {what}, got {}", describe(&self.current.kind)),
            ))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<(String, u32)> {
        let line = self.current.line;
        match &self.current.kind {
            TokenKind::Ident(_) => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(name) => Ok((name, line)),
                    _ => Err(CompileError::new(line, "identifier vanished")),
                }
            }
            other => Err(CompileError::new(
                line,
                format!("expected {what}, got {}", describe(other)),
            )),
        }
    }

    fn builder(&self) -> &FnBuilder {
        self.builders.last().expect("builder stack never empty")
    }

    fn builder_mut(&mut self) -> &mut FnBuilder {
        self.builders.last_mut().expect("builder stack never empty")
    }

    fn at_module_scope(&self) -> bool {
        self.builders.len() == 1 && self.builder().at_root_scope()
    }

    /// Skip to the token after the next `;`, or to end of input.
    fn synchronize(&mut self) {
        loop {
            if self.check(&TokenKind::Eof) {
                return;
            }
            if self.check(&TokenKind::Semi) {
                self.advance();
                return;
            }
            self.advance();
        }
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn field_index(&self, sym: u32, line: u32) -> PResult<u16> {
        if sym > u32::from(MAX_REGISTER) {
            return Err(CompileError::new(line, "too many distinct symbols"));
        }
        Ok(sym as u16)
    }

    fn emit_load_const(&mut self, dst: u16, v: Value, line: u32) -> PResult {
        let idx = self.builder_mut().add_constant(v);
        let bx = idx + LB_CONST_BASE;
        if bx > ember_core::bytecode::BX_MASK {
            return Err(CompileError::new(line, "too many constants in one function"));
        }
        self.builder_mut()
            .emit(Instr::abx(OpCode::LoadBasic, dst, bx), line);
        Ok(())
    }

    fn emit_load_basic(&mut self, dst: u16, selector: u32, line: u32) {
        self.builder_mut()
            .emit(Instr::abx(OpCode::LoadBasic, dst, selector), line);
    }

    fn emit_move(&mut self, dst: u16, src: u16, line: u32) {
        if dst != src {
            self.builder_mut()
                .emit(Instr::abx(OpCode::StoreMove, dst, u32::from(src)), line);
        }
    }

    fn emit_load_symbol(&mut self, dst: u16, obj: u16, sym: u32, line: u32) -> PResult {
        let c = self.field_index(sym, line)?;
        self.builder_mut()
            .emit(Instr::abc(OpCode::LoadSymbol, dst, obj, c), line);
        Ok(())
    }

    fn emit_store_symbol(&mut self, obj: u16, sym: u32, src: u16, line: u32) -> PResult {
        let b = self.field_index(sym, line)?;
        self.builder_mut()
            .emit(Instr::abc(OpCode::StoreSymbol, obj, b, src), line);
        Ok(())
    }

    fn string_value(&mut self, raw: &str) -> Value {
        let text = unescape(raw);
        if let Some(v) = self.strings.get(&text) {
            return *v;
        }
        let v = self.env.new_string(text.clone());
        self.strings.insert(text, v);
        v
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Compile one expression into `dst`, folding infix operators while
    /// their precedence exceeds `min`.
    fn parse_precedence(&mut self, dst: u16, min: Prec) -> PResult {
        let can_assign = min == Prec::None;
        let token = self.advance();
        self.prefix(token, dst, can_assign)?;
        while infix_prec(&self.current.kind) > min {
            let token = self.advance();
            self.infix(token, dst, can_assign)?;
        }
        Ok(())
    }

    fn prefix(&mut self, token: Token, dst: u16, can_assign: bool) -> PResult {
        let line = token.line;
        match token.kind {
            TokenKind::Number(n) => self.emit_load_const(dst, Value::number(n), line),
            TokenKind::Str(raw) => {
                let v = self.string_value(&raw);
                self.emit_load_const(dst, v, line)
            }
            TokenKind::True => {
                self.emit_load_basic(dst, LB_TRUE, line);
                Ok(())
            }
            TokenKind::False => {
                self.emit_load_basic(dst, LB_FALSE, line);
                Ok(())
            }
            TokenKind::Nil => {
                self.emit_load_basic(dst, LB_NIL, line);
                Ok(())
            }
            TokenKind::Ident(name) => self.variable(&name, dst, can_assign, line),
            TokenKind::LParen => {
                self.parse_precedence(dst, Prec::None)?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(())
            }
            TokenKind::Minus => {
                self.parse_precedence(dst, Prec::Unary)?;
                self.builder_mut()
                    .emit(Instr::abx(OpCode::Neg, dst, u32::from(dst)), line);
                Ok(())
            }
            TokenKind::Bang => {
                self.parse_precedence(dst, Prec::Unary)?;
                self.builder_mut()
                    .emit(Instr::abx(OpCode::Not, dst, u32::from(dst)), line);
                Ok(())
            }
            TokenKind::New => self.new_expr(dst, line),
            TokenKind::Super => self.super_expr(dst, line),
            other => Err(CompileError::new(
                line,
                format!("expected an expression, got {}", describe(&other)),
            )),
        }
    }

    fn infix(&mut self, token: Token, dst: u16, can_assign: bool) -> PResult {
        let line = token.line;
        match token.kind {
            TokenKind::Plus => self.binary(OpCode::Add, Prec::Term, dst, line),
            TokenKind::Minus => self.binary(OpCode::Sub, Prec::Term, dst, line),
            TokenKind::Star => self.binary(OpCode::Mul, Prec::Factor, dst, line),
            TokenKind::Slash => self.binary(OpCode::Div, Prec::Factor, dst, line),
            TokenKind::Percent => self.binary(OpCode::Mod, Prec::Factor, dst, line),
            TokenKind::StarStar => self.binary(OpCode::Pow, Prec::Unary, dst, line),
            TokenKind::EqEq => self.binary(OpCode::CmpEq, Prec::Equality, dst, line),
            TokenKind::BangEq => self.binary(OpCode::CmpNe, Prec::Equality, dst, line),
            TokenKind::Lt => self.binary(OpCode::CmpLt, Prec::Comparison, dst, line),
            TokenKind::LtEq => self.binary(OpCode::CmpLe, Prec::Comparison, dst, line),
            TokenKind::Gt => self.binary(OpCode::CmpGt, Prec::Comparison, dst, line),
            TokenKind::GtEq => self.binary(OpCode::CmpGe, Prec::Comparison, dst, line),
            TokenKind::AmpAmp => self.binary(OpCode::And, Prec::And, dst, line),
            TokenKind::PipePipe => self.binary(OpCode::Or, Prec::Or, dst, line),
            TokenKind::Question => self.ternary(dst, line),
            TokenKind::Dot => self.member(dst, can_assign, line),
            TokenKind::LBracket => self.index(dst, can_assign, line),
            TokenKind::LParen => self.call(dst, line),
            other => Err(CompileError::new(
                line,
                format!("{} is not an operator", describe(&other)),
            )),
        }
    }

    /// Left operand is already in `dst`; fold `dst op rhs` back into `dst`.
    fn binary(&mut self, op: OpCode, prec: Prec, dst: u16, line: u32) -> PResult {
        let t = self.builder_mut().push_temp(line)?;
        self.parse_precedence(t, prec)?;
        self.builder_mut().emit(Instr::abc(op, dst, dst, t), line);
        self.builder_mut().pop_temp();
        Ok(())
    }

    fn ternary(&mut self, dst: u16, line: u32) -> PResult {
        let skip_then = self.builder_mut().reserve_jump(OpCode::JumpIfNot, dst, line);
        self.parse_precedence(dst, Prec::None)?;
        self.expect(&TokenKind::Colon, "':' in conditional expression")?;
        let skip_else = self.builder_mut().reserve_jump(OpCode::Jump, 0, line);
        self.builder_mut().patch_jump_to_here(skip_then, line)?;
        // One step below ternary keeps `a ? b : c ? d : e` right-associated.
        self.parse_precedence(dst, Prec::Equality)?;
        self.builder_mut().patch_jump_to_here(skip_else, line)?;
        Ok(())
    }

    /// Identifier reference: local register if declared, module variable
    /// otherwise. Handles `=`, `+=` and `-=` when the context allows.
    fn variable(&mut self, name: &str, dst: u16, can_assign: bool, line: u32) -> PResult {
        if let Some(slot) = self.builder().resolve_local(name) {
            if can_assign && self.eat(&TokenKind::Eq) {
                // Compile into a temp first: the right side may read the
                // local being assigned.
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::None)?;
                self.emit_move(slot, t, line);
                self.builder_mut().pop_temp();
            } else if can_assign && self.check(&TokenKind::PlusEq) {
                self.advance();
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::None)?;
                self.builder_mut()
                    .emit(Instr::abc(OpCode::Add, slot, slot, t), line);
                self.builder_mut().pop_temp();
            } else if can_assign && self.check(&TokenKind::MinusEq) {
                self.advance();
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::None)?;
                self.builder_mut()
                    .emit(Instr::abc(OpCode::Sub, slot, slot, t), line);
                self.builder_mut().pop_temp();
            }
            self.emit_move(dst, slot, line);
            Ok(())
        } else {
            // Absent from every scope: presumed module-level.
            let sym = self.env.intern(name);
            if can_assign && self.eat(&TokenKind::Eq) {
                self.parse_precedence(dst, Prec::None)?;
                let t = self.builder_mut().push_temp(line)?;
                self.emit_load_basic(t, LB_MODULE, line);
                self.emit_store_symbol(t, sym, dst, line)?;
                self.builder_mut().pop_temp();
            } else if can_assign
                && (self.check(&TokenKind::PlusEq) || self.check(&TokenKind::MinusEq))
            {
                let op = if self.check(&TokenKind::PlusEq) {
                    OpCode::Add
                } else {
                    OpCode::Sub
                };
                self.advance();
                self.emit_load_basic(dst, LB_MODULE, line);
                self.emit_load_symbol(dst, dst, sym, line)?;
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::None)?;
                self.builder_mut().emit(Instr::abc(op, dst, dst, t), line);
                self.emit_load_basic(t, LB_MODULE, line);
                self.emit_store_symbol(t, sym, dst, line)?;
                self.builder_mut().pop_temp();
            } else {
                self.emit_load_basic(dst, LB_MODULE, line);
                self.emit_load_symbol(dst, dst, sym, line)?;
            }
            Ok(())
        }
    }

    /// `expr.name`, `expr.name = v`, `expr.name(args)`.
    fn member(&mut self, dst: u16, can_assign: bool, line: u32) -> PResult {
        let (name, _) = self.expect_ident("member name after '.'")?;
        let sym = self.env.intern(&name);
        if can_assign && self.eat(&TokenKind::Eq) {
            let t = self.builder_mut().push_temp(line)?;
            self.parse_precedence(t, Prec::None)?;
            self.emit_store_symbol(dst, sym, t, line)?;
            self.emit_move(dst, t, line);
            self.builder_mut().pop_temp();
            Ok(())
        } else if can_assign
            && (self.check(&TokenKind::PlusEq) || self.check(&TokenKind::MinusEq))
        {
            let op = if self.check(&TokenKind::PlusEq) {
                OpCode::Add
            } else {
                OpCode::Sub
            };
            self.advance();
            let t = self.builder_mut().push_temp(line)?;
            self.emit_load_symbol(t, dst, sym, line)?;
            let rhs = self.builder_mut().push_temp(line)?;
            self.parse_precedence(rhs, Prec::None)?;
            self.builder_mut().emit(Instr::abc(op, t, t, rhs), line);
            self.emit_store_symbol(dst, sym, t, line)?;
            self.emit_move(dst, t, line);
            self.builder_mut().pop_temps(2);
            Ok(())
        } else if self.check(&TokenKind::LParen) {
            self.advance();
            // Method call: receiver becomes the first argument.
            let t_fn = self.builder_mut().push_temp(line)?;
            self.emit_load_symbol(t_fn, dst, sym, line)?;
            let t_self = self.builder_mut().push_temp(line)?;
            self.emit_move(t_self, dst, line);
            let n = self.argument_list(line)? + 1;
            self.builder_mut()
                .emit(Instr::abc(OpCode::Call, t_self, t_fn, n), line);
            self.emit_move(dst, t_self, line);
            self.builder_mut().pop_temps(n + 1);
            Ok(())
        } else {
            self.emit_load_symbol(dst, dst, sym, line)
        }
    }

    /// `expr[idx]` and `expr[idx] = v` dispatch the `[]` and `[]=` methods.
    fn index(&mut self, dst: u16, can_assign: bool, line: u32) -> PResult {
        let t_fn = self.builder_mut().push_temp(line)?;
        let t_self = self.builder_mut().push_temp(line)?;
        self.emit_move(t_self, dst, line);
        let t_idx = self.builder_mut().push_temp(line)?;
        self.parse_precedence(t_idx, Prec::Assign)?;
        self.expect(&TokenKind::RBracket, "']'")?;
        if can_assign && self.eat(&TokenKind::Eq) {
            let sym = self.env.intern("[]=");
            self.emit_load_symbol(t_fn, dst, sym, line)?;
            let t_val = self.builder_mut().push_temp(line)?;
            self.parse_precedence(t_val, Prec::None)?;
            self.builder_mut()
                .emit(Instr::abc(OpCode::Call, t_self, t_fn, 3), line);
            self.emit_move(dst, t_val, line);
            self.builder_mut().pop_temps(4);
        } else {
            let sym = self.env.intern("[]");
            self.emit_load_symbol(t_fn, dst, sym, line)?;
            self.builder_mut()
                .emit(Instr::abc(OpCode::Call, t_self, t_fn, 2), line);
            self.emit_move(dst, t_self, line);
            self.builder_mut().pop_temps(3);
        }
        Ok(())
    }

    /// `callee(args)`. The argument window starts one temp above the
    /// callee's register; the result lands back in `dst`.
    fn call(&mut self, dst: u16, line: u32) -> PResult {
        let base = self.builder_mut().push_temp(line)?;
        let mut n: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            self.parse_precedence(base, Prec::Assign)?;
            n = 1;
            while self.eat(&TokenKind::Comma) {
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::Assign)?;
                n += 1;
            }
        }
        self.expect(&TokenKind::RParen, "')' after arguments")?;
        self.builder_mut()
            .emit(Instr::abc(OpCode::Call, base, dst, n), line);
        self.emit_move(dst, base, line);
        self.builder_mut().pop_temps(n.max(1));
        Ok(())
    }

    /// Parse `expr (, expr)* )` into fresh consecutive temps; the caller
    /// owns (and pops) the temps. Returns the argument count.
    fn argument_list(&mut self, line: u32) -> PResult<u16> {
        let mut n: u16 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::Assign)?;
                n += 1;
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')' after arguments")?;
        Ok(n)
    }

    /// `new Class` or `new Class(args)`. The class expression is a dotted
    /// identifier path. With parentheses, the VM resolves `ctor` on the
    /// class chain; the instance is the expression's value either way.
    fn new_expr(&mut self, dst: u16, line: u32) -> PResult {
        let (name, _) = self.expect_ident("class name after 'new'")?;
        self.variable(&name, dst, false, line)?;
        while self.eat(&TokenKind::Dot) {
            let (field, fline) = self.expect_ident("member name after '.'")?;
            let sym = self.env.intern(&field);
            self.emit_load_symbol(dst, dst, sym, fline)?;
        }
        let t_cls = self.builder_mut().push_temp(line)?;
        self.emit_move(t_cls, dst, line);
        self.builder_mut()
            .emit(Instr::abx(OpCode::NewClz, dst, u32::from(t_cls)), line);
        if self.eat(&TokenKind::LParen) {
            let t_self = self.builder_mut().push_temp(line)?;
            self.emit_move(t_self, dst, line);
            let n = self.argument_list(line)? + 1;
            self.builder_mut()
                .emit(Instr::abc(OpCode::Call, t_self, t_cls, n), line);
            self.builder_mut().pop_temps(n);
        }
        self.builder_mut().pop_temp();
        Ok(())
    }

    /// `super` evaluates to the enclosing class's base class, resolved at
    /// compile time and embedded in the constant pool. `super.m(args)`
    /// calls the base method with the current method's `self` (register 0).
    fn super_expr(&mut self, dst: u16, line: u32) -> PResult {
        let Some(class) = self.current_class else {
            return Err(CompileError::new(line, "'super' outside of a class"));
        };
        let Some(base) = self.env.class_base(class) else {
            return Err(CompileError::new(line, "class has no base class"));
        };
        self.emit_load_const(dst, base, line)?;
        if self.eat(&TokenKind::Dot) {
            let (name, _) = self.expect_ident("member name after '.'")?;
            let sym = self.env.intern(&name);
            if self.eat(&TokenKind::LParen) {
                let t_fn = self.builder_mut().push_temp(line)?;
                self.emit_load_symbol(t_fn, dst, sym, line)?;
                let t_self = self.builder_mut().push_temp(line)?;
                self.emit_move(t_self, 0, line);
                let n = self.argument_list(line)? + 1;
                self.builder_mut()
                    .emit(Instr::abc(OpCode::Call, t_self, t_fn, n), line);
                self.emit_move(dst, t_self, line);
                self.builder_mut().pop_temps(n + 1);
            } else {
                self.emit_load_symbol(dst, dst, sym, line)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Declarations and statements
    // =========================================================================

    fn declaration(&mut self) {
        let result = match self.current.kind {
            TokenKind::Var => self.var_decl(),
            TokenKind::Func => self.func_decl(),
            TokenKind::Class => self.class_decl(),
            TokenKind::Import => self.import_decl(),
            _ => self.statement(),
        };
        if let Err(e) = result {
            self.errors.push(e);
            self.synchronize();
        }
    }

    fn statement(&mut self) -> PResult {
        match self.current.kind {
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Return => self.return_stmt(),
            TokenKind::Break => self.break_stmt(),
            TokenKind::LBrace => self.block(),
            _ => self.expr_stmt(),
        }
    }

    fn var_decl(&mut self) -> PResult {
        let line = self.advance().line; // 'var'
        let (name, _) = self.expect_ident("variable name")?;
        if self.at_module_scope() {
            let sym = self.env.intern(&name);
            self.env.module_declare(self.module, sym);
            if self.eat(&TokenKind::Eq) {
                let t = self.builder_mut().push_temp(line)?;
                self.parse_precedence(t, Prec::None)?;
                let tm = self.builder_mut().push_temp(line)?;
                self.emit_load_basic(tm, LB_MODULE, line);
                self.emit_store_symbol(tm, sym, t, line)?;
                self.builder_mut().pop_temps(2);
            }
        } else {
            let slot = self.builder_mut().declare_local(&name, line)?;
            if self.eat(&TokenKind::Eq) {
                self.parse_precedence(slot, Prec::None)?;
            } else {
                self.emit_load_basic(slot, LB_NIL, line);
            }
        }
        self.expect(&TokenKind::Semi, "';' after variable declaration")?;
        Ok(())
    }

    fn param_list(&mut self) -> PResult<Vec<String>> {
        self.expect(&TokenKind::LParen, "'(' after function name")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let (p, _) = self.expect_ident("parameter name")?;
                params.push(p);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')' after parameters")?;
        Ok(params)
    }

    /// Compile a brace-delimited function body in a fresh builder and
    /// return the finished function object.
    fn function_body(&mut self, name: &str, params: &[String], line: u32) -> PResult<Value> {
        let builder = FnBuilder::new(name, params, line)?;
        self.builders.push(builder);
        let body = self.function_block();
        let builder = match self.builders.pop() {
            Some(b) => b,
            None => return Err(CompileError::new(line, "builder stack corrupted")),
        };
        body?;
        let end_line = self.current.line;
        Ok(self.env.new_function(self.module, builder.finish(end_line)))
    }

    fn function_block(&mut self) -> PResult {
        self.expect(&TokenKind::LBrace, "'{' before function body")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.expect(&TokenKind::RBrace, "'}' after function body")?;
        Ok(())
    }

    fn func_decl(&mut self) -> PResult {
        let line = self.advance().line; // 'func'
        let (name, _) = self.expect_ident("function name")?;
        if self.at_module_scope() {
            let sym = self.env.intern(&name);
            // Declare before the body compiles so recursive calls resolve.
            self.env.module_declare(self.module, sym);
            let params = self.param_list()?;
            let func = self.function_body(&name, &params, line)?;
            self.env.module_set(self.module, sym, func);
        } else {
            let params = self.param_list()?;
            let func = self.function_body(&name, &params, line)?;
            let slot = self.builder_mut().declare_local(&name, line)?;
            self.emit_load_const(slot, func, line)?;
        }
        Ok(())
    }

    /// Method names are identifiers plus the operator forms `[]` and `[]=`.
    fn method_name(&mut self) -> PResult<String> {
        if self.eat(&TokenKind::LBracket) {
            self.expect(&TokenKind::RBracket, "']' in operator method name")?;
            if self.eat(&TokenKind::Eq) {
                Ok("[]=".to_string())
            } else {
                Ok("[]".to_string())
            }
        } else {
            Ok(self.expect_ident("method name")?.0)
        }
    }

    fn class_decl(&mut self) -> PResult {
        let line = self.advance().line; // 'class'
        let (name, _) = self.expect_ident("class name")?;
        let base = if self.eat(&TokenKind::Colon) {
            let (base_name, bline) = self.expect_ident("base class name")?;
            let sym = self.env.intern(&base_name);
            match self.env.module_get(self.module, sym) {
                Some(v) if self.env.is_class(v) => Some(v),
                _ => {
                    return Err(CompileError::new(
                        bline,
                        format!("invalid base class '{base_name}'"),
                    ));
                }
            }
        } else {
            None
        };
        let class = self.env.new_class(self.module, &name, base);
        let sym = self.env.intern(&name);
        self.env.module_declare(self.module, sym);
        self.env.module_set(self.module, sym, class);

        let prev_class = self.current_class.replace(class);
        let body = self.class_body(&name, class);
        self.current_class = prev_class;
        body
    }

    fn class_body(&mut self, class_name: &str, class: Value) -> PResult {
        self.expect(&TokenKind::LBrace, "'{' after class name")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            let is_static = self.eat(&TokenKind::Static);
            match self.current.kind {
                TokenKind::Var => {
                    self.advance();
                    let (fname, _) = self.expect_ident("field name")?;
                    let sym = self.env.intern(&fname);
                    let init = if self.eat(&TokenKind::Eq) {
                        self.constant_expr()?
                    } else {
                        Value::NIL
                    };
                    if is_static {
                        self.env.class_set_symbol(class, sym, init);
                    } else {
                        self.env.class_add_field(class, sym, init);
                    }
                    self.expect(&TokenKind::Semi, "';' after field declaration")?;
                }
                TokenKind::Func => {
                    let line = self.advance().line;
                    let mname = self.method_name()?;
                    let sym = self.env.intern(&mname);
                    let mut params = self.param_list()?;
                    // Register 0 is the implicit receiver — the instance,
                    // or the class itself for statics called as `C.m()`.
                    params.insert(0, "self".to_string());
                    let qualified = format!("{class_name}.{mname}");
                    let func = self.function_body(&qualified, &params, line)?;
                    self.env.class_set_symbol(class, sym, func);
                }
                _ => {
                    return Err(CompileError::new(
                        self.current.line,
                        format!(
                            "expected 'var' or 'func' in class body, got {}",
                            describe(&self.current.kind)
                        ),
                    ));
                }
            }
        }
        self.expect(&TokenKind::RBrace, "'}' after class body")?;
        Ok(())
    }

    /// Field initializers are literal constants evaluated at compile time.
    fn constant_expr(&mut self) -> PResult<Value> {
        let token = self.advance();
        let line = token.line;
        match token.kind {
            TokenKind::Number(n) => Ok(Value::number(n)),
            TokenKind::Minus => match self.advance().kind {
                TokenKind::Number(n) => Ok(Value::number(-n)),
                other => Err(CompileError::new(
                    line,
                    format!("expected number after '-', got {}", describe(&other)),
                )),
            },
            TokenKind::Str(raw) => Ok(self.string_value(&raw)),
            TokenKind::True => Ok(Value::TRUE),
            TokenKind::False => Ok(Value::FALSE),
            TokenKind::Nil => Ok(Value::NIL),
            other => Err(CompileError::new(
                line,
                format!(
                    "field initializer must be a constant expression, got {}",
                    describe(&other)
                ),
            )),
        }
    }

    fn import_decl(&mut self) -> PResult {
        let line = self.advance().line; // 'import'
        let raw = match self.advance() {
            Token {
                kind: TokenKind::Str(raw),
                ..
            } => raw,
            other => {
                return Err(CompileError::new(
                    other.line,
                    format!("expected module name string, got {}", describe(&other.kind)),
                ));
            }
        };
        let mod_name = unescape(&raw);
        let imported = match self.env.import_module(&mod_name) {
            Ok(m) => m,
            Err(ImportError::NotFound) => {
                return Err(CompileError::new(
                    line,
                    format!("module '{mod_name}' not found"),
                ));
            }
            Err(ImportError::Failed(errs)) => {
                let detail = errs
                    .first()
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default();
                return Err(CompileError::new(
                    line,
                    format!("module '{mod_name}' failed to compile{detail}"),
                ));
            }
        };

        if self.eat(&TokenKind::For) {
            loop {
                let (orig, oline) = self.expect_ident("imported name")?;
                let renamed = if self.eat(&TokenKind::Eq) || self.eat(&TokenKind::As) {
                    Some(self.expect_ident("new name")?.0)
                } else {
                    None
                };
                let orig_sym = self.env.intern(&orig);
                let value = match self.env.module_get(imported, orig_sym) {
                    Some(v) => v,
                    None => {
                        return Err(CompileError::new(
                            oline,
                            format!("module '{mod_name}' has no variable '{orig}'"),
                        ));
                    }
                };
                let target_sym = match renamed {
                    Some(n) => self.env.intern(&n),
                    None => orig_sym,
                };
                self.env.module_declare(self.module, target_sym);
                self.env.module_set(self.module, target_sym, value);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        } else {
            // No list: copy every declared, non-nil variable.
            for (sym, value) in self.env.module_declared(imported) {
                if !value.is_nil() {
                    self.env.module_declare(self.module, sym);
                    self.env.module_set(self.module, sym, value);
                }
            }
        }
        self.expect(&TokenKind::Semi, "';' after import")?;
        Ok(())
    }

    fn if_stmt(&mut self) -> PResult {
        let line = self.advance().line; // 'if'
        self.expect(&TokenKind::LParen, "'(' after 'if'")?;
        let t = self.builder_mut().push_temp(line)?;
        self.parse_precedence(t, Prec::None)?;
        self.expect(&TokenKind::RParen, "')' after condition")?;
        let skip_then = self.builder_mut().reserve_jump(OpCode::JumpIfNot, t, line);
        self.builder_mut().pop_temp();
        self.statement()?;
        if self.check(&TokenKind::Else) {
            let line = self.advance().line;
            let skip_else = self.builder_mut().reserve_jump(OpCode::Jump, 0, line);
            self.builder_mut().patch_jump_to_here(skip_then, line)?;
            self.statement()?;
            self.builder_mut().patch_jump_to_here(skip_else, line)?;
        } else {
            self.builder_mut().patch_jump_to_here(skip_then, line)?;
        }
        Ok(())
    }

    fn while_stmt(&mut self) -> PResult {
        let line = self.advance().line; // 'while'
        self.expect(&TokenKind::LParen, "'(' after 'while'")?;
        let loop_start = self.builder().here();
        let t = self.builder_mut().push_temp(line)?;
        self.parse_precedence(t, Prec::None)?;
        self.expect(&TokenKind::RParen, "')' after condition")?;
        let exit = self.builder_mut().reserve_jump(OpCode::JumpIfNot, t, line);
        self.builder_mut().pop_temp();

        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        body?;

        self.builder_mut()
            .emit_jump_to(OpCode::Jump, 0, loop_start, line)?;
        self.builder_mut().patch_jump_to_here(exit, line)?;
        self.builder_mut().patch_breaks(loop_start, line)?;
        Ok(())
    }

    /// `for (init; cond; incr) body` — the increment segment sits between
    /// the condition and the body in the instruction stream, with jumps
    /// arranged so it runs after the body and before the re-test.
    fn for_stmt(&mut self) -> PResult {
        let line = self.advance().line; // 'for'
        self.expect(&TokenKind::LParen, "'(' after 'for'")?;
        self.builder_mut().push_scope();

        // Initializer.
        if self.eat(&TokenKind::Semi) {
            // none
        } else if self.check(&TokenKind::Var) {
            self.var_decl()?;
        } else {
            let t = self.builder_mut().push_temp(line)?;
            self.parse_precedence(t, Prec::None)?;
            self.builder_mut().pop_temp();
            self.expect(&TokenKind::Semi, "';' after loop initializer")?;
        }

        // Condition.
        let loop_start = self.builder().here();
        let exit = if self.check(&TokenKind::Semi) {
            None
        } else {
            let t = self.builder_mut().push_temp(line)?;
            self.parse_precedence(t, Prec::None)?;
            let j = self.builder_mut().reserve_jump(OpCode::JumpIfNot, t, line);
            self.builder_mut().pop_temp();
            Some(j)
        };
        self.expect(&TokenKind::Semi, "';' after loop condition")?;

        // Increment, jumped over on the way in.
        let to_body = self.builder_mut().reserve_jump(OpCode::Jump, 0, line);
        let incr_start = self.builder().here();
        if !self.check(&TokenKind::RParen) {
            let t = self.builder_mut().push_temp(line)?;
            self.parse_precedence(t, Prec::None)?;
            self.builder_mut().pop_temp();
        }
        self.builder_mut()
            .emit_jump_to(OpCode::Jump, 0, loop_start, line)?;
        self.expect(&TokenKind::RParen, "')' after loop clauses")?;
        self.builder_mut().patch_jump_to_here(to_body, line)?;

        self.loop_depth += 1;
        let body = self.statement();
        self.loop_depth -= 1;
        body?;

        self.builder_mut()
            .emit_jump_to(OpCode::Jump, 0, incr_start, line)?;
        if let Some(exit) = exit {
            self.builder_mut().patch_jump_to_here(exit, line)?;
        }
        self.builder_mut().patch_breaks(loop_start, line)?;
        self.builder_mut().pop_scope();
        Ok(())
    }

    fn return_stmt(&mut self) -> PResult {
        let line = self.advance().line; // 'return'
        let t = self.builder_mut().push_temp(line)?;
        if self.check(&TokenKind::Semi) {
            self.emit_load_basic(t, LB_NIL, line);
        } else {
            self.parse_precedence(t, Prec::None)?;
        }
        self.builder_mut()
            .emit(Instr::abx(OpCode::Return, 0, u32::from(t)), line);
        self.builder_mut().pop_temp();
        self.expect(&TokenKind::Semi, "';' after return value")?;
        Ok(())
    }

    fn break_stmt(&mut self) -> PResult {
        let line = self.advance().line; // 'break'
        if self.loop_depth == 0 {
            return Err(CompileError::new(line, "'break' outside of a loop"));
        }
        self.builder_mut().emit_break(line);
        self.expect(&TokenKind::Semi, "';' after 'break'")?;
        Ok(())
    }

    fn block(&mut self) -> PResult {
        self.advance(); // '{'
        self.builder_mut().push_scope();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        let result = self.expect(&TokenKind::RBrace, "'}' after block").map(|_| ());
        self.builder_mut().pop_scope();
        result
    }

    fn expr_stmt(&mut self) -> PResult {
        let line = self.current.line;
        let t = self.builder_mut().push_temp(line)?;
        self.parse_precedence(t, Prec::None)?;
        self.builder_mut().pop_temp();
        self.expect(&TokenKind::Semi, "';' after expression")?;
        Ok(())
    }
}

/// Process string-literal escapes. Unknown escapes keep the escaped
/// character; a trailing backslash is kept verbatim.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::unescape;

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r"a\nb"), "a\nb");
        assert_eq!(unescape(r#"\"x\""#), "\"x\"");
        assert_eq!(unescape(r"t\tab"), "t\tab");
        assert_eq!(unescape(r"odd\q"), "oddq");
        assert_eq!(unescape(r"end\"), "end\\");
    }
}
