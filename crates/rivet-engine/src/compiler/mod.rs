//! The single-pass compiler: a recursive-descent front end that emits
//! register bytecode directly while parsing, with no separate AST stage.
//!
//! Expressions are held in a [`node::Node`] — one of seven states — until
//! they're "discharged" into a concrete instruction argument. Short-circuit
//! operators and conditional statements share one mechanism: a
//! [`node::JumpList`] pair threaded through already-emitted `JMP`
//! instructions (see [`crate::bytecode::jump_list`]).

pub mod error;
pub mod node;

pub use error::{CompileError, CompileResult};
pub use node::{arith_opcode, invert_relational, rel_opcode, BinOp, JumpList, Node, Prim};

use crate::bytecode::{jump_list, BytecodeWriter, Instr, Opcode, JMP_BIAS, JUMP_LIST_END};
use crate::parser::{tokenize, Interner, Span, Symbol, Token};
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Debug, Clone, Copy)]
struct Local {
    name: Symbol,
    slot: u8,
}

/// Per-function compilation state: its own bytecode buffer, its own
/// register-slot counter, and the source line of each emitted instruction.
struct ScopeFrame {
    /// Index into `locals` where this function's own locals begin — locals
    /// below this belong to an enclosing function and, since there are no
    /// closures, must not be visible here.
    first_local: usize,
    next_slot: u8,
    /// High-water mark of `next_slot`, recorded as the function's frame size.
    max_slot: u8,
    writer: BytecodeWriter,
    lines: Vec<u32>,
}

impl ScopeFrame {
    fn new(first_local: usize) -> Self {
        Self {
            first_local,
            next_slot: 0,
            max_slot: 0,
            writer: BytecodeWriter::new(),
            lines: Vec::new(),
        }
    }
}

/// Compiles one package's source into its functions' bytecode, one token
/// stream pass, no backtracking past a single token of lookahead (plus the
/// bounded scan `for` uses to find its body).
struct Compiler<'a> {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    runtime: &'a mut Runtime,
    package: u32,
    scopes: Vec<ScopeFrame>,
    locals: Vec<Local>,
    /// Source line attached to the next emitted instruction and to most
    /// compile errors; refreshed at the start of every statement.
    stmt_line: u32,
}

/// Compiles `source` into `package`'s main function.
pub fn compile_source(runtime: &mut Runtime, package: u32, source: &str) -> CompileResult<()> {
    let main_function = runtime.packages[package as usize].main_function;
    let mut interner = Interner::new();
    let tokens = tokenize(source, &mut interner)?;
    let mut compiler = Compiler {
        tokens,
        pos: 0,
        runtime,
        package,
        scopes: vec![ScopeFrame::new(0)],
        locals: Vec::new(),
        stmt_line: 1,
    };
    compiler.parse_block()?;
    compiler.emit_abc(Opcode::Ret, 0, 0, 0);
    compiler.pop_scope_into(main_function);
    Ok(())
}

impl<'a> Compiler<'a> {
    // --- token stream -----------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn current_line(&self) -> u32 {
        self.tokens[self.pos].1.line
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].0;
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, pred: impl Fn(&Token) -> bool, expected: &'static str) -> CompileResult<()> {
        if pred(self.peek()) {
            self.advance();
            Ok(())
        } else {
            Err(CompileError::ExpectedToken { expected, line: self.current_line() })
        }
    }

    fn expect_identifier(&mut self) -> CompileResult<Symbol> {
        if let Token::Identifier(sym) = *self.peek() {
            self.advance();
            Ok(sym)
        } else {
            Err(CompileError::ExpectedToken { expected: "identifier", line: self.current_line() })
        }
    }

    /// Scans forward from `i`, tracking only paren depth, to the `{` that
    /// opens a `for`'s body — used to parse its step clause after the body
    /// even though it's written before it.
    fn scan_to_body_brace(&self, mut i: usize) -> usize {
        let mut depth: i32 = 0;
        loop {
            match self.tokens[i].0 {
                Token::LeftParen => depth += 1,
                Token::RightParen => depth -= 1,
                Token::LeftBrace if depth == 0 => return i,
                _ => {}
            }
            i += 1;
        }
    }

    // --- scope / emission --------------------------------------------------

    fn scope(&self) -> &ScopeFrame {
        self.scopes.last().expect("at least one scope while compiling")
    }

    fn scope_mut(&mut self) -> &mut ScopeFrame {
        self.scopes.last_mut().expect("at least one scope while compiling")
    }

    fn writer(&self) -> &BytecodeWriter {
        &self.scope().writer
    }

    fn writer_mut(&mut self) -> &mut BytecodeWriter {
        &mut self.scope_mut().writer
    }

    fn position(&self) -> usize {
        self.writer().position()
    }

    fn emit_abc(&mut self, op: Opcode, a: u8, b: u8, c: u8) -> usize {
        let line = self.stmt_line;
        let frame = self.scope_mut();
        let idx = frame.writer.emit(Instr::abc(op, a, b, c));
        frame.lines.push(line);
        idx
    }

    fn emit_a_d16(&mut self, op: Opcode, a: u8, d: u16) -> usize {
        let line = self.stmt_line;
        let frame = self.scope_mut();
        let idx = frame.writer.emit(Instr::a_d16(op, a, d));
        frame.lines.push(line);
        idx
    }

    fn emit_d24(&mut self, op: Opcode, d: u32) -> usize {
        let line = self.stmt_line;
        let frame = self.scope_mut();
        let idx = frame.writer.emit(Instr::d24(op, d));
        frame.lines.push(line);
        idx
    }

    fn jump_list_append(&mut self, list: JumpList, idx: usize) -> JumpList {
        jump_list::append(self.writer_mut(), list, idx)
    }

    fn jump_list_patch(&mut self, list: JumpList, target: usize) {
        jump_list::patch(self.writer_mut(), list, target);
    }

    fn jump_list_merge(&mut self, a: JumpList, b: JumpList) -> JumpList {
        jump_list::merge(self.writer_mut(), a, b)
    }

    fn bump_slot(&mut self) -> CompileResult<u8> {
        let slot = self.scope().next_slot;
        if slot as usize >= 255 {
            return Err(CompileError::TooManyLocals { line: self.stmt_line });
        }
        let frame = self.scope_mut();
        frame.next_slot = slot + 1;
        frame.max_slot = frame.max_slot.max(frame.next_slot);
        Ok(slot)
    }

    fn lookup_local(&self, name: Symbol) -> Option<u8> {
        let first = self.scope().first_local;
        self.locals[first..].iter().rev().find(|l| l.name == name).map(|l| l.slot)
    }

    fn pop_scope_into(&mut self, function: u32) {
        let frame = self.scopes.pop().expect("scope stack not empty");
        self.locals.truncate(frame.first_local);
        let code = frame.writer.finish();
        let f = &mut self.runtime.functions[function as usize];
        f.code = code;
        f.lines = frame.lines;
        f.max_slots = frame.max_slot;
    }

    // --- operand calculus ---------------------------------------------------

    /// Promotes a `Num`/`Local` operand out of its deferred form. Every
    /// other state is left untouched.
    fn discharge(&mut self, node: &mut Node) -> CompileResult<()> {
        match *node {
            Node::Num(n) => {
                let idx = self
                    .runtime
                    .constants
                    .intern(Value::number(n))
                    .map_err(|_| CompileError::TooManyConstants { line: self.stmt_line })?;
                *node = Node::Const(idx);
            }
            Node::Local(slot) => *node = Node::NonReloc(slot),
            _ => {}
        }
        Ok(())
    }

    /// Frees `node`'s register if it's a temporary sitting at the top of the
    /// slot stack — never a named local's slot, even one that happens to sit
    /// at the top right now.
    fn free_node(&mut self, node: &Node) {
        if let Node::NonReloc(slot) = *node {
            let nactvar = (self.locals.len() - self.scope().first_local) as u8;
            if slot >= nactvar && slot as usize + 1 == self.scope().next_slot as usize {
                self.scope_mut().next_slot -= 1;
            }
        }
    }

    /// Converts `node` into a usable instruction argument (an 8-bit value):
    /// a primitive code, a small constant index, or an already-materialised
    /// slot. Anything else is pushed to a fresh temporary slot.
    fn to_ins_arg(&mut self, node: &mut Node) -> CompileResult<u8> {
        self.discharge(node)?;
        match *node {
            Node::Prim(p) => Ok(p.as_u8()),
            Node::Const(idx) if idx < 256 => Ok(idx as u8),
            Node::NonReloc(slot) => Ok(slot),
            _ => self.to_next_slot(node),
        }
    }

    /// Materialises `node` into a freshly allocated slot, bumping the
    /// function's slot counter.
    fn to_next_slot(&mut self, node: &mut Node) -> CompileResult<u8> {
        self.discharge(node)?;
        let slot = self.bump_slot()?;
        self.to_slot(slot, node)?;
        Ok(slot)
    }

    /// Converts `node` into *some* slot, reusing one it's already in rather
    /// than allocating a new one when possible.
    fn to_any_slot(&mut self, node: &mut Node) -> CompileResult<u8> {
        self.discharge(node)?;
        match *node {
            Node::NonReloc(slot) => Ok(slot),
            _ => self.to_next_slot(node),
        }
    }

    /// Emits whatever is needed to land `node`'s value in `dest`, leaving
    /// `node` as `NonReloc(dest)`.
    fn to_slot(&mut self, dest: u8, node: &mut Node) -> CompileResult<()> {
        self.discharge(node)?;
        if matches!(node, Node::Jmp { .. }) {
            self.ensure_true_falls_through(node);
        }
        match *node {
            Node::Prim(p) => {
                self.emit_a_d16(Opcode::SetP, dest, p.as_u8() as u16);
            }
            Node::Const(idx) => {
                self.emit_a_d16(Opcode::SetN, dest, idx);
            }
            Node::NonReloc(slot) => {
                if slot != dest {
                    self.emit_a_d16(Opcode::Mov, dest, slot as u16);
                }
            }
            Node::Reloc(idx) => {
                self.writer_mut().patch_a(idx, dest);
            }
            Node::Jmp { true_list, false_list } => {
                let tcase = self.emit_a_d16(Opcode::SetP, dest, Prim::True.as_u8() as u16);
                self.emit_d24(Opcode::Jmp, (JMP_BIAS + 1) as u32);
                let fcase = self.emit_a_d16(Opcode::SetP, dest, Prim::False.as_u8() as u16);
                self.jump_list_patch(true_list, tcase);
                self.jump_list_patch(false_list, fcase);
            }
            Node::Num(_) | Node::Local(_) => unreachable!("discharge eliminates these"),
        }
        *node = Node::NonReloc(dest);
        Ok(())
    }

    /// Converts `node` into a `Jmp` condition, emitting an `EQ_LP dest,
    /// true` test if it isn't one already. Constant primitives fold directly
    /// to an unconditional branch with no runtime test.
    fn to_jmp(&mut self, node: &mut Node) -> CompileResult<()> {
        self.discharge(node)?;
        match *node {
            Node::Jmp { .. } => {}
            Node::Prim(p) => {
                let jmp_idx = self.emit_d24(Opcode::Jmp, JUMP_LIST_END);
                *node = if matches!(p, Prim::True) {
                    Node::Jmp { true_list: Some(jmp_idx), false_list: None }
                } else {
                    Node::Jmp { true_list: None, false_list: Some(jmp_idx) }
                };
            }
            _ => {
                let slot = self.to_any_slot(node)?;
                self.emit_a_d16(Opcode::EqLp, slot, Prim::True.as_u8() as u16);
                let jmp_idx = self.emit_d24(Opcode::Jmp, JUMP_LIST_END);
                *node = Node::Jmp { true_list: Some(jmp_idx), false_list: None };
            }
        }
        Ok(())
    }

    /// If the true case's most recent jump sits after the false case's,
    /// inverts its condition and moves it to the false list so the true
    /// case is always the one that falls through.
    fn ensure_true_falls_through(&mut self, node: &mut Node) {
        if let Node::Jmp { true_list, false_list } = node {
            let ct = true_list.map(|x| x as i64).unwrap_or(-1);
            let cf = false_list.map(|x| x as i64).unwrap_or(-1);
            if ct > cf {
                let t = true_list.unwrap();
                let cond_idx = t - 1;
                let inverted = invert_relational(self.writer().get(cond_idx).opcode());
                self.writer_mut().patch_op(cond_idx, inverted);
                let next = jump_list::follow(self.writer(), t);
                *true_list = next;
                *false_list = jump_list::append(self.writer_mut(), *false_list, t);
            }
        }
    }

    fn ensure_false_falls_through(&mut self, node: &mut Node) {
        if let Node::Jmp { true_list, false_list } = node {
            let ct = true_list.map(|x| x as i64).unwrap_or(-1);
            let cf = false_list.map(|x| x as i64).unwrap_or(-1);
            if cf > ct {
                let f = false_list.unwrap();
                let cond_idx = f - 1;
                let inverted = invert_relational(self.writer().get(cond_idx).opcode());
                self.writer_mut().patch_op(cond_idx, inverted);
                let next = jump_list::follow(self.writer(), f);
                *false_list = next;
                *true_list = jump_list::append(self.writer_mut(), *true_list, f);
            }
        }
    }

    // --- binary/unary emission ----------------------------------------------

    fn fold_arith(op: BinOp, l: f64, r: f64) -> f64 {
        match op {
            BinOp::Add => l + r,
            BinOp::Sub => l - r,
            BinOp::Mul => l * r,
            BinOp::Div => l / r,
            _ => unreachable!("fold_arith called with non-arithmetic operator"),
        }
    }

    fn emit_arith(&mut self, op: BinOp, left: &mut Node, right: Node) -> CompileResult<()> {
        if matches!(left, Node::Prim(_)) || matches!(right, Node::Prim(_)) {
            return Err(CompileError::InvalidBinaryOperand { line: self.stmt_line });
        }
        if let (Node::Num(l), Node::Num(r)) = (*left, right) {
            *left = Node::Num(Self::fold_arith(op, l, r));
            return Ok(());
        }
        let (mut l, mut r) = if op.is_commutative() && left.is_const() {
            (right, *left)
        } else {
            (*left, right)
        };
        let larg = self.to_ins_arg(&mut l)?;
        let rarg = self.to_ins_arg(&mut r)?;
        if larg > rarg {
            self.free_node(&l);
            self.free_node(&r);
        } else {
            self.free_node(&r);
            self.free_node(&l);
        }
        let opcode = arith_opcode(op, l.is_const(), r.is_const());
        let idx = self.emit_abc(opcode, 0, larg, rarg);
        *left = Node::Reloc(idx);
        Ok(())
    }

    fn fold_rel(op: BinOp, left: Node, right: Node) -> Option<Prim> {
        let result = match (left, right) {
            (Node::Num(l), Node::Num(r)) => match op {
                BinOp::Eq => l == r,
                BinOp::Neq => l != r,
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!("fold_rel called with non-relational operator"),
            },
            (Node::Prim(a), Node::Prim(b)) => match op {
                BinOp::Eq => a == b,
                BinOp::Neq => a != b,
                _ => return None,
            },
            _ => return None,
        };
        Some(if result { Prim::True } else { Prim::False })
    }

    fn emit_rel(&mut self, op: BinOp, left: &mut Node, right: Node) -> CompileResult<()> {
        if op.is_ord() && (matches!(left, Node::Prim(_)) || matches!(right, Node::Prim(_))) {
            return Err(CompileError::InvalidBinaryOperand { line: self.stmt_line });
        }
        if let Some(folded) = Self::fold_rel(op, *left, right) {
            *left = Node::Prim(folded);
            return Ok(());
        }
        let (mut l, mut r, op) = if left.is_const() {
            (right, *left, if op.is_ord() { op.invert_ord() } else { op })
        } else {
            (*left, right, op)
        };
        let larg = self.to_ins_arg(&mut l)?;
        let rarg = self.to_ins_arg(&mut r)?;
        if larg > rarg {
            self.free_node(&l);
            self.free_node(&r);
        } else {
            self.free_node(&r);
            self.free_node(&l);
        }
        let opcode = rel_opcode(op, matches!(r, Node::Const(_)), matches!(r, Node::Prim(_)));
        self.emit_a_d16(opcode, larg, rarg as u16);
        let jmp_idx = self.emit_d24(Opcode::Jmp, JUMP_LIST_END);
        *left = Node::Jmp { true_list: Some(jmp_idx), false_list: None };
        Ok(())
    }

    fn emit_and(&mut self, left: &mut Node, mut right: Node) -> CompileResult<()> {
        self.to_jmp(&mut right)?;
        self.ensure_true_falls_through(left);
        let (left_true, left_false) = match *left {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let target = left_false.expect("ensure_true_falls_through guarantees a false case") + 1;
        self.jump_list_patch(left_true, target);
        let (right_true, right_false) = match right {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let merged_false = self.jump_list_merge(left_false, right_false);
        *left = Node::Jmp { true_list: right_true, false_list: merged_false };
        Ok(())
    }

    fn emit_or(&mut self, left: &mut Node, mut right: Node) -> CompileResult<()> {
        self.to_jmp(&mut right)?;
        self.ensure_false_falls_through(left);
        let (left_true, left_false) = match *left {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let target = left_true.expect("ensure_false_falls_through guarantees a true case") + 1;
        self.jump_list_patch(left_false, target);
        let (right_true, right_false) = match right {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let merged_true = self.jump_list_merge(left_true, right_true);
        *left = Node::Jmp { true_list: merged_true, false_list: right_false };
        Ok(())
    }

    fn emit_binary(&mut self, op: BinOp, left: &mut Node, right: Node) -> CompileResult<()> {
        match op {
            BinOp::And => self.emit_and(left, right),
            BinOp::Or => self.emit_or(left, right),
            _ if op.is_arith() => self.emit_arith(op, left, right),
            _ => self.emit_rel(op, left, right),
        }
    }

    fn prepare_binary_left(&mut self, op: BinOp, left: &mut Node) -> CompileResult<()> {
        if matches!(op, BinOp::And | BinOp::Or) {
            self.to_jmp(left)?;
        } else if !matches!(left, Node::Num(_)) {
            self.to_ins_arg(left)?;
        }
        Ok(())
    }

    fn emit_neg(&mut self, operand: &mut Node) -> CompileResult<()> {
        self.discharge(operand)?;
        match *operand {
            Node::Num(n) => *operand = Node::Num(-n),
            Node::Prim(_) => return Err(CompileError::InvalidUnaryOperand { line: self.stmt_line }),
            _ => {
                let slot = self.to_any_slot(operand)?;
                self.free_node(operand);
                let idx = self.emit_a_d16(Opcode::Neg, 0, slot as u16);
                *operand = Node::Reloc(idx);
            }
        }
        Ok(())
    }

    fn emit_not(&mut self, operand: &mut Node) -> CompileResult<()> {
        self.to_jmp(operand)?;
        if let Node::Jmp { true_list, false_list } = operand {
            std::mem::swap(true_list, false_list);
        }
        Ok(())
    }

    // --- expressions --------------------------------------------------------

    fn parse_expr(&mut self) -> CompileResult<Node> {
        self.parse_subexpr(node::Precedence::None)
    }

    fn parse_subexpr(&mut self, min: node::Precedence) -> CompileResult<Node> {
        let mut left = self.parse_unary()?;
        while let Some(op) = BinOp::from_token(self.peek()) {
            if op.precedence() <= min {
                break;
            }
            self.advance();
            self.prepare_binary_left(op, &mut left)?;
            let right = self.parse_subexpr(op.precedence())?;
            self.emit_binary(op, &mut left, right)?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> CompileResult<Node> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                let mut operand = self.parse_unary()?;
                self.emit_neg(&mut operand)?;
                Ok(operand)
            }
            Token::Bang => {
                self.advance();
                let mut operand = self.parse_unary()?;
                self.emit_not(&mut operand)?;
                Ok(operand)
            }
            _ => self.parse_postfix_operand(),
        }
    }

    fn parse_postfix_operand(&mut self) -> CompileResult<Node> {
        let mut node = self.parse_operand()?;
        while matches!(self.peek(), Token::LeftParen) {
            node = self.parse_call(node)?;
        }
        Ok(node)
    }

    fn parse_operand(&mut self) -> CompileResult<Node> {
        match *self.peek() {
            Token::Number(n) => {
                self.advance();
                Ok(Node::Num(n))
            }
            Token::Identifier(sym) => {
                self.advance();
                let slot = self
                    .lookup_local(sym)
                    .ok_or(CompileError::VariableNotDefined { line: self.stmt_line })?;
                Ok(Node::Local(slot))
            }
            Token::LeftParen => {
                self.advance();
                let node = self.parse_expr()?;
                self.expect(|t| matches!(t, Token::RightParen), ")")?;
                Ok(node)
            }
            Token::True => {
                self.advance();
                Ok(Node::Prim(Prim::True))
            }
            Token::False => {
                self.advance();
                Ok(Node::Prim(Prim::False))
            }
            Token::Nil => {
                self.advance();
                Ok(Node::Prim(Prim::Nil))
            }
            Token::Fn => self.parse_fn_expr(),
            _ => Err(CompileError::ExpectedExpression { line: self.current_line() }),
        }
    }

    fn parse_call(&mut self, mut callee: Node) -> CompileResult<Node> {
        let callee_slot = self.to_any_slot(&mut callee)?;
        self.advance();
        let mut argc: u8 = 0;
        if !matches!(self.peek(), Token::RightParen) {
            loop {
                let mut arg = self.parse_expr()?;
                self.to_next_slot(&mut arg)?;
                argc = argc
                    .checked_add(1)
                    .ok_or(CompileError::TooManyLocals { line: self.stmt_line })?;
                if matches!(self.peek(), Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(|t| matches!(t, Token::RightParen), ")")?;
        self.emit_abc(Opcode::Call, callee_slot, callee_slot.wrapping_add(1), argc);
        self.scope_mut().next_slot = callee_slot + 1;
        Ok(Node::NonReloc(callee_slot))
    }

    // --- functions ------------------------------------------------------------

    fn parse_params(&mut self) -> CompileResult<Vec<Symbol>> {
        self.expect(|t| matches!(t, Token::LeftParen), "(")?;
        let mut params = Vec::new();
        while let Token::Identifier(sym) = *self.peek() {
            params.push(sym);
            self.advance();
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(|t| matches!(t, Token::RightParen), ")")?;
        Ok(params)
    }

    fn parse_fn_body(&mut self, params: &[Symbol]) -> CompileResult<u32> {
        let function = self.runtime.new_function(self.package, params.len() as u8);
        let first_local = self.locals.len();
        self.scopes.push(ScopeFrame::new(first_local));
        for &p in params {
            let slot = self.bump_slot()?;
            self.locals.push(Local { name: p, slot });
        }
        self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
        self.parse_block()?;
        self.expect(|t| matches!(t, Token::RightBrace), "}")?;
        self.emit_abc(Opcode::Ret, 0, 0, 0);
        self.pop_scope_into(function);
        Ok(function)
    }

    fn parse_fn_stmt(&mut self) -> CompileResult<()> {
        self.advance();
        let name = self.expect_identifier()?;
        if self.lookup_local(name).is_some() {
            return Err(CompileError::VariableAlreadyDefined { line: self.stmt_line });
        }
        let params = self.parse_params()?;
        let function = self.parse_fn_body(&params)?;
        let slot = self.bump_slot()?;
        self.locals.push(Local { name, slot });
        self.emit_a_d16(Opcode::SetF, slot, function as u16);
        Ok(())
    }

    fn parse_fn_expr(&mut self) -> CompileResult<Node> {
        self.advance();
        let params = self.parse_params()?;
        let function = self.parse_fn_body(&params)?;
        let idx = self.emit_a_d16(Opcode::SetF, 0, function as u16);
        Ok(Node::Reloc(idx))
    }

    // --- statements -------------------------------------------------------

    fn parse_block(&mut self) -> CompileResult<()> {
        let locals_mark = self.locals.len();
        let slot_mark = self.scope().next_slot;
        while !matches!(self.peek(), Token::RightBrace | Token::Eof) {
            self.parse_statement()?;
        }
        self.locals.truncate(locals_mark);
        self.scope_mut().next_slot = slot_mark;
        Ok(())
    }

    fn parse_statement(&mut self) -> CompileResult<()> {
        self.stmt_line = self.current_line();
        match self.peek() {
            Token::Let => self.parse_let(),
            Token::If => self.parse_if(),
            Token::Loop => self.parse_loop(),
            Token::While => self.parse_while(),
            Token::For => self.parse_for(),
            Token::Fn => self.parse_fn_stmt(),
            Token::LeftBrace => {
                self.advance();
                self.parse_block()?;
                self.expect(|t| matches!(t, Token::RightBrace), "}")
            }
            Token::Identifier(_) => self.parse_assign_or_expr(),
            Token::Semicolon => {
                self.advance();
                Ok(())
            }
            _ => {
                self.parse_expr()?;
                Ok(())
            }
        }
    }

    fn parse_let(&mut self) -> CompileResult<()> {
        self.advance();
        let name = self.expect_identifier()?;
        if self.lookup_local(name).is_some() {
            return Err(CompileError::VariableAlreadyDefined { line: self.stmt_line });
        }
        self.expect(|t| matches!(t, Token::Equal), "=")?;
        let mut value = self.parse_expr()?;
        let slot = self.to_next_slot(&mut value)?;
        self.locals.push(Local { name, slot });
        Ok(())
    }

    fn parse_assign_or_expr(&mut self) -> CompileResult<()> {
        let is_assign = matches!(
            self.tokens.get(self.pos + 1).map(|(t, _)| t),
            Some(
                Token::Equal
                    | Token::PlusEqual
                    | Token::MinusEqual
                    | Token::StarEqual
                    | Token::SlashEqual
            )
        );
        if is_assign {
            self.parse_assign()
        } else {
            self.parse_expr()?;
            Ok(())
        }
    }

    fn parse_assign(&mut self) -> CompileResult<()> {
        let name = self.expect_identifier()?;
        let dest = self
            .lookup_local(name)
            .ok_or(CompileError::VariableNotDefined { line: self.stmt_line })?;
        let augmented = match self.peek() {
            Token::Equal => None,
            Token::PlusEqual => Some(BinOp::Add),
            Token::MinusEqual => Some(BinOp::Sub),
            Token::StarEqual => Some(BinOp::Mul),
            Token::SlashEqual => Some(BinOp::Div),
            _ => {
                return Err(CompileError::ExpectedToken {
                    expected: "assignment operator",
                    line: self.current_line(),
                })
            }
        };
        self.advance();
        let result = self.parse_expr()?;
        match augmented {
            Some(op) => {
                let mut dest_node = Node::NonReloc(dest);
                self.emit_arith(op, &mut dest_node, result)?;
                self.to_slot(dest, &mut dest_node)?;
            }
            None => {
                let mut result = result;
                self.to_slot(dest, &mut result)?;
            }
        }
        Ok(())
    }

    fn parse_if(&mut self) -> CompileResult<()> {
        let mut end_jumps: JumpList = None;
        loop {
            self.advance();
            let mut condition = self.parse_expr()?;
            self.to_jmp(&mut condition)?;
            self.ensure_true_falls_through(&mut condition);
            let (true_list, false_list) = match condition {
                Node::Jmp { true_list, false_list } => (true_list, false_list),
                _ => unreachable!(),
            };
            let true_case = self.position();
            self.jump_list_patch(true_list, true_case);
            self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
            self.parse_block()?;
            self.expect(|t| matches!(t, Token::RightBrace), "}")?;
            if matches!(self.peek(), Token::ElseIf | Token::Else) {
                let jmp_idx = self.emit_d24(Opcode::Jmp, JUMP_LIST_END);
                end_jumps = self.jump_list_append(end_jumps, jmp_idx);
            }
            let false_case = self.position();
            self.jump_list_patch(false_list, false_case);
            if !matches!(self.peek(), Token::ElseIf) {
                break;
            }
        }
        if matches!(self.peek(), Token::Else) {
            self.advance();
            self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
            self.parse_block()?;
            self.expect(|t| matches!(t, Token::RightBrace), "}")?;
        }
        let end = self.position();
        self.jump_list_patch(end_jumps, end);
        Ok(())
    }

    fn parse_loop(&mut self) -> CompileResult<()> {
        self.advance();
        let start = self.position();
        self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
        self.parse_block()?;
        self.expect(|t| matches!(t, Token::RightBrace), "}")?;
        let idx = self.emit_d24(Opcode::Loop, 0);
        self.writer_mut().patch_jump(idx, start);
        Ok(())
    }

    fn parse_while(&mut self) -> CompileResult<()> {
        self.advance();
        let start = self.position();
        let mut condition = self.parse_expr()?;
        self.to_jmp(&mut condition)?;
        self.ensure_true_falls_through(&mut condition);
        let (true_list, false_list) = match condition {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let true_case = self.position();
        self.jump_list_patch(true_list, true_case);
        self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
        self.parse_block()?;
        self.expect(|t| matches!(t, Token::RightBrace), "}")?;
        let idx = self.emit_d24(Opcode::Loop, 0);
        self.writer_mut().patch_jump(idx, start);
        let false_case = self.position();
        self.jump_list_patch(false_list, false_case);
        Ok(())
    }

    fn parse_for_init(&mut self) -> CompileResult<()> {
        match self.peek() {
            Token::Let => self.parse_let(),
            Token::Identifier(_) => self.parse_assign_or_expr(),
            _ => Err(CompileError::ExpectedExpression { line: self.current_line() }),
        }
    }

    fn parse_for_step(&mut self) -> CompileResult<()> {
        match self.peek() {
            Token::Identifier(_) => self.parse_assign_or_expr(),
            _ => Err(CompileError::ExpectedExpression { line: self.current_line() }),
        }
    }

    /// `for init; cond; step { body }` — lowered as a `while` whose step is
    /// re-parsed (from its original token span) and emitted right after the
    /// body, since it runs after the body on every iteration despite being
    /// written before it.
    fn parse_for(&mut self) -> CompileResult<()> {
        self.advance();
        let locals_mark = self.locals.len();
        let slot_mark = self.scope().next_slot;

        self.parse_for_init()?;
        self.expect(|t| matches!(t, Token::Semicolon), ";")?;

        let start = self.position();
        let mut condition = self.parse_expr()?;
        self.to_jmp(&mut condition)?;
        self.ensure_true_falls_through(&mut condition);
        let (true_list, false_list) = match condition {
            Node::Jmp { true_list, false_list } => (true_list, false_list),
            _ => unreachable!(),
        };
        let true_case = self.position();
        self.jump_list_patch(true_list, true_case);
        self.expect(|t| matches!(t, Token::Semicolon), ";")?;

        let step_start = self.pos;
        let body_start = self.scan_to_body_brace(step_start);
        self.pos = body_start;

        self.expect(|t| matches!(t, Token::LeftBrace), "{")?;
        self.parse_block()?;
        self.expect(|t| matches!(t, Token::RightBrace), "}")?;
        let body_end = self.pos;

        self.pos = step_start;
        self.parse_for_step()?;
        self.pos = body_end;

        let idx = self.emit_d24(Opcode::Loop, 0);
        self.writer_mut().patch_jump(idx, start);
        let false_case = self.position();
        self.jump_list_patch(false_list, false_case);

        self.locals.truncate(locals_mark);
        self.scope_mut().next_slot = slot_mark;
        Ok(())
    }
}
