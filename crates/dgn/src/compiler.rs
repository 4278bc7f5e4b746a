//! Single-pass bytecode compiler.
//!
//! The compiler pulls tokens straight from the scanner and emits bytecode
//! as it parses; there is no AST. Expressions are parsed with a Pratt
//! precedence-climbing table of `(prefix, infix, precedence)` rules keyed
//! by token kind. Jumps are emitted with placeholder offsets and patched
//! once their targets are known.
//!
//! One [`FunctionState`] exists per nested function body (the script,
//! declared functions, methods, and lambdas); resolving a variable walks
//! this stack outward, capturing upvalues along the way.
//!
//! The first error in a statement puts the parser into panic mode; it
//! resynchronizes at the next statement boundary, so one mistake produces
//! one diagnostic.

use crate::bytecode::{Chunk, OpCode};
use crate::error::Error;
use crate::heap::Heap;
use crate::object::{Obj, ObjFunction};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{ObjRef, Value};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;
const MAX_LIST_ITEMS: usize = 255;

/// Expression precedence, lowest to highest. Parsing at level `p` consumes
/// every operator whose level is `>= p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =  +=  -= ...
    Ternary,    // ?:
    Pipe,       // |>
    Or,         // ||
    And,        // &&
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Equality,   // ==  !=  is
    Comparison, // <  >  <=  >=  in  instanceof
    Shift,      // <<  >>  >>>
    Term,       // +  -
    Factor,     // *  /  %
    Range,      // ..
    Unary,      // !  -  ~  typeof
    Call,       // .  ()  []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Pipe,
            Precedence::Pipe => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Range,
            Precedence::Range => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct Rule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

/// What kind of function body is being compiled. Affects slot 0 naming,
/// `return` legality, and the implicit return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
    Lambda,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    /// `-1` while declared but not yet initialized, so `var x = x;` is
    /// rejected.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Break/continue bookkeeping for one enclosing loop.
struct LoopContext {
    /// Bytecode offset `continue` loops back to.
    continue_target: usize,
    /// Jump operands to patch to the loop exit.
    break_jumps: Vec<usize>,
    /// Scope depth outside the loop body; break/continue pop locals deeper
    /// than this before jumping.
    scope_depth: i32,
}

/// Per-function compiler state.
struct FunctionState<'src> {
    kind: FunctionKind,
    chunk: Chunk,
    name: Option<ObjRef>,
    arity: u8,
    varargs: bool,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopContext>,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 is reserved: it holds the receiver in methods, constructors
        // and scripts, and is unnameable in plain functions and lambdas.
        let slot_zero = match kind {
            FunctionKind::Function | FunctionKind::Lambda => "",
            _ => "this",
        };
        FunctionState {
            kind,
            chunk: Chunk::new(),
            name,
            arity: 0,
            varargs: false,
            locals: vec![Local { name: slot_zero, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Where a resolved identifier lives and the operand that reaches it.
#[derive(Debug, Clone, Copy)]
enum VarAccess {
    Local(u8),
    Upvalue(u8),
    Global(u32),
}

/// Compile a source unit into its top-level function object.
///
/// The caller must disable collection on `heap` for the duration: objects
/// created here (interned constants, finished function objects) are not
/// reachable from any VM root until the compiled script is installed.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Error> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.matches(TokenKind::Eof) {
        compiler.declaration();
    }
    let script = compiler.pop_state();
    if compiler.had_error {
        Err(Error::Compile(compiler.errors))
    } else {
        Ok(script)
    }
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    states: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
    heap: &'h mut Heap,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let placeholder = Token::synthetic("");
        Compiler {
            scanner: Scanner::new(source),
            previous: placeholder,
            current: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            heap,
        }
    }

    // -----------------------------------------------------------------------
    // Token plumbing
    // -----------------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let formatted = match token.kind {
            TokenKind::Eof => format!("[{}] Error at end: {}", token.line, message),
            TokenKind::Error => format!("[{}] Error: {}", token.line, message),
            _ => format!("[{}] Error at '{}': {}", token.line, token.lexeme, message),
        };
        eprintln!("{formatted}");
        self.errors.push(formatted);
    }

    /// Skip forward to the next statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Foreach
                | TokenKind::Switch
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Import
                | TokenKind::Export => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------------
    // Emit helpers
    // -----------------------------------------------------------------------

    fn state(&self) -> &FunctionState<'src> {
        self.states.last().expect("at least the script state exists")
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().expect("at least the script state exists")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.state_mut().chunk
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_uleb(&mut self, value: u32) {
        let line = self.previous.line;
        self.chunk_mut().write_uleb(value, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.chunk_mut().add_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_uleb(index);
    }

    /// Emit a jump with a placeholder 2-byte operand; returns the operand
    /// offset for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, operand: usize) {
        let distance = self.chunk_mut().code.len() - operand - 2;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.chunk_mut().code;
        code[operand] = (distance >> 8) as u8;
        code[operand + 1] = distance as u8;
    }

    fn emit_loop(&mut self, target: usize) {
        self.emit_op(OpCode::Loop);
        // The VM subtracts the operand after reading it, so account for the
        // two operand bytes themselves.
        let distance = self.chunk_mut().code.len() + 2 - target;
        if distance > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((distance >> 8) as u8);
        self.emit_byte(distance as u8);
    }

    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Constructor {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Null);
        }
        self.emit_op(OpCode::Return);
    }

    /// Intern an identifier and add it to the constant pool.
    fn identifier_constant(&mut self, name: &str) -> u32 {
        let handle = self.heap.intern(name);
        self.chunk_mut().add_constant(Value::Obj(handle))
    }

    // -----------------------------------------------------------------------
    // Function state stack
    // -----------------------------------------------------------------------

    fn push_state(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name = name.map(|n| self.heap.intern(n));
        self.states.push(FunctionState::new(kind, name));
    }

    /// Finish the current function: emit the implicit return, allocate the
    /// function object, and (for nested functions) emit the `CLOSURE`
    /// instruction into the enclosing chunk.
    fn pop_state(&mut self) -> ObjRef {
        self.emit_return();
        let state = self.states.pop().expect("states underflow");
        let is_lambda = state.kind == FunctionKind::Lambda;
        let function = self.heap.alloc(Obj::Function(ObjFunction {
            arity: state.arity,
            upvalue_count: state.upvalues.len(),
            chunk: state.chunk,
            name: state.name,
            is_lambda,
            varargs: state.varargs,
        }));
        if !self.states.is_empty() {
            let index = self.chunk_mut().add_constant(Value::Obj(function));
            self.emit_op(OpCode::Closure);
            self.emit_uleb(index);
            for upvalue in &state.upvalues {
                let (is_local, idx) = (upvalue.is_local as u8, upvalue.index);
                self.emit_byte(is_local);
                self.emit_byte(idx);
            }
        }
        function
    }

    // -----------------------------------------------------------------------
    // Scopes, locals, upvalues
    // -----------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        let depth = self.state().scope_depth;
        loop {
            let Some(&local) = self.state().locals.last() else {
                break;
            };
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    /// Emit pops for locals deeper than `depth` without removing them from
    /// the compiler's list (used by break/continue, which jump out of
    /// scopes that are still open at compile time).
    fn emit_scope_pops(&mut self, depth: i32) {
        let locals: Vec<bool> = self
            .state()
            .locals
            .iter()
            .filter(|local| local.depth > depth)
            .map(|local| local.is_captured)
            .collect();
        for is_captured in locals.into_iter().rev() {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    /// Add an unnameable local for a compiler temporary that lives on the
    /// stack (e.g. the `foreach` iterator).
    fn add_hidden_local(&mut self) -> u8 {
        let slot = self.state().locals.len() as u8;
        self.add_local("");
        self.mark_initialized();
        slot
    }

    fn mark_initialized(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        if let Some(local) = self.state_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let state = &self.states[state_index];
        for (slot, local) in state.locals.iter().enumerate().rev() {
            if !local.name.is_empty() && local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(slot as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        let state = &mut self.states[state_index];
        if let Some(existing) = state.upvalues.iter().position(|u| *u == desc) {
            return existing as u8;
        }
        if state.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        state.upvalues.push(desc);
        (state.upvalues.len() - 1) as u8
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Function) {
            self.function_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Null);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme;
        self.mark_initialized();
        self.function_body(FunctionKind::Function, Some(name));
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable();

        self.emit_op(OpCode::Class);
        self.emit_uleb(name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Colon) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            if self.previous.lexeme == name_token.lexeme {
                self.error("A class can't inherit from itself.");
            }
            let superclass = self.previous;
            self.named_variable(superclass, false);
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(name_token, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().expect("class state pushed above").has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().is_some_and(|c| c.has_superclass) {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "constructor" {
            FunctionKind::Constructor
        } else {
            FunctionKind::Method
        };
        self.function_body(kind, Some(name));
        self.emit_op(OpCode::Method);
        self.emit_uleb(constant);
    }

    /// Compile a parenthesized parameter list and braced body in a fresh
    /// function state, then emit the `CLOSURE` for it.
    fn function_body(&mut self, kind: FunctionKind, name: Option<&str>) {
        self.push_state(kind, name);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.state().arity as usize >= MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                self.state_mut().arity += 1;
                if self.matches(TokenKind::Ellipsis) {
                    self.state_mut().varargs = true;
                    if !self.check(TokenKind::RightParen) {
                        self.error("Vararg parameter must be last.");
                    }
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after function body.");

        self.pop_state();
    }

    fn parse_variable(&mut self, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.state().scope_depth;
        let duplicate = self
            .state()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= depth)
            .any(|local| local.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn define_variable(&mut self, constant: u32) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_uleb(constant);
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn statement(&mut self) {
        if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Export) {
            self.export_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        let depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: depth,
        });

        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.finish_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.matches(TokenKind::Semicolon) {
            // No initializer.
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
        }

        if !self.check(TokenKind::RightParen) {
            // Compile the step clause inline, jumped over on the way into
            // the body; `continue` lands on it.
            let body_jump = self.emit_jump(OpCode::Jump);
            let step_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.emit_loop(loop_start);
            loop_start = step_start;
            self.patch_jump(body_jump);
        }
        self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

        let depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: depth,
        });

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// `foreach (var x in e) body` drives the iterator protocol: evaluate
    /// `e`, call `.iterator()`, then loop `.more()` / `.next()`.
    fn foreach_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'foreach'.");
        self.consume(TokenKind::Var, "Expect 'var' in foreach.");
        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let variable = self.previous.lexeme;
        self.consume(TokenKind::In, "Expect 'in' after loop variable.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after foreach iterable.");

        let iterator_name = self.identifier_constant("iterator");
        self.emit_invoke(iterator_name, 0);
        let iterator_slot = self.add_hidden_local();

        self.emit_op(OpCode::Null);
        self.add_local(variable);
        self.mark_initialized();
        let variable_slot = (self.state().locals.len() - 1) as u8;

        let loop_start = self.chunk_mut().code.len();
        self.emit_op(OpCode::GetLocal);
        self.emit_byte(iterator_slot);
        let more_name = self.identifier_constant("more");
        self.emit_invoke(more_name, 0);
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);

        self.emit_op(OpCode::GetLocal);
        self.emit_byte(iterator_slot);
        let next_name = self.identifier_constant("next");
        self.emit_invoke(next_name, 0);
        self.emit_op(OpCode::SetLocal);
        self.emit_byte(variable_slot);
        self.emit_op(OpCode::Pop);

        let depth = self.state().scope_depth;
        self.state_mut().loops.push(LoopContext {
            continue_target: loop_start,
            break_jumps: Vec::new(),
            scope_depth: depth,
        });

        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.finish_loop();
        self.end_scope();
    }

    /// Patch the current loop's break jumps to land here and pop it.
    fn finish_loop(&mut self) {
        let context = self.state_mut().loops.pop().expect("loop context pushed by caller");
        for jump in context.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        if self.state().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let depth = self.state().loops.last().expect("checked above").scope_depth;
        self.emit_scope_pops(depth);
        let jump = self.emit_jump(OpCode::Jump);
        self.state_mut()
            .loops
            .last_mut()
            .expect("checked above")
            .break_jumps
            .push(jump);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        if self.state().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let context = self.state().loops.last().expect("checked above");
        let (target, depth) = (context.continue_target, context.scope_depth);
        self.emit_scope_pops(depth);
        self.emit_loop(target);
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Constructor {
                self.error("Can't return a value from a constructor.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after throw value.");
        self.emit_op(OpCode::Throw);
    }

    fn try_statement(&mut self) {
        let try_begin = self.emit_jump(OpCode::TryBegin);
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(OpCode::TryEnd);
        let over_catch = self.emit_jump(OpCode::Jump);

        // The unwinder resumes here with the exception on top of the stack.
        self.patch_jump(try_begin);
        self.consume(TokenKind::Catch, "Expect 'catch' after try block.");
        if self.matches(TokenKind::LeftParen) {
            self.consume(TokenKind::Identifier, "Expect exception variable name.");
            let name = self.previous.lexeme;
            self.consume(TokenKind::RightParen, "Expect ')' after exception variable.");
            self.begin_scope();
            self.add_local(name);
            self.mark_initialized();
            self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");
            self.block();
            self.end_scope();
        } else {
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::LeftBrace, "Expect '{' after 'catch'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
        self.patch_jump(over_catch);

        if self.matches(TokenKind::Finally) {
            self.consume(TokenKind::LeftBrace, "Expect '{' after 'finally'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
    }

    fn export_statement(&mut self) {
        if self.state().kind != FunctionKind::Script || self.state().scope_depth > 0 {
            self.error("Can only export from top-level code.");
        }
        self.consume(TokenKind::Identifier, "Expect export name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        self.consume(TokenKind::Semicolon, "Expect ';' after export name.");
        self.emit_op(OpCode::GetGlobal);
        self.emit_uleb(constant);
        self.emit_op(OpCode::Export);
        self.emit_uleb(constant);
    }

    // -----------------------------------------------------------------------
    // switch
    // -----------------------------------------------------------------------

    fn switch_statement(&mut self) {
        self.switch_impl(false);
    }

    fn switch_expression(&mut self, _can_assign: bool) {
        self.switch_impl(true);
    }

    /// Shared lowering for both switch forms. The scrutinee stays on the
    /// stack while arms test it; the matched arm pops it before its body.
    /// The expression form leaves the arm's value (or `null` when nothing
    /// matched); the statement form leaves nothing.
    fn switch_impl(&mut self, is_expression: bool) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch arms.");

        let mut end_jumps = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            // One arm: pattern [, pattern]* -> body
            self.pattern();
            while self.matches(TokenKind::Comma) {
                // Chain further patterns with short-circuit "or".
                let else_jump = self.emit_jump(OpCode::JumpIfFalseSc);
                let true_jump = self.emit_jump(OpCode::Jump);
                self.patch_jump(else_jump);
                self.emit_op(OpCode::Pop);
                self.pattern();
                self.patch_jump(true_jump);
            }
            self.consume(TokenKind::Arrow, "Expect '->' after switch pattern.");

            let next_arm = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop); // the scrutinee
            if is_expression {
                self.expression();
                self.consume(TokenKind::Semicolon, "Expect ';' after switch arm.");
            } else if self.matches(TokenKind::LeftBrace) {
                self.begin_scope();
                self.block();
                self.end_scope();
            } else {
                self.statement();
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(next_arm);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch arms.");

        // No arm matched: drop the scrutinee.
        self.emit_op(OpCode::Pop);
        if is_expression {
            self.emit_op(OpCode::Null);
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    /// Compile one switch pattern. The scrutinee is on top of the stack on
    /// entry and must remain beneath a single boolean test result on exit.
    fn pattern(&mut self) {
        if self.matches(TokenKind::Else) {
            self.emit_op(OpCode::True);
        } else if self.matches(TokenKind::Bang) {
            self.pattern();
            self.emit_op(OpCode::Not);
        } else if self.matches(TokenKind::In) {
            self.emit_op(OpCode::Dup);
            self.expression();
            self.emit_op(OpCode::In);
        } else if self.matches(TokenKind::Is) {
            self.consume(TokenKind::Identifier, "Expect type name after 'is'.");
            let type_name = match self.previous.lexeme {
                "Boolean" => "boolean",
                "Number" => "number",
                "Null" => "null",
                "Function" => "function",
                "Class" => "class",
                "Instance" => "instance",
                "String" => "string",
                "List" => "list",
                _ => {
                    self.error("Unknown type name after 'is'.");
                    ""
                }
            };
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::Typeof);
            let handle = self.heap.intern(type_name);
            self.emit_constant(Value::Obj(handle));
            self.emit_op(OpCode::Equal);
        } else if self.matches(TokenKind::PipeArrow) {
            self.emit_op(OpCode::Dup);
            self.expression();
            self.emit_op(OpCode::Swap);
            self.emit_op(OpCode::Call);
            self.emit_byte(1);
        } else {
            self.emit_op(OpCode::Dup);
            self.expression();
            self.emit_op(OpCode::Equal);
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("tokens with a precedence have an infix rule");
            infix(self, can_assign);
        }

        if can_assign && (self.check(TokenKind::Equal) || self.compound_op().is_some()) {
            self.advance();
            self.error("Invalid assignment target.");
        }
    }

    /// The binary opcode for the compound-assignment operator at `current`,
    /// if there is one.
    fn compound_op(&self) -> Option<OpCode> {
        match self.current.kind {
            TokenKind::PlusEqual => Some(OpCode::Add),
            TokenKind::MinusEqual => Some(OpCode::Subtract),
            TokenKind::StarEqual => Some(OpCode::Multiply),
            TokenKind::SlashEqual => Some(OpCode::Divide),
            TokenKind::PercentEqual => Some(OpCode::Modulo),
            TokenKind::CaretEqual => Some(OpCode::BitXor),
            TokenKind::AmpEqual => Some(OpCode::BitAnd),
            TokenKind::BarEqual => Some(OpCode::BitOr),
            TokenKind::ShlEqual => Some(OpCode::Shl),
            TokenKind::ShrEqual => Some(OpCode::Shr),
            TokenKind::UshrEqual => Some(OpCode::Ushr),
            _ => None,
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let decoded = self.decode_string(lexeme);
        let handle = self.heap.intern(&decoded);
        self.emit_constant(Value::Obj(handle));
    }

    /// Strip the quotes from a string lexeme and process its escapes.
    fn decode_string(&mut self, lexeme: &str) -> String {
        let inner = &lexeme[1..lexeme.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
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
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                _ => self.error("Invalid escape sequence in string."),
            }
        }
        out
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Null => self.emit_op(OpCode::Null),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            TokenKind::Typeof => self.emit_op(OpCode::Typeof),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = Self::rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::Amp => self.emit_op(OpCode::BitAnd),
            TokenKind::Bar => self.emit_op(OpCode::BitOr),
            TokenKind::Caret => self.emit_op(OpCode::BitXor),
            TokenKind::Shl => self.emit_op(OpCode::Shl),
            TokenKind::Shr => self.emit_op(OpCode::Shr),
            TokenKind::Ushr => self.emit_op(OpCode::Ushr),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::Is => self.emit_op(OpCode::Is),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::In => self.emit_op(OpCode::In),
            TokenKind::Instanceof => self.emit_op(OpCode::Instanceof),
            TokenKind::DotDot => self.emit_op(OpCode::Range),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalseSc);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And.next());
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalseSc);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or.next());
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' in ternary expression.");
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        // Right-associative: the else branch may itself be a ternary.
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    /// `a |> f` calls `f(a)`: the argument is already on the stack, so swap
    /// it above the callee and call with one argument.
    fn pipe(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Pipe.next());
        self.emit_op(OpCode::Swap);
        self.emit_op(OpCode::Call);
        self.emit_byte(1);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARGS) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_uleb(name);
        } else if can_assign && self.compound_op().is_some() {
            let op = self.compound_op().expect("checked above");
            self.advance();
            self.emit_op(OpCode::Dup);
            self.emit_op(OpCode::GetProperty);
            self.emit_uleb(name);
            self.expression();
            self.emit_op(op);
            self.emit_op(OpCode::SetProperty);
            self.emit_uleb(name);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_invoke(name, argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_uleb(name);
        }
    }

    fn emit_invoke(&mut self, name: u32, argc: u8) {
        self.emit_op(OpCode::Invoke);
        self.emit_uleb(name);
        self.emit_byte(argc);
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else if can_assign && self.compound_op().is_some() {
            let op = self.compound_op().expect("checked above");
            self.advance();
            self.emit_op(OpCode::DupTwo);
            self.emit_op(OpCode::GetIndex);
            self.expression();
            self.emit_op(op);
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count >= MAX_LIST_ITEMS {
                    self.error("Can't have more than 255 items in a list literal.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list items.");
        self.emit_op(OpCode::List);
        self.emit_byte(count.min(MAX_LIST_ITEMS) as u8);
    }

    /// `{ k: v, k2, "k3": v3 }` instantiates the base object class and sets
    /// each field in turn. A bare identifier is shorthand for `k: k`.
    fn object_literal(&mut self, _can_assign: bool) {
        self.emit_op(OpCode::Object);
        self.emit_op(OpCode::Call);
        self.emit_byte(0);

        if !self.check(TokenKind::RightBrace) {
            loop {
                let (constant, shorthand_token) = if self.matches(TokenKind::String) {
                    let decoded = self.decode_string(self.previous.lexeme);
                    let handle = self.heap.intern(&decoded);
                    (self.chunk_mut().add_constant(Value::Obj(handle)), None)
                } else {
                    self.consume(TokenKind::Identifier, "Expect field name.");
                    (self.identifier_constant(self.previous.lexeme), Some(self.previous))
                };

                if self.matches(TokenKind::Colon) {
                    self.expression();
                } else if let Some(token) = shorthand_token {
                    self.named_variable(token, false);
                } else {
                    self.error_at_current("Expect ':' after string field name.");
                }
                self.emit_op(OpCode::SetPropertyKv);
                self.emit_uleb(constant);

                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after object literal.");
    }

    /// `|a, b| expr`, `|a, b| { ... }` and the zero-parameter form `||`.
    fn lambda(&mut self, _can_assign: bool) {
        let zero_params = self.previous.kind == TokenKind::BarBar;
        self.push_state(FunctionKind::Lambda, None);
        self.begin_scope();

        if !zero_params && !self.check(TokenKind::Bar) {
            loop {
                if self.state().arity as usize >= MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                self.state_mut().arity += 1;
                if self.matches(TokenKind::Ellipsis) {
                    self.state_mut().varargs = true;
                    if !self.check(TokenKind::Bar) {
                        self.error("Vararg parameter must be last.");
                    }
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        if !zero_params {
            self.consume(TokenKind::Bar, "Expect '|' after lambda parameters.");
        }

        if self.matches(TokenKind::LeftBrace) {
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.declaration();
            }
            self.consume(TokenKind::RightBrace, "Expect '}' after lambda body.");
        } else {
            self.expression();
            self.emit_op(OpCode::Return);
        }

        self.pop_state();
    }

    fn import_expression(&mut self, _can_assign: bool) {
        self.consume(TokenKind::String, "Expect import path string.");
        let decoded = self.decode_string(self.previous.lexeme);
        let handle = self.heap.intern(&decoded);
        let constant = self.chunk_mut().add_constant(Value::Obj(handle));
        self.emit_op(OpCode::Import);
        self.emit_uleb(constant);
    }

    fn variable(&mut self, can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        let token = self.previous;
        self.named_variable(token, false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_uleb(name);
            self.emit_byte(argc);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op(OpCode::GetSuper);
            self.emit_uleb(name);
        }
    }

    /// Resolve an identifier to a local, upvalue or global and emit the
    /// read, or, when assignment is legal here, the write or compound
    /// read-modify-write.
    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let state_index = self.states.len() - 1;
        let access = if let Some(slot) = self.resolve_local(state_index, token.lexeme) {
            VarAccess::Local(slot)
        } else if let Some(index) = self.resolve_upvalue(state_index, token.lexeme) {
            VarAccess::Upvalue(index)
        } else {
            VarAccess::Global(self.identifier_constant(token.lexeme))
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_var(access, false);
        } else if can_assign && self.compound_op().is_some() {
            let op = self.compound_op().expect("checked above");
            self.advance();
            self.emit_var(access, true);
            self.expression();
            self.emit_op(op);
            self.emit_var(access, false);
        } else {
            self.emit_var(access, true);
        }
    }

    fn emit_var(&mut self, access: VarAccess, get: bool) {
        match access {
            VarAccess::Local(slot) => {
                self.emit_op(if get { OpCode::GetLocal } else { OpCode::SetLocal });
                self.emit_byte(slot);
            }
            VarAccess::Upvalue(index) => {
                self.emit_op(if get { OpCode::GetUpvalue } else { OpCode::SetUpvalue });
                self.emit_byte(index);
            }
            VarAccess::Global(constant) => {
                self.emit_op(if get { OpCode::GetGlobal } else { OpCode::SetGlobal });
                self.emit_uleb(constant);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Parse rule table
    // -----------------------------------------------------------------------

    fn rule(kind: TokenKind) -> Rule<'src, 'h> {
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            LeftBracket => (Some(Self::list), Some(Self::index), Precedence::Call),
            LeftBrace => (Some(Self::object_literal), None, Precedence::None),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Star | Slash | Percent => (None, Some(Self::binary), Precedence::Factor),
            DotDot => (None, Some(Self::binary), Precedence::Range),
            Bang => (Some(Self::unary), None, Precedence::None),
            Tilde => (Some(Self::unary), None, Precedence::None),
            Typeof => (Some(Self::unary), None, Precedence::None),
            Amp => (None, Some(Self::binary), Precedence::BitAnd),
            Caret => (None, Some(Self::binary), Precedence::BitXor),
            Bar => (Some(Self::lambda), Some(Self::binary), Precedence::BitOr),
            BarBar => (Some(Self::lambda), Some(Self::or), Precedence::Or),
            AmpAmp => (None, Some(Self::and), Precedence::And),
            Shl | Shr | Ushr => (None, Some(Self::binary), Precedence::Shift),
            BangEqual | EqualEqual | Is => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual | In | Instanceof => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Question => (None, Some(Self::ternary), Precedence::Ternary),
            PipeArrow => (None, Some(Self::pipe), Precedence::Pipe),
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            True | False | Null => (Some(Self::literal), None, Precedence::None),
            This => (Some(Self::this), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            Switch => (Some(Self::switch_expression), None, Precedence::None),
            Import => (Some(Self::import_expression), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        Rule { prefix, infix, precedence }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("source should compile");
        (function, heap)
    }

    fn compile_errors(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, &mut heap) {
            Err(Error::Compile(errors)) => errors,
            other => panic!("expected compile errors, got {other:?}"),
        }
    }

    fn chunk_of(heap: &Heap, function: ObjRef) -> &Chunk {
        match heap.get(function) {
            Obj::Function(f) => &f.chunk,
            _ => panic!("not a function"),
        }
    }

    #[test]
    fn script_ends_with_implicit_return_null() {
        let (function, heap) = compile_ok("var a = 1;");
        let chunk = chunk_of(&heap, function);
        let len = chunk.code.len();
        assert_eq!(chunk.code[len - 2], OpCode::Null as u8);
        assert_eq!(chunk.code[len - 1], OpCode::Return as u8);
    }

    #[test]
    fn uninitialized_read_is_rejected() {
        let errors = compile_errors("{ var x = x; }");
        assert!(errors[0].contains("its own initializer"), "{errors:?}");
    }

    #[test]
    fn invalid_assignment_target() {
        let errors = compile_errors("var a; var b; a + b = 3;");
        assert!(errors[0].contains("Invalid assignment target"), "{errors:?}");
    }

    #[test]
    fn invalid_compound_assignment_target() {
        let errors = compile_errors("var a; var b; a + b += 3;");
        assert!(errors[0].contains("Invalid assignment target"), "{errors:?}");
    }

    #[test]
    fn top_level_return_is_rejected() {
        let errors = compile_errors("return 1;");
        assert!(errors[0].contains("top-level"), "{errors:?}");
    }

    #[test]
    fn constructor_value_return_is_rejected() {
        let errors = compile_errors("class A { constructor() { return 3; } }");
        assert!(errors[0].contains("constructor"), "{errors:?}");
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let errors = compile_errors("break;");
        assert!(errors[0].contains("'break'"), "{errors:?}");
    }

    #[test]
    fn too_many_list_items() {
        let mut source = String::from("var l = [");
        for i in 0..256 {
            source.push_str(&format!("{i},"));
        }
        source.push_str("];");
        let errors = compile_errors(&source);
        assert!(errors[0].contains("255 items"), "{errors:?}");
    }

    #[test]
    fn too_many_locals() {
        let mut source = String::from("{");
        for i in 0..=256 {
            source.push_str(&format!("var v{i} = 0;"));
        }
        source.push('}');
        let errors = compile_errors(&source);
        assert!(errors[0].contains("Too many local variables"), "{errors:?}");
    }

    #[test]
    fn panic_mode_recovers_once_per_statement() {
        // Two broken statements produce exactly two diagnostics.
        let errors = compile_errors("var 1 = 2; var 3 = 4;");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn error_format_carries_line_and_token() {
        let errors = compile_errors("var a = ;\n");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("[1] Error at ';':"), "{errors:?}");
    }

    #[test]
    fn vararg_must_be_last() {
        let errors = compile_errors("function f(a..., b) { }");
        assert!(errors[0].contains("Vararg parameter"), "{errors:?}");
    }

    #[test]
    fn super_outside_class_is_rejected() {
        let errors = compile_errors("var x = super.foo;");
        assert!(errors[0].contains("outside of a class"), "{errors:?}");
    }

    #[test]
    fn unterminated_string_reports_scanner_message() {
        let errors = compile_errors("var s = \"abc");
        assert!(errors[0].contains("Unterminated string"), "{errors:?}");
    }

    #[test]
    fn closure_captures_emit_upvalue_descriptors() {
        let (script, heap) = compile_ok(
            "function outer() { var x = 1; function inner() { return x; } return inner; }",
        );
        // The script chunk holds the outer function as a constant; the outer
        // chunk holds inner, which must report one upvalue.
        let script_chunk = chunk_of(&heap, script);
        let outer = script_chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Function(f) if f.name.is_some() => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let outer_chunk = chunk_of(&heap, outer);
        let inner = outer_chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Function(f) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);
    }
}
