use crate::assembler::OpCode;
use crate::compiler::{Compiler, FunctionSig};
use crate::lexer::{lex, Span, Token};
use crate::source::{SourceLocation, SourceManager};
use crate::value::{
    parse_type_name, q_div, q_mul, release, FunctionRef, Obj, TypeKind, Value, INTSCALED_SHIFT,
};

/// Compilation failed; the first collected diagnostic message. All
/// diagnostics have already been reported through the SourceManager.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

/// Result of compiling a sub-expression: either a constant still pending
/// materialization, or a register holding the already-emitted result.
enum ExprResult {
    Const(Value, TypeKind),
    Reg { reg: i32, ty: TypeKind, item_id: i32 },
}

impl ExprResult {
    fn reg(reg: i32, ty: TypeKind) -> ExprResult {
        ExprResult::Reg { reg, ty, item_id: -1 }
    }

    fn ty(&self) -> TypeKind {
        match self {
            ExprResult::Const(_, ty) => *ty,
            ExprResult::Reg { ty, .. } => *ty,
        }
    }

    fn item_id(&self) -> i32 {
        match self {
            ExprResult::Const(..) => -1,
            ExprResult::Reg { item_id, .. } => *item_id,
        }
    }

    /// Puts the result in a register, emitting a pending constant load.
    fn materialize(self, c: &mut Compiler, line: i32) -> i32 {
        match self {
            ExprResult::Const(v, _) => c.emit_const(v, line),
            ExprResult::Reg { reg, .. } => reg,
        }
    }
}

enum ChainOp {
    Dot(String),
    Index(i32),
}

/// Single-pass parser: tokens are walked once and instructions are emitted
/// directly into the compiler's assembler.
struct Parser<'a> {
    c: &'a mut Compiler,
    sm: &'a SourceManager,
    tokens: Vec<(Token, Span)>,
    pos: usize,
}

/// Compiles one unit into `c.asm`. Diagnostics are collected while parsing
/// continues; if any exist at unit end they are reported through `sm` and
/// the first becomes the error.
pub fn compile_unit(c: &mut Compiler, sm: &SourceManager) -> Result<(), CompileError> {
    let tokens = lex(&sm.source);
    let mut p = Parser { c, sm, tokens, pos: 0 };
    p.unit();
    if !p.c.diagnostics.is_empty() {
        for d in &p.c.diagnostics {
            sm.report("Compilation error", d.location, &d.message);
        }
        return Err(CompileError { message: p.c.diagnostics[0].message.clone() });
    }
    Ok(())
}

impl<'a> Parser<'a> {
    fn curr(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek(&self, lookahead: usize) -> &Token {
        &self.tokens[(self.pos + lookahead).min(self.tokens.len() - 1)].0
    }

    fn curr_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1.clone()
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn line(&self) -> i32 {
        self.sm.line_of(self.curr_span().start)
    }

    fn loc(&self) -> SourceLocation {
        self.sm.location(&self.curr_span())
    }

    fn diag(&mut self, msg: impl Into<String>) {
        let loc = self.loc();
        self.c.push_diag(msg, loc);
    }

    /// Consumes the expected token or records a diagnostic and skips
    /// forward to it or to a synchronizing token, with a safety bound.
    fn consume(&mut self, expected: &Token, msg: &str) {
        if self.curr() == expected {
            self.advance();
            return;
        }
        self.diag(msg);
        let mut safety = 0;
        while self.curr() != expected
            && !matches!(self.curr(), Token::Eof | Token::RBrace | Token::End | Token::Bad(_))
            && safety < 2000
        {
            self.advance();
            safety += 1;
        }
        if self.curr() == expected {
            self.advance();
        }
    }

    fn resolve_type_name(&self, s: &str) -> (TypeKind, i32) {
        let kind = parse_type_name(s);
        if kind != TypeKind::Unknown {
            return (kind, -1);
        }
        let id = self.c.find_item_id_by_name(s);
        if id >= 0 {
            return (TypeKind::Item, id);
        }
        (TypeKind::Unknown, -1)
    }

    // ── Prescan ──────────────────────────────────────────────────────

    /// Walks the token vector before parsing. Item names are reserved
    /// first so item return types resolve in any source order; then every
    /// `on <type> <name> (params)` head gets a label and a complete
    /// provisional signature, so calls preceding definitions (mutual
    /// recursion included) resolve by arity and type.
    fn prescan(&mut self) {
        for i in 0..self.tokens.len().saturating_sub(1) {
            if self.tokens[i].0 == Token::Item {
                if let Token::Ident(name) = &self.tokens[i + 1].0 {
                    let name = name.clone();
                    self.c.declare_item_name(&name);
                }
            }
        }
        for i in 0..self.tokens.len().saturating_sub(2) {
            if self.tokens[i].0 != Token::On {
                continue;
            }
            let (Token::Ident(rett), Token::Ident(fname)) =
                (&self.tokens[i + 1].0, &self.tokens[i + 2].0)
            else {
                continue;
            };
            let kind = parse_type_name(rett);
            let mut uid = -1;
            if kind == TypeKind::Unknown {
                uid = self.c.find_item_id_by_name(rett);
                if uid < 0 {
                    continue;
                }
            }
            let fname = fname.clone();
            let declared_line = self.sm.line_of(self.tokens[i + 2].1.start);
            let param_types = self.prescan_params(i + 3);
            let label = self.c.asm.make_label();
            let sig = FunctionSig {
                name: fname.clone(),
                param_types,
                return_type: if uid >= 0 { TypeKind::Item } else { kind },
                user_return_type_id: uid,
                label_id: label as i32,
                declared_line,
                is_builtin: false,
            };
            self.c.function_table.entry(fname).or_default().push(sig);
        }
    }

    /// Collects `name : type` pairs starting at an expected '(' position.
    fn prescan_params(&self, mut j: usize) -> Vec<TypeKind> {
        let mut params = Vec::new();
        if self.tokens.get(j).map(|t| &t.0) != Some(&Token::LParen) {
            return params;
        }
        j += 1;
        loop {
            let Some((Token::Ident(_), _)) = self.tokens.get(j) else { break };
            if self.tokens.get(j + 1).map(|t| &t.0) != Some(&Token::Colon) {
                break;
            }
            let Some((Token::Ident(tname), _)) = self.tokens.get(j + 2) else { break };
            let kind = parse_type_name(tname);
            if kind == TypeKind::Unknown && self.c.find_item_id_by_name(tname) >= 0 {
                params.push(TypeKind::Item);
            } else {
                params.push(kind);
            }
            j += 3;
            if self.tokens.get(j).map(|t| &t.0) == Some(&Token::Comma) {
                j += 1;
                continue;
            }
            break;
        }
        params
    }

    // ── Unit ─────────────────────────────────────────────────────────

    fn unit(&mut self) {
        self.prescan();

        // The prologue jump runs first so the entry call to main executes
        // regardless of where functions sit in the source.
        let entry_label = self.c.asm.make_label();
        self.c.asm.emit_jump(OpCode::Jmp, 0, 0, entry_label);

        if self.curr() != &Token::Unit {
            self.diag("Expected 'unit' at the beginning");
            return;
        }
        self.advance();
        if !matches!(self.curr(), Token::Ident(_)) {
            self.diag("Expected unit name");
            return;
        }
        self.advance();

        // Import list `: name [as alias] (, name [as alias])*` is parsed
        // and discarded; cross-module linking is out of scope.
        if self.curr() == &Token::Colon {
            self.advance();
            while matches!(self.curr(), Token::Ident(_)) {
                self.advance();
                if self.curr() == &Token::As {
                    self.advance();
                    if matches!(self.curr(), Token::Ident(_)) {
                        self.advance();
                    }
                }
                if self.curr() == &Token::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }

        self.consume(&Token::LBrace, "Expected '{' token after unit header");

        while self.curr() != &Token::RBrace && self.curr() != &Token::Eof {
            match self.curr() {
                Token::On => {
                    if !self.function_decl() {
                        break;
                    }
                }
                Token::Item => {
                    if !self.item_decl() {
                        break;
                    }
                }
                _ => {
                    self.diag("expected 'on <type> <func>'");
                    self.advance();
                }
            }
        }

        self.consume(&Token::RBrace, "Expected '}' on unit's end");

        self.c.asm.bind_label(entry_label);

        let line = self.line();
        match self.c.resolve_function("main", &[]) {
            Some(mainfs) if mainfs.label_id >= 0 => {
                let dest = if mainfs.return_type == TypeKind::Void {
                    self.c.define_local("", TypeKind::Unknown, -1)
                } else {
                    self.c.define_local("___main_ret", mainfs.return_type, -1)
                };
                let argc = mainfs.param_types.len() as i32;
                self.c.asm.emit_call(line, dest, mainfs.label_id as usize, argc);
            }
            _ => self.c.push_diag("Function 'main' not found", SourceLocation::default()),
        }

        let nilreg = self.c.emit_const(Value::nil(), line);
        self.c.asm.emit(OpCode::Return, line, nilreg, 0, 0);
    }

    /// `on <type> <name> '(' params? ')' (block_braced | stmts 'end')`.
    /// Returns false on a header error that aborts the unit body walk.
    fn function_decl(&mut self) -> bool {
        self.advance(); // 'on'

        let Token::Ident(rett_tok) = self.curr().clone() else {
            self.diag("Expected return type after 'on'");
            return false;
        };
        let (rett_kind, rett_uid) = self.resolve_type_name(&rett_tok);
        if rett_kind == TypeKind::Unknown {
            self.diag(format!("Unknown return type: {rett_tok}"));
        }
        self.advance();

        let Token::Ident(fname) = self.curr().clone() else {
            self.diag("Expected function name after type");
            return false;
        };
        let declared_line = self.line();
        self.advance();

        // Prefer the next prescanned, still-unbound label for this name;
        // otherwise allocate one (e.g. a head the prescan rejected).
        let mut chosen: i32 = -1;
        if let Some(overloads) = self.c.function_table.get(&fname) {
            for fs in overloads {
                let id = fs.label_id;
                if id >= 0
                    && (id as usize) < self.c.asm.labels.len()
                    && self.c.asm.labels[id as usize].target_pc == -1
                {
                    chosen = id;
                    break;
                }
            }
        }
        if chosen == -1 {
            chosen = self.c.asm.make_label() as i32;
            let sig = FunctionSig {
                name: fname.clone(),
                param_types: Vec::new(),
                return_type: rett_kind,
                user_return_type_id: rett_uid,
                label_id: chosen,
                declared_line,
                is_builtin: false,
            };
            self.c.function_table.entry(fname.clone()).or_default().push(sig);
        }
        self.c.asm.bind_label(chosen as usize);
        self.c.current_function = fname.clone();

        self.consume(&Token::LParen, "Expected '(' token after function name");
        let mut pnames: Vec<String> = Vec::new();
        let mut ptypes: Vec<TypeKind> = Vec::new();
        let mut puserids: Vec<i32> = Vec::new();
        if self.curr() != &Token::RParen {
            loop {
                let Token::Ident(pname) = self.curr().clone() else {
                    self.diag("Expected param name");
                    break;
                };
                self.advance();
                self.consume(&Token::Colon, "Expected ':' token after param name");
                let Token::Ident(ptype_tok) = self.curr().clone() else {
                    self.diag("Expected param type");
                    break;
                };
                let (pk, puid) = self.resolve_type_name(&ptype_tok);
                if pk == TypeKind::Unknown {
                    self.diag(format!("Unknown type for the param: {ptype_tok}"));
                }
                self.advance();
                pnames.push(pname);
                ptypes.push(pk);
                puserids.push(puid);
                if self.curr() == &Token::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.consume(&Token::RParen, "Expected ')'");

        if let Some(overloads) = self.c.function_table.get_mut(&fname) {
            for fs in overloads {
                if fs.label_id == chosen {
                    fs.param_types = ptypes.clone();
                    fs.return_type = rett_kind;
                    fs.user_return_type_id = rett_uid;
                    break;
                }
            }
        }

        self.c.begin_scope();
        for i in 0..pnames.len() {
            self.c.define_local(&pnames[i], ptypes[i], puserids[i]);
        }

        if self.curr() == &Token::LBrace {
            self.advance();
        }
        while !matches!(self.curr(), Token::End | Token::RBrace | Token::Eof) {
            self.stmt();
        }
        if self.curr() == &Token::RBrace {
            self.advance();
        } else {
            self.consume(&Token::End, "Expected 'end' token after function");
        }

        // Implicit nil return guards fall-through off the body end.
        let line = self.line();
        let nilreg = self.c.emit_const(Value::nil(), line);
        self.c.asm.emit(OpCode::Return, line, nilreg, 0, 0);
        self.c.end_scope();

        self.c.current_function.clear();
        true
    }

    /// `item <name> [':' <parent>] '(' (type ident)(',' type ident)* ')'`
    fn item_decl(&mut self) -> bool {
        self.advance(); // 'item'
        let Token::Ident(item_name) = self.curr().clone() else {
            self.diag("Expected item name");
            return false;
        };
        self.advance();

        let mut parent_id = -1;
        if self.curr() == &Token::Colon {
            self.advance();
            if let Token::Ident(parent_name) = self.curr().clone() {
                let id = self.c.find_item_id_by_name(&parent_name);
                if id >= 0 && self.c.items[id as usize].defined {
                    parent_id = id;
                } else {
                    self.diag(format!(
                        "Parent item '{parent_name}' must be declared before '{item_name}'"
                    ));
                }
                self.advance();
            }
        }

        self.consume(&Token::LParen, "Expected '(' after item header");
        let mut fields: Vec<(String, TypeKind)> = Vec::new();
        if self.curr() != &Token::RParen {
            loop {
                let Token::Ident(type_tok) = self.curr().clone() else {
                    self.diag("Expected field type");
                    break;
                };
                self.advance();
                let mut ftk = parse_type_name(&type_tok);
                if ftk == TypeKind::Unknown {
                    if self.c.find_item_id_by_name(&type_tok) >= 0 {
                        // Item-typed fields are stored as tables.
                        ftk = TypeKind::Table;
                    } else {
                        self.diag(format!("Unknown field type: {type_tok}"));
                    }
                }
                let Token::Ident(field_name) = self.curr().clone() else {
                    self.diag("Expected field name");
                    break;
                };
                self.advance();
                fields.push((field_name, ftk));
                if self.curr() == &Token::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.consume(&Token::RParen, "Expected ')'");
        self.c.register_item_type(&item_name, parent_id, fields);
        true
    }

    // ── Statements ───────────────────────────────────────────────────

    fn stmt(&mut self) {
        let line = self.line();

        if let Token::Bad(lexeme) = self.curr().clone() {
            self.diag(format!("Unexpected token: '{lexeme}'"));
            self.advance();
            return;
        }

        // Assignment through an access chain: `base(.member | [expr])* = rhs`.
        // The chain is collected greedily; if no '=' follows, the token
        // position is rolled back and the statement re-parses below.
        if matches!(self.curr(), Token::Ident(_)) && self.peek(1) != &Token::LParen {
            let save_pos = self.pos;
            let Token::Ident(name) = self.curr().clone() else { unreachable!() };
            self.advance();

            let loc = self.c.resolve_local(&name);
            if loc != -1 {
                let base = &self.c.locals[loc as usize];
                let (base_ty, base_item) = (base.ty, base.item_id);
                let mut tmp = self.c.define_local("", base_ty, base_item);
                self.c.asm.emit(OpCode::Move, line, tmp, loc, 0);

                let mut chain: Vec<ChainOp> = Vec::new();
                let mut failed_parse_chain = false;
                while matches!(self.curr(), Token::Dot | Token::LBracket) {
                    if self.curr() == &Token::Dot {
                        self.advance();
                        let Token::Ident(member) = self.curr().clone() else {
                            failed_parse_chain = true;
                            break;
                        };
                        self.advance();
                        chain.push(ChainOp::Dot(member));
                    } else {
                        self.advance();
                        let p = self.expr(0);
                        let preg = p.materialize(self.c, line);
                        let negone = self.c.emit_const(Value::int(-1), line);
                        // Source indices are 1-based; adjust before use.
                        self.c.asm.emit(OpCode::Add, line, preg, preg, negone);
                        self.consume(&Token::RBracket, "Expected ']'");
                        chain.push(ChainOp::Index(preg));
                    }
                }

                if self.curr() == &Token::Assign && !failed_parse_chain {
                    self.advance();
                    let rv = self.expr(0);
                    let rv_ty = rv.ty();
                    let rreg = rv.materialize(self.c, line);

                    if chain.is_empty() {
                        let slot_ty = self.c.locals[loc as usize].ty;
                        if slot_ty != TypeKind::Unknown
                            && rv_ty != TypeKind::Unknown
                            && slot_ty != rv_ty
                        {
                            self.diag(format!("Assigning with incompatible type to {name}"));
                        }
                        self.c.asm.emit(OpCode::Move, line, loc, rreg, 0);
                        return;
                    }

                    for op in &chain[..chain.len() - 1] {
                        tmp = self.chain_read_step(tmp, op, line);
                    }

                    match chain.last().unwrap() {
                        ChainOp::Dot(member) => {
                            let base_item = self.c.locals[tmp as usize].item_id;
                            if base_item >= 0 {
                                let found = self
                                    .c
                                    .item_fields(base_item)
                                    .iter()
                                    .position(|(n, _)| n == member);
                                if let Some(idx) = found {
                                    self.c.asm.emit(
                                        OpCode::StructSet,
                                        line,
                                        tmp,
                                        idx as i32,
                                        rreg,
                                    );
                                    return;
                                }
                            }
                            let keyreg = self.c.emit_const(Value::string(member.clone()), line);
                            if self.c.locals[tmp as usize].ty == TypeKind::List {
                                self.c.asm.emit(OpCode::ListSet, line, tmp, keyreg, rreg);
                            } else {
                                self.c.asm.emit(OpCode::TableSet, line, tmp, keyreg, rreg);
                            }
                        }
                        ChainOp::Index(keyreg) => {
                            if self.c.locals[tmp as usize].ty == TypeKind::List {
                                self.c.asm.emit(OpCode::ListSet, line, tmp, *keyreg, rreg);
                            } else {
                                self.c.asm.emit(OpCode::TableSet, line, tmp, *keyreg, rreg);
                            }
                        }
                    }
                    return;
                }
            }
            self.pos = save_pos;
        }

        // Typed declaration: `T x = expr`. The declared type becomes the
        // expected return type while the right side compiles, steering
        // overload resolution.
        if matches!(self.curr(), Token::Ident(_))
            && matches!(self.peek(1), Token::Ident(_))
            && self.peek(2) == &Token::Assign
        {
            let Token::Ident(type_tok) = self.curr().clone() else { unreachable!() };
            let (tk, tuid) = self.resolve_type_name(&type_tok);
            let Token::Ident(var_name) = self.peek(1).clone() else { unreachable!() };
            self.advance();
            self.advance();
            self.advance();

            let prev_expected = self.c.expected_return;
            if tk != TypeKind::Unknown {
                self.c.expected_return = tk;
            }
            let res = self.expr(0);
            let res_ty = res.ty();
            let res_item_id = res.item_id();
            let r = res.materialize(self.c, line);
            self.c.expected_return = prev_expected;

            let user_id = match tk {
                TypeKind::Item => tuid,
                TypeKind::Unknown => res_item_id,
                _ => -1,
            };
            let ty = if tk == TypeKind::Unknown { res_ty } else { tk };
            let slot = self.c.define_local(&var_name, ty, user_id);
            self.c.asm.emit(OpCode::Move, line, slot, r, 0);
            return;
        }

        if self.curr() == &Token::Var {
            self.advance();
            let Token::Ident(name) = self.curr().clone() else {
                self.diag("Expected variable name");
                if self.curr() != &Token::Assign {
                    self.advance();
                }
                return;
            };
            self.advance();
            self.consume(&Token::Assign, "Expected '=' after variable name");
            let rres = self.expr(0);
            let rres_ty = rres.ty();
            let rres_item_id = rres.item_id();
            let r = rres.materialize(self.c, line);
            let slot = self.c.define_local(&name, rres_ty, rres_item_id);
            self.c.asm.emit(OpCode::Move, line, slot, r, 0);
            return;
        }

        if matches!(self.curr(), Token::Ident(_)) && self.peek(1) == &Token::Assign {
            let Token::Ident(name) = self.curr().clone() else { unreachable!() };
            self.advance();
            self.advance();
            let rres = self.expr(0);
            let rres_ty = rres.ty();
            let r = rres.materialize(self.c, line);
            let v = self.c.resolve_local(&name);
            if v == -1 {
                self.diag(format!("Unknown variable: {name}"));
                return;
            }
            let slot_ty = self.c.locals[v as usize].ty;
            if slot_ty != TypeKind::Unknown
                && rres_ty != TypeKind::Unknown
                && slot_ty != rres_ty
            {
                self.diag(format!("Assigning with incompatible type to {name}"));
            }
            self.c.asm.emit(OpCode::Move, line, v, r, 0);
            return;
        }

        if self.curr() == &Token::Return {
            self.advance();
            if matches!(self.curr(), Token::End | Token::RBrace | Token::Eof) {
                let nilreg = self.c.emit_const(Value::nil(), line);
                self.c.asm.emit(OpCode::Return, line, nilreg, 0, 0);
            } else {
                let res = self.expr(0);
                let r = res.materialize(self.c, line);
                self.c.asm.emit(OpCode::Return, line, r, 0, 0);
            }
            return;
        }

        if self.curr() == &Token::If {
            self.advance();
            self.consume(&Token::LParen, "Expected '(' after 'if'");
            let cond = self.expr(0);
            let cond_reg = cond.materialize(self.c, line);
            self.consume(&Token::RParen, "Expected ')'");
            let else_l = self.c.asm.make_label();
            let end_l = self.c.asm.make_label();
            self.c.asm.emit_jump(OpCode::JmpFalse, line, cond_reg, else_l);
            self.c.begin_scope();
            while !matches!(self.curr(), Token::End | Token::Else | Token::Eof) {
                self.stmt();
            }
            self.c.end_scope();
            self.c.asm.emit_jump(OpCode::Jmp, line, 0, end_l);
            self.c.asm.bind_label(else_l);
            if self.curr() == &Token::Else {
                self.advance();
                if self.curr() == &Token::If {
                    self.stmt();
                } else {
                    self.c.begin_scope();
                    while !matches!(self.curr(), Token::End | Token::Eof) {
                        self.stmt();
                    }
                    self.c.end_scope();
                    self.consume(&Token::End, "Expected 'end' token after else");
                }
            } else {
                self.consume(&Token::End, "Expected 'end' token after if");
            }
            self.c.asm.bind_label(end_l);
            return;
        }

        if self.curr() == &Token::While {
            self.advance();
            let start = self.c.asm.make_label();
            let end = self.c.asm.make_label();
            self.c.asm.bind_label(start);
            self.consume(&Token::LParen, "Expected '(' after 'while'");
            let cond = self.expr(0);
            let cond_reg = cond.materialize(self.c, line);
            self.consume(&Token::RParen, "Expected ')'");
            self.c.asm.emit_jump(OpCode::JmpFalse, line, cond_reg, end);
            self.c.begin_scope();
            while !matches!(self.curr(), Token::End | Token::Eof) {
                self.stmt();
            }
            self.c.end_scope();
            self.c.asm.emit_jump(OpCode::Jmp, line, 0, start);
            self.consume(&Token::End, "Expected 'end' token after while");
            self.c.asm.bind_label(end);
            return;
        }

        // Expression statement: evaluate and ignore the result.
        let res = self.expr(0);
        res.materialize(self.c, line);
    }

    /// One read step of an l-value chain prefix, returning the register
    /// holding the step's result.
    fn chain_read_step(&mut self, tmp: i32, op: &ChainOp, line: i32) -> i32 {
        match op {
            ChainOp::Dot(member) => {
                let base_item = self.c.locals[tmp as usize].item_id;
                if base_item >= 0 {
                    let found = self
                        .c
                        .item_fields(base_item)
                        .iter()
                        .position(|(n, _)| n == member)
                        .map(|i| (i, self.c.item_fields(base_item)[i].1));
                    if let Some((idx, field_ty)) = found {
                        let dest = self.c.define_local("", field_ty, -1);
                        self.c.asm.emit(OpCode::StructGet, line, dest, tmp, idx as i32);
                        return dest;
                    }
                }
                let keyreg = self.c.emit_const(Value::string(member.clone()), line);
                let dest = self.c.define_local("", TypeKind::Unknown, -1);
                if self.c.locals[tmp as usize].ty == TypeKind::List {
                    self.c.asm.emit(OpCode::ListGet, line, dest, tmp, keyreg);
                } else {
                    self.c.asm.emit(OpCode::Index, line, dest, tmp, keyreg);
                }
                dest
            }
            ChainOp::Index(keyreg) => {
                let dest = self.c.define_local("", TypeKind::Unknown, -1);
                if self.c.locals[tmp as usize].ty == TypeKind::List {
                    self.c.asm.emit(OpCode::ListGet, line, dest, tmp, *keyreg);
                } else {
                    self.c.asm.emit(OpCode::Index, line, dest, tmp, *keyreg);
                }
                dest
            }
        }
    }

    // ── Expressions ──────────────────────────────────────────────────

    /// Pratt-style precedence: `* /` over `+ -` over `< > ==`.
    fn expr(&mut self, min_prec: i32) -> ExprResult {
        let mut left = self.atom();
        loop {
            let (prec, opcode) = match self.curr() {
                Token::Star => (3, OpCode::Mul),
                Token::Slash => (3, OpCode::Div),
                Token::Plus => (2, OpCode::Add),
                Token::Minus => (2, OpCode::Sub),
                Token::Less => (1, OpCode::Lt),
                Token::Greater => (1, OpCode::Gt),
                Token::EqEq => (1, OpCode::Eq),
                _ => break,
            };
            if prec < min_prec {
                break;
            }
            let line = self.line();
            self.advance();
            let right = self.expr(prec + 1);
            left = self.combine(left, right, opcode, line);
        }
        left
    }

    /// Applies a binary operator, folding constant-constant pairs at parse
    /// time when both operands are numeric (Q32.32 arithmetic; division by
    /// zero falls back to runtime), boolean, or string (equality only).
    fn combine(
        &mut self,
        left: ExprResult,
        right: ExprResult,
        opcode: OpCode,
        line: i32,
    ) -> ExprResult {
        if let (ExprResult::Const(lv, _), ExprResult::Const(rv, _)) = (&left, &right) {
            let (lv, rv) = (*lv, *rv);
            let arith = matches!(opcode, OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div);
            if arith && lv.is_num() && rv.is_num() {
                let (q1, q2) = (lv.as_scaled(), rv.as_scaled());
                let folded = match opcode {
                    OpCode::Add => Some(q1.wrapping_add(q2)),
                    OpCode::Sub => Some(q1.wrapping_sub(q2)),
                    OpCode::Mul => Some(q_mul(q1, q2)),
                    OpCode::Div => q_div(q1, q2),
                    _ => None,
                };
                if let Some(q) = folded {
                    return ExprResult::Const(Value::scaled(q), TypeKind::Number);
                }
            }
            if matches!(opcode, OpCode::Lt | OpCode::Gt | OpCode::Eq) {
                if lv.is_num() && rv.is_num() {
                    let (q1, q2) = (lv.as_scaled(), rv.as_scaled());
                    let b = match opcode {
                        OpCode::Lt => q1 < q2,
                        OpCode::Gt => q1 > q2,
                        _ => q1 == q2,
                    };
                    return ExprResult::Const(Value::boolean(b), TypeKind::Bool);
                }
                if opcode == OpCode::Eq && lv.is_bool() && rv.is_bool() {
                    return ExprResult::Const(
                        Value::boolean(lv.as_bool() == rv.as_bool()),
                        TypeKind::Bool,
                    );
                }
                if opcode == OpCode::Eq && lv.is_obj() && rv.is_obj() {
                    // SAFETY: constant operands own live references until
                    // released below.
                    let eq = match unsafe { (lv.as_obj(), rv.as_obj()) } {
                        (Obj::Str(a), Obj::Str(b)) => Some(a == b),
                        _ => None,
                    };
                    if let Some(b) = eq {
                        release(lv);
                        release(rv);
                        return ExprResult::Const(Value::boolean(b), TypeKind::Bool);
                    }
                }
            }
        }

        let left_reg = left.materialize(self.c, line);
        let right_reg = right.materialize(self.c, line);
        let result_ty = match opcode {
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => TypeKind::Number,
            _ => TypeKind::Bool,
        };
        let dest = self.c.define_local("", result_ty, -1);
        self.c.asm.emit(opcode, line, dest, left_reg, right_reg);
        ExprResult::reg(dest, result_ty)
    }

    fn atom(&mut self) -> ExprResult {
        let line = self.line();

        if let Token::Bad(lexeme) = self.curr().clone() {
            self.diag(format!("Unknown token: '{lexeme}'"));
            self.advance();
            let r = self.c.emit_const(Value::nil(), line);
            return ExprResult::reg(r, TypeKind::Unknown);
        }

        match self.curr().clone() {
            Token::Number(q) => {
                self.advance();
                ExprResult::Const(Value::scaled(q), TypeKind::Number)
            }
            Token::Str(s) => {
                self.advance();
                ExprResult::Const(Value::string(s), TypeKind::String)
            }
            Token::Bool(b) => {
                self.advance();
                ExprResult::Const(Value::boolean(b), TypeKind::Bool)
            }
            Token::Nil => {
                self.advance();
                ExprResult::Const(Value::nil(), TypeKind::Unknown)
            }
            Token::LBracket => {
                self.advance();
                let dest = self.c.define_local("", TypeKind::List, -1);
                self.c.asm.emit(OpCode::ListNew, line, dest, 0, 0);
                if self.curr() != &Token::RBracket {
                    loop {
                        let p = self.expr(0);
                        let preg = p.materialize(self.c, line);
                        self.c.asm.emit(OpCode::ListPush, line, dest, preg, 0);
                        if self.curr() == &Token::Comma {
                            self.advance();
                            continue;
                        }
                        break;
                    }
                }
                if self.curr() == &Token::RBracket {
                    self.advance();
                } else {
                    self.consume(&Token::RBracket, "Expected ']'");
                }
                ExprResult::reg(dest, TypeKind::List)
            }
            Token::Ident(name) => {
                self.advance();
                if self.curr() == &Token::LParen {
                    self.call(&name, line)
                } else {
                    self.variable(&name, line)
                }
            }
            Token::LParen => {
                self.advance();
                let p = self.expr(0);
                self.consume(&Token::RParen, "Expected ')'");
                p
            }
            _ => {
                self.diag("Invalid expression");
                let r = self.c.emit_const(Value::nil(), line);
                if self.curr() != &Token::Eof {
                    self.advance();
                }
                ExprResult::reg(r, TypeKind::Unknown)
            }
        }
    }

    /// Call expression: arguments compile first and their static types
    /// drive overload resolution.
    fn call(&mut self, name: &str, line: i32) -> ExprResult {
        self.advance(); // '('
        let mut arg_exprs: Vec<ExprResult> = Vec::new();
        if self.curr() != &Token::RParen {
            loop {
                arg_exprs.push(self.expr(0));
                if self.curr() == &Token::Comma {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.consume(&Token::RParen, "Expected ')'");

        let mut arg_regs: Vec<i32> = Vec::new();
        let mut arg_types: Vec<TypeKind> = Vec::new();
        for er in arg_exprs {
            arg_types.push(er.ty());
            arg_regs.push(er.materialize(self.c, line));
        }

        let Some(fs) = self.c.resolve_function(name, &arg_types) else {
            let mut hint = format!("Unknown function or invalid overload: {name}");
            if let Some(overloads) = self.c.function_table.get(name) {
                hint.push_str(". Available overloads: ");
                for (i, ofs) in overloads.iter().enumerate() {
                    if i > 0 {
                        hint.push_str(" | ");
                    }
                    hint.push_str(&ofs.name);
                    hint.push('(');
                    for (j, p) in ofs.param_types.iter().enumerate() {
                        if j > 0 {
                            hint.push_str(", ");
                        }
                        hint.push_str(p.name());
                    }
                    hint.push(')');
                }
            }
            self.diag(hint);
            let r = self.c.emit_const(Value::nil(), line);
            return ExprResult::reg(r, TypeKind::Unknown);
        };

        // Item constructor: materialize the struct in place.
        if fs.user_return_type_id >= 0 && fs.label_id < 0 && !fs.is_builtin {
            let item_id = fs.user_return_type_id;
            let field_count = self.c.item_fields(item_id).len();
            let dest = self.c.define_local("", TypeKind::Item, item_id);
            self.c.asm.emit(OpCode::StructNew, line, dest, item_id, field_count as i32);
            for (i, &arg) in arg_regs.iter().enumerate().take(field_count) {
                self.c.asm.emit(OpCode::StructSet, line, dest, i as i32, arg);
            }
            return ExprResult::Reg { reg: dest, ty: TypeKind::Item, item_id };
        }

        if fs.is_builtin {
            let bid = crate::builtins::lookup_signature(&fs.name, &fs.param_types);
            let func = Value::obj(Obj::Function(FunctionRef {
                builtin_id: bid,
                return_type: fs.return_type,
                param_types: fs.param_types.clone(),
                name: fs.name.clone(),
            }));
            let func_reg = self.c.emit_const(func, line);
            let dest = self.c.define_local("", fs.return_type, -1);
            self.emit_arg_moves(&fs, &arg_regs, line);
            self.c.asm.emit_call_obj(line, dest, func_reg, arg_regs.len() as i32);
            return ExprResult::reg(dest, fs.return_type);
        }

        // User function: argument slots sit right after the destination.
        let dest = self.c.define_local("", fs.return_type, fs.user_return_type_id);
        self.emit_arg_moves(&fs, &arg_regs, line);
        self.c.asm.emit_call(line, dest, fs.label_id as usize, arg_regs.len() as i32);
        ExprResult::Reg { reg: dest, ty: fs.return_type, item_id: fs.user_return_type_id }
    }

    /// Copies argument registers into the contiguous slots the call
    /// convention expects, immediately after the destination slot.
    fn emit_arg_moves(&mut self, fs: &FunctionSig, arg_regs: &[i32], line: i32) {
        let mut slots = Vec::with_capacity(arg_regs.len());
        for i in 0..arg_regs.len() {
            let pk = fs.param_types.get(i).copied().unwrap_or(TypeKind::Unknown);
            slots.push(self.c.define_local("", pk, -1));
        }
        for (slot, &arg) in slots.iter().zip(arg_regs) {
            self.c.asm.emit(OpCode::Move, line, *slot, arg, 0);
        }
    }

    /// Variable reference followed by an optional read-mode access chain.
    fn variable(&mut self, name: &str, line: i32) -> ExprResult {
        let loc = self.c.resolve_local(name);
        if loc == -1 {
            self.diag(format!("Undefined variable: {name}"));
            let r = self.c.emit_const(Value::nil(), line);
            self.skip_chain_after_error(line);
            return ExprResult::reg(r, TypeKind::Unknown);
        }

        let base = &self.c.locals[loc as usize];
        let (base_ty, base_item) = (base.ty, base.item_id);
        let mut tmp = self.c.define_local("", base_ty, base_item);
        self.c.asm.emit(OpCode::Move, line, tmp, loc, 0);

        loop {
            match self.curr() {
                Token::Dot => {
                    self.advance();
                    match self.curr().clone() {
                        Token::Ident(member) => {
                            self.advance();
                            tmp = self.chain_read_step(tmp, &ChainOp::Dot(member), line);
                        }
                        Token::Number(q) => {
                            // `.N` sugar for a 1-based numeric index.
                            self.advance();
                            let idx = (q >> INTSCALED_SHIFT) - 1;
                            let idxreg = self.c.emit_const(Value::int(idx), line);
                            tmp = self.chain_read_step(tmp, &ChainOp::Index(idxreg), line);
                        }
                        _ => {
                            self.diag("Unexpected token after '.'");
                            break;
                        }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let p = self.expr(0);
                    let preg = p.materialize(self.c, line);
                    self.consume(&Token::RBracket, "Expected ']'");
                    let negone = self.c.emit_const(Value::int(-1), line);
                    self.c.asm.emit(OpCode::Add, line, preg, preg, negone);
                    tmp = self.chain_read_step(tmp, &ChainOp::Index(preg), line);
                }
                _ => break,
            }
        }

        let result = &self.c.locals[tmp as usize];
        ExprResult::Reg { reg: tmp, ty: result.ty, item_id: result.item_id }
    }

    /// After an undefined-variable diagnostic, swallow the rest of the
    /// access chain (including call-shaped pieces) so one mistake does not
    /// cascade.
    fn skip_chain_after_error(&mut self, line: i32) {
        while matches!(self.curr(), Token::Dot | Token::LBracket) {
            if self.curr() == &Token::Dot {
                self.advance();
                match self.curr().clone() {
                    Token::Ident(_) => {
                        self.advance();
                        if self.curr() == &Token::LParen {
                            self.advance();
                            let mut safety = 0;
                            while self.curr() != &Token::RParen
                                && self.curr() != &Token::Eof
                                && safety < 2000
                            {
                                safety += 1;
                                let ignored = self.expr(0);
                                ignored.materialize(self.c, line);
                                if self.curr() == &Token::Comma {
                                    self.advance();
                                    continue;
                                }
                                break;
                            }
                            if self.curr() == &Token::RParen {
                                self.advance();
                            }
                        }
                    }
                    Token::Number(_) => self.advance(),
                    _ => break,
                }
            } else {
                self.advance();
                let mut safety = 0;
                while self.curr() != &Token::RBracket
                    && self.curr() != &Token::Eof
                    && safety < 2000
                {
                    safety += 1;
                    let ignored = self.expr(0);
                    ignored.materialize(self.c, line);
                    if self.curr() == &Token::Comma {
                        self.advance();
                        continue;
                    }
                    break;
                }
                if self.curr() == &Token::RBracket {
                    self.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::std_lib::register_default_builtins;

    fn compile(src: &str) -> Result<Compiler, CompileError> {
        register_default_builtins();
        let sm = SourceManager::new(src, "");
        let mut c = Compiler::new();
        compile_unit(&mut c, &sm).map(|_| c)
    }

    fn compile_ok(src: &str) -> Compiler {
        compile(src).expect("expected successful compile")
    }

    #[test]
    fn minimal_unit_compiles() {
        let c = compile_ok(r#"unit u { on void main() print("hi") end }"#);
        assert!(!c.asm.code.is_empty());
        assert_eq!(c.asm.code[0].op, OpCode::Jmp);
    }

    #[test]
    fn branch_targets_are_bound_after_compile() {
        let c = compile_ok(
            r#"unit u {
                on number f(a:number, b:number) return a + b end
                on void main()
                    var i = 0
                    while (i < 3)
                        if (i == 1) print("one") else print("other") end
                        i = i + 1
                    end
                    print(f(2, 3))
                end
            }"#,
        );
        let len = c.asm.code.len() as i32;
        for ins in &c.asm.code {
            if matches!(ins.op, OpCode::Jmp | OpCode::JmpFalse | OpCode::Call) {
                assert!(ins.b >= 0 && ins.b < len, "unbound branch {:?}", ins);
            }
        }
    }

    #[test]
    fn empty_unit_misses_main() {
        let err = compile("unit u { }").unwrap_err();
        assert!(err.message.contains("main"), "got: {}", err.message);
    }

    #[test]
    fn missing_unit_keyword() {
        let err = compile("on void main() end").unwrap_err();
        assert!(err.message.contains("unit"), "got: {}", err.message);
    }

    #[test]
    fn bad_token_is_reported_and_skipped() {
        let err = compile("unit u { on void main() var x = $ end }").unwrap_err();
        assert!(err.message.contains('$'), "got: {}", err.message);
    }

    #[test]
    fn undefined_variable_diagnostic() {
        register_default_builtins();
        let sm = SourceManager::new("unit u { on void main() print(zzz) end }", "");
        let mut c = Compiler::new();
        assert!(compile_unit(&mut c, &sm).is_err());
        assert!(c
            .diagnostics
            .iter()
            .any(|d| d.message.contains("Undefined variable: zzz")));
    }

    #[test]
    fn diagnostics_carry_function_and_location() {
        register_default_builtins();
        let sm = SourceManager::new("unit u {\non void main()\nprint(zzz)\nend }", "");
        let mut c = Compiler::new();
        let _ = compile_unit(&mut c, &sm);
        let d = c
            .diagnostics
            .iter()
            .find(|d| d.message.contains("zzz"))
            .expect("diagnostic present");
        assert_eq!(d.function, "main");
        assert_eq!(d.location.line, 3);
    }

    #[test]
    fn mutual_recursion_resolves_through_prescan() {
        let c = compile_ok(
            r#"unit u {
                on bool even(n:number)
                    if (n == 0) return true end
                    return odd(n - 1)
                end
                on bool odd(n:number)
                    if (n == 0) return false end
                    return even(n - 1)
                end
                on void main() print(even(6)) end
            }"#,
        );
        assert!(c.diagnostics.is_empty());
    }

    #[test]
    fn parse_time_fold_of_numeric_constants() {
        let c = compile_ok("unit u { on void main() var x = 2 + 3 end }");
        assert!(c.asm.constants.iter().any(|v| *v == Value::int(5)));
        assert!(!c.asm.constants.iter().any(|v| *v == Value::int(2)));
    }

    #[test]
    fn string_equality_folds_at_parse_time() {
        let c = compile_ok(r#"unit u { on void main() var b = "a" == "a" end }"#);
        assert!(!c.asm.code.iter().any(|i| i.op == OpCode::Eq));
        assert!(c.asm.constants.iter().any(|v| *v == Value::boolean(true)));
    }

    #[test]
    fn division_by_zero_defers_to_runtime() {
        let c = compile_ok("unit u { on void main() var x = 10 / 0 end }");
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::Div));
    }

    #[test]
    fn item_constructor_emits_struct_new_and_sets() {
        let c = compile_ok(
            "unit u { item P(number x, number y) on void main() var p = P(3, 4) end }",
        );
        let new_idx = c.asm.code.iter().position(|i| i.op == OpCode::StructNew).unwrap();
        assert_eq!(c.asm.code[new_idx].c, 2);
        let sets = c.asm.code.iter().filter(|i| i.op == OpCode::StructSet).count();
        assert_eq!(sets, 2);
    }

    #[test]
    fn member_read_uses_struct_get() {
        let c = compile_ok(
            "unit u { item P(number x, number y) on void main() var p = P(3, 4) var s = p.x end }",
        );
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::StructGet));
    }

    #[test]
    fn member_write_uses_struct_set() {
        let c = compile_ok(
            "unit u { item P(number x, number y) on void main() var p = P(3, 4) p.x = 9 end }",
        );
        // Two sets from the constructor plus one from the assignment.
        let sets = c.asm.code.iter().filter(|i| i.op == OpCode::StructSet).count();
        assert_eq!(sets, 3);
    }

    #[test]
    fn child_item_sees_parent_fields() {
        let c = compile_ok(
            "unit u { item A(number x) item B : A(number y) on void main() var b = B(1, 2) var s = b.x end }",
        );
        assert!(c.diagnostics.is_empty());
        let id = c.find_item_id_by_name("B");
        assert_eq!(c.item_fields(id).len(), 2);
    }

    #[test]
    fn parent_after_child_is_an_error() {
        let err =
            compile("unit u { item B : A(number y) item A(number x) on void main() end }")
                .unwrap_err();
        assert!(err.message.contains("declared before"), "got: {}", err.message);
    }

    #[test]
    fn item_return_type_resolves_before_declaration() {
        // `make` is declared before `item P`, so its return type leans on
        // the prescan's name reservation; construction itself happens
        // after the declaration.
        let c = compile_ok(
            r#"unit u {
                on P make() return mk() end
                item P(number x, number y)
                on P mk() return P(1, 2) end
                on void main() var p = make() end
            }"#,
        );
        assert!(c.diagnostics.is_empty());
    }

    #[test]
    fn indexed_read_adjusts_to_zero_based() {
        let c = compile_ok("unit u { on void main() var a = [1, 2, 3] var x = a[2] end }");
        assert!(c.asm.constants.iter().any(|v| *v == Value::int(-1)));
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::ListGet));
    }

    #[test]
    fn indexed_write_on_list_uses_list_set() {
        let c = compile_ok("unit u { on void main() var a = [1, 2, 3] a[2] = 9 end }");
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::ListSet));
    }

    #[test]
    fn list_literal_pushes_each_element() {
        let c = compile_ok("unit u { on void main() var a = [4, 5, 6] end }");
        let pushes = c.asm.code.iter().filter(|i| i.op == OpCode::ListPush).count();
        assert_eq!(pushes, 3);
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::ListNew));
    }

    #[test]
    fn builtin_call_emits_call_obj_with_function_constant() {
        let c = compile_ok(r#"unit u { on void main() print("x") end }"#);
        assert!(c.asm.code.iter().any(|i| i.op == OpCode::CallObj));
        let has_fn = c.asm.constants.iter().any(|v| {
            // SAFETY: pool entries hold live references.
            v.is_obj() && matches!(unsafe { v.as_obj() }, Obj::Function(f) if f.builtin_id >= 0)
        });
        assert!(has_fn);
    }

    #[test]
    fn user_call_copies_args_after_dest() {
        let c = compile_ok(
            r#"unit u {
                on number f(a:number, b:number) return a + b end
                on void main() var s = f(2, 3) end
            }"#,
        );
        let call = c.asm.code.iter().find(|i| i.op == OpCode::Call && i.c == 2).unwrap();
        assert_eq!(call.c, 2);
    }

    #[test]
    fn unknown_function_lists_overloads() {
        register_default_builtins();
        let sm =
            SourceManager::new(r#"unit u { on void main() var x = nosuch(1) end }"#, "");
        let mut c = Compiler::new();
        let _ = compile_unit(&mut c, &sm);
        assert!(c
            .diagnostics
            .iter()
            .any(|d| d.message.contains("Unknown function or invalid overload: nosuch")));
    }

    #[test]
    fn return_without_value_yields_nil() {
        let c = compile_ok("unit u { on void main() return end }");
        assert!(c.asm.code.iter().filter(|i| i.op == OpCode::Return).count() >= 2);
    }

    #[test]
    fn incompatible_assignment_reports() {
        register_default_builtins();
        let sm = SourceManager::new(
            r#"unit u { on void main() var x = 1 x = "s" end }"#,
            "",
        );
        let mut c = Compiler::new();
        let _ = compile_unit(&mut c, &sm);
        assert!(c
            .diagnostics
            .iter()
            .any(|d| d.message.contains("incompatible type")));
    }

    #[test]
    fn else_if_chains() {
        let c = compile_ok(
            r#"unit u {
                on void main()
                    var x = 2
                    if (x == 1) print("one")
                    else if (x == 2) print("two")
                    else print("many") end
                end
            }"#,
        );
        assert!(c.diagnostics.is_empty());
    }
}
