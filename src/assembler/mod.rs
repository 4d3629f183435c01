use crate::value::{q_div, q_mul, release, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Const = 0,
    Move,
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Eq,
    Jmp,
    JmpFalse,
    Call,
    CallObj,
    Return,
    TableSet,
    TableNew,
    Index,
    StructNew,
    StructSet,
    StructGet,
    ListNew,
    ListPush,
    ListGet,
    ListSet,
    ListLen,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Const => "OP_CONST",
            OpCode::Move => "OP_MOVE",
            OpCode::Add => "OP_ADD",
            OpCode::Sub => "OP_SUB",
            OpCode::Mul => "OP_MUL",
            OpCode::Div => "OP_DIV",
            OpCode::Lt => "OP_LT",
            OpCode::Gt => "OP_GT",
            OpCode::Eq => "OP_EQ",
            OpCode::Jmp => "OP_JMP",
            OpCode::JmpFalse => "OP_JMP_FALSE",
            OpCode::Call => "OP_CALL",
            OpCode::CallObj => "OP_CALL_OBJ",
            OpCode::Return => "OP_RETURN",
            OpCode::TableSet => "OP_TABLE_SET",
            OpCode::TableNew => "OP_TABLE_NEW",
            OpCode::Index => "OP_INDEX",
            OpCode::StructNew => "OP_STRUCT_NEW",
            OpCode::StructSet => "OP_STRUCT_SET",
            OpCode::StructGet => "OP_STRUCT_GET",
            OpCode::ListNew => "OP_LIST_NEW",
            OpCode::ListPush => "OP_LIST_PUSH",
            OpCode::ListGet => "OP_LIST_GET",
            OpCode::ListSet => "OP_LIST_SET",
            OpCode::ListLen => "OP_LIST_LEN",
        }
    }

    pub fn from_u8(b: u8) -> Option<OpCode> {
        Some(match b {
            0 => OpCode::Const,
            1 => OpCode::Move,
            2 => OpCode::Add,
            3 => OpCode::Sub,
            4 => OpCode::Mul,
            5 => OpCode::Div,
            6 => OpCode::Lt,
            7 => OpCode::Gt,
            8 => OpCode::Eq,
            9 => OpCode::Jmp,
            10 => OpCode::JmpFalse,
            11 => OpCode::Call,
            12 => OpCode::CallObj,
            13 => OpCode::Return,
            14 => OpCode::TableSet,
            15 => OpCode::TableNew,
            16 => OpCode::Index,
            17 => OpCode::StructNew,
            18 => OpCode::StructSet,
            19 => OpCode::StructGet,
            20 => OpCode::ListNew,
            21 => OpCode::ListPush,
            22 => OpCode::ListGet,
            23 => OpCode::ListSet,
            24 => OpCode::ListLen,
            _ => return None,
        })
    }

    /// Ops whose `b` operand is a branch target (absolute pc once bound).
    fn is_branch(self) -> bool {
        matches!(self, OpCode::Jmp | OpCode::JmpFalse | OpCode::Call)
    }
}

/// Fixed-size instruction record. Operand meaning is opcode-specific:
/// relative registers, constant indices, branch targets, field indices,
/// or argument counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: OpCode,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub line: i32,
}

/// Forward-declared jump target. `target_pc` stays −1 until bound; `refs`
/// holds instruction indices whose `b` is patched at bind time.
#[derive(Debug, Clone)]
pub struct Label {
    pub target_pc: i32,
    pub refs: Vec<usize>,
}

/// Owns the instruction buffer, the deduplicated constant pool, and the
/// label list. The pool holds one reference to every Obj-tagged constant,
/// released when the assembler drops.
#[derive(Default, Debug)]
pub struct Assembler {
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    pub labels: Vec<Label>,
}

impl Drop for Assembler {
    fn drop(&mut self) {
        for v in &self.constants {
            release(*v);
        }
    }
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    pub fn make_label(&mut self) -> usize {
        self.labels.push(Label { target_pc: -1, refs: Vec::new() });
        self.labels.len() - 1
    }

    /// Binds the label to the next instruction position and patches every
    /// pending reference.
    pub fn bind_label(&mut self, id: usize) {
        let target = self.code.len() as i32;
        self.labels[id].target_pc = target;
        let refs = std::mem::take(&mut self.labels[id].refs);
        for idx in refs {
            if idx < self.code.len() {
                self.code[idx].b = target;
            }
        }
    }

    pub fn emit(&mut self, op: OpCode, line: i32, a: i32, b: i32, c: i32) -> usize {
        self.code.push(Instr { op, a, b, c, line });
        self.code.len() - 1
    }

    pub fn emit_jump(&mut self, op: OpCode, line: i32, cond_reg: i32, label_id: usize) {
        let target = self.labels[label_id].target_pc;
        let idx = self.emit(op, line, cond_reg, target, 0);
        if target == -1 {
            self.labels[label_id].refs.push(idx);
        }
    }

    pub fn emit_call(&mut self, line: i32, dest_reg: i32, label_id: usize, argc: i32) -> usize {
        let target = self.labels[label_id].target_pc;
        let idx = self.emit(OpCode::Call, line, dest_reg, target, argc);
        if target == -1 {
            self.labels[label_id].refs.push(idx);
        }
        idx
    }

    pub fn emit_call_obj(&mut self, line: i32, dest_reg: i32, func_reg: i32, argc: i32) -> usize {
        self.emit(OpCode::CallObj, line, dest_reg, func_reg, argc)
    }

    /// Interns a constant, deduplicating by raw 64-bit encoding. Takes
    /// ownership of the caller's reference: on a dedupe hit the duplicate
    /// reference is released, otherwise the pool keeps it.
    pub fn add_constant(&mut self, v: Value) -> usize {
        for (i, c) in self.constants.iter().enumerate() {
            if c.raw == v.raw {
                release(v);
                return i;
            }
        }
        self.constants.push(v);
        self.constants.len() - 1
    }

    // ── Optimizer ────────────────────────────────────────────────────

    /// Runs peephole and constant-fold rounds until a fixed point or
    /// `max_iters`, compacting the instruction stream after each pass.
    pub fn optimize(&mut self, max_iters: usize) {
        for _ in 0..max_iters {
            let peephole = self.peephole_pass();
            let folded = self.fold_pass();
            if !peephole && !folded {
                break;
            }
        }
    }

    /// Positions that are the current target of any label; these are never
    /// removed by compaction.
    fn label_targets(&self) -> Vec<bool> {
        let mut protected = vec![false; self.code.len()];
        for l in &self.labels {
            if l.target_pc >= 0 && (l.target_pc as usize) < protected.len() {
                protected[l.target_pc as usize] = true;
            }
        }
        protected
    }

    /// `CONST r,k ; MOVE d,r` fuses into `CONST d,k`, and `MOVE x,x`
    /// disappears.
    fn peephole_pass(&mut self) -> bool {
        let protected = self.label_targets();
        let mut remove = vec![false; self.code.len()];
        for i in 0..self.code.len().saturating_sub(1) {
            if remove[i] || protected[i] {
                continue;
            }
            let first = self.code[i];
            let second = self.code[i + 1];
            if first.op == OpCode::Const && second.op == OpCode::Move && second.b == first.a {
                self.code[i + 1] =
                    Instr { op: OpCode::Const, a: second.a, b: first.b, c: 0, line: second.line };
                remove[i] = true;
            }
        }
        for i in 0..self.code.len() {
            let ins = self.code[i];
            if ins.op == OpCode::Move && ins.a == ins.b && !protected[i] {
                remove[i] = true;
            }
        }
        if remove.iter().any(|&r| r) {
            self.compact(&remove);
            true
        } else {
            false
        }
    }

    /// `CONST a ; CONST b ; ARITH dst,a,b` folds on the Q32.32
    /// representations; a zero divisor blocks the fold.
    fn fold_pass(&mut self) -> bool {
        let protected = self.label_targets();
        let mut remove = vec![false; self.code.len()];
        let mut changed = false;
        for i in 2..self.code.len() {
            let ins = self.code[i];
            if !matches!(ins.op, OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div) {
                continue;
            }
            let c1 = self.code[i - 2];
            let c2 = self.code[i - 1];
            if c1.op != OpCode::Const || c2.op != OpCode::Const {
                continue;
            }
            if c1.a != ins.b || c2.a != ins.c {
                continue;
            }
            if remove[i - 2] || remove[i - 1] || protected[i - 2] || protected[i - 1] {
                continue;
            }
            let v1 = self.constants[c1.b as usize];
            let v2 = self.constants[c2.b as usize];
            if !v1.is_num() || !v2.is_num() {
                continue;
            }
            let (q1, q2) = (v1.as_scaled(), v2.as_scaled());
            let folded = match ins.op {
                OpCode::Add => q1.wrapping_add(q2),
                OpCode::Sub => q1.wrapping_sub(q2),
                OpCode::Mul => q_mul(q1, q2),
                OpCode::Div => match q_div(q1, q2) {
                    Some(q) => q,
                    None => continue,
                },
                _ => unreachable!(),
            };
            let k = self.add_constant(Value::scaled(folded));
            self.code[i] =
                Instr { op: OpCode::Const, a: ins.a, b: k as i32, c: 0, line: ins.line };
            remove[i - 2] = true;
            remove[i - 1] = true;
            changed = true;
        }
        if changed {
            self.compact(&remove);
        }
        changed
    }

    /// Packs retained instructions and rewrites every label target, every
    /// pending reference, and every branch operand with the old→new index
    /// map. Targets that fell on a removed instruction become −1.
    fn compact(&mut self, remove: &[bool]) {
        let old_len = self.code.len();
        let mut map: Vec<i32> = vec![-1; old_len + 1];
        let mut new_code = Vec::with_capacity(old_len);
        for (old, ins) in self.code.drain(..).enumerate() {
            if !remove[old] {
                map[old] = new_code.len() as i32;
                new_code.push(ins);
            }
        }
        // A label bound exactly at the end of the stream stays at the end.
        map[old_len] = new_code.len() as i32;
        self.code = new_code;

        for ins in &mut self.code {
            if ins.op.is_branch() && ins.b >= 0 {
                ins.b = map.get(ins.b as usize).copied().unwrap_or(-1);
            }
        }
        for label in &mut self.labels {
            if label.target_pc >= 0 {
                label.target_pc = map.get(label.target_pc as usize).copied().unwrap_or(-1);
            }
            label.refs = label
                .refs
                .iter()
                .filter_map(|&idx| {
                    let new = *map.get(idx)?;
                    (new >= 0).then_some(new as usize)
                })
                .collect();
        }
    }
}
