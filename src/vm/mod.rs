use crate::assembler::{Assembler, Instr, OpCode};
use crate::builtins;
use crate::value::{q_div, q_mul, release, retain, Obj, Value, INTSCALED_SHIFT};

/// Each function sees a fixed-stride window of this many registers;
/// a call places the next frame one stride up.
const FRAME_SIZE: usize = 256;

struct CallFrame {
    return_addr: usize,
    base_reg: usize,
    ret_slot: usize,
}

/// Register virtual machine. Borrows the program; owns the register file.
/// Every slot write follows retain-new / release-old, so teardown releases
/// exactly the references the run acquired.
pub struct Vm<'a> {
    code: &'a [Instr],
    constants: &'a [Value],
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
}

impl<'a> Drop for Vm<'a> {
    fn drop(&mut self) {
        for v in &self.stack {
            release(*v);
        }
    }
}

impl<'a> Vm<'a> {
    pub fn new(asm: &'a Assembler) -> Vm<'a> {
        Vm {
            code: &asm.code,
            constants: &asm.constants,
            stack: vec![Value::nil(); 4096],
            frames: Vec::new(),
        }
    }

    fn ensure_capacity(&mut self, n: usize) {
        if self.stack.len() < n {
            self.stack.resize(n, Value::nil());
        }
    }

    /// Shared-ownership write: the slot takes its own reference.
    /// Retain-before-release keeps self-assignment safe.
    fn set_slot(&mut self, idx: usize, v: Value) {
        retain(v);
        release(self.stack[idx]);
        self.stack[idx] = v;
    }

    /// Ownership-transfer write for freshly created values (new containers,
    /// builtin results): the slot adopts the caller's reference.
    fn set_slot_owned(&mut self, idx: usize, v: Value) {
        release(self.stack[idx]);
        self.stack[idx] = v;
    }

    pub fn run(&mut self) {
        self.frames.push(CallFrame { return_addr: usize::MAX, base_reg: 0, ret_slot: 0 });
        self.ensure_capacity(FRAME_SIZE);
        let mut ip = 0usize;

        while ip < self.code.len() {
            let ins = self.code[ip];
            let base = self.frames.last().map(|f| f.base_reg).unwrap_or(0);

            match ins.op {
                OpCode::Const => {
                    let dst = base + ins.a as usize;
                    self.set_slot(dst, self.constants[ins.b as usize]);
                }
                OpCode::Move => {
                    let dst = base + ins.a as usize;
                    let v = self.stack[base + ins.b as usize];
                    self.set_slot(dst, v);
                }

                OpCode::Add | OpCode::Sub | OpCode::Mul => {
                    let dst = base + ins.a as usize;
                    let fa = self.stack[base + ins.b as usize].as_scaled();
                    let fb = self.stack[base + ins.c as usize].as_scaled();
                    let q = match ins.op {
                        OpCode::Add => fa.wrapping_add(fb),
                        OpCode::Sub => fa.wrapping_sub(fb),
                        _ => q_mul(fa, fb),
                    };
                    self.set_slot(dst, Value::scaled(q));
                }
                OpCode::Div => {
                    let dst = base + ins.a as usize;
                    let fa = self.stack[base + ins.b as usize].as_scaled();
                    let fb = self.stack[base + ins.c as usize].as_scaled();
                    match q_div(fa, fb) {
                        Some(q) => self.set_slot(dst, Value::scaled(q)),
                        None => self.set_slot(dst, Value::nil()),
                    }
                }

                OpCode::Lt | OpCode::Gt => {
                    let dst = base + ins.a as usize;
                    let fa = self.stack[base + ins.b as usize].as_scaled();
                    let fb = self.stack[base + ins.c as usize].as_scaled();
                    let b = if ins.op == OpCode::Lt { fa < fb } else { fa > fb };
                    self.set_slot(dst, Value::boolean(b));
                }
                OpCode::Eq => {
                    let dst = base + ins.a as usize;
                    let eq = self.stack[base + ins.b as usize].raw
                        == self.stack[base + ins.c as usize].raw;
                    self.set_slot(dst, Value::boolean(eq));
                }

                OpCode::Jmp => {
                    ip = ins.b as usize;
                    continue;
                }
                OpCode::JmpFalse => {
                    let v = self.stack[base + ins.a as usize];
                    let cond_false = if v.is_bool() { !v.as_bool() } else { v.is_nil() };
                    if cond_false {
                        ip = ins.b as usize;
                        continue;
                    }
                }

                OpCode::Call => {
                    let dest_rel = ins.a as usize;
                    let argc = ins.c as usize;
                    let dest_abs = base + dest_rel;
                    let new_base = base + FRAME_SIZE;
                    self.ensure_capacity(new_base + FRAME_SIZE);
                    for i in 0..argc {
                        let v = self.stack[base + dest_rel + 1 + i];
                        self.set_slot(new_base + i, v);
                    }
                    self.frames.push(CallFrame {
                        return_addr: ip + 1,
                        base_reg: new_base,
                        ret_slot: dest_abs,
                    });
                    ip = ins.b as usize;
                    continue;
                }

                OpCode::CallObj => {
                    let dest_abs = base + ins.a as usize;
                    let argc = ins.c as usize;
                    let fv = self.stack[base + ins.b as usize];

                    let builtin_id = if fv.is_obj() {
                        // SAFETY: register slots hold live references.
                        match unsafe { fv.as_obj() } {
                            Obj::Function(f) => Some(f.builtin_id),
                            _ => None,
                        }
                    } else {
                        None
                    };

                    match builtin_id.filter(|id| *id >= 0).and_then(builtins::entry) {
                        Some(entry) => {
                            let arg0 = dest_abs + 1;
                            let end = (arg0 + argc).min(self.stack.len());
                            let result = (entry.func)(&self.stack[arg0..end]);
                            self.set_slot_owned(dest_abs, result);
                        }
                        // A non-function target, a user-function reference,
                        // or a missing descriptor all write nil.
                        None => self.set_slot(dest_abs, Value::nil()),
                    }
                }

                OpCode::Return => {
                    let retv = self.stack[base + ins.a as usize];
                    let frame = self.frames.pop().expect("return without frame");
                    if self.frames.is_empty() {
                        return;
                    }
                    self.set_slot(frame.ret_slot, retv);
                    ip = frame.return_addr;
                    continue;
                }

                OpCode::TableNew => {
                    let dst = base + ins.a as usize;
                    self.set_slot_owned(dst, Value::obj(Obj::Table(Vec::new())));
                }
                OpCode::TableSet => {
                    let tbl_idx = base + ins.a as usize;
                    let key = self.stack[base + ins.b as usize];
                    let val = self.stack[base + ins.c as usize];
                    let mut tblv = self.stack[tbl_idx];
                    if tblv.type_of() != crate::value::TypeKind::Table {
                        self.set_slot_owned(tbl_idx, Value::obj(Obj::Table(Vec::new())));
                        tblv = self.stack[tbl_idx];
                    }
                    // SAFETY: tblv is a live table and no other borrow of it
                    // is held; the VM is single-threaded.
                    let entries = match unsafe { tblv.as_obj_mut() } {
                        Obj::Table(entries) => entries,
                        _ => unreachable!(),
                    };
                    match entries.iter_mut().find(|(k, _)| k.raw == key.raw) {
                        Some((_, slot)) => {
                            retain(val);
                            release(*slot);
                            *slot = val;
                        }
                        None => {
                            retain(key);
                            retain(val);
                            entries.push((key, val));
                        }
                    }
                }
                OpCode::Index => {
                    let dst = base + ins.a as usize;
                    let tblv = self.stack[base + ins.b as usize];
                    let key = self.stack[base + ins.c as usize];
                    let mut result = Value::nil();
                    if tblv.is_obj() {
                        // SAFETY: live reference in a register slot.
                        if let Obj::Table(entries) = unsafe { tblv.as_obj() } {
                            if let Some((_, v)) = entries.iter().find(|(k, _)| k.raw == key.raw) {
                                result = *v;
                            }
                        }
                    }
                    self.set_slot(dst, result);
                }

                OpCode::ListNew => {
                    let dst = base + ins.a as usize;
                    self.set_slot_owned(dst, Value::obj(Obj::List(Vec::new())));
                }
                OpCode::ListPush => {
                    let lv = self.stack[base + ins.a as usize];
                    let v = self.stack[base + ins.b as usize];
                    if lv.is_obj() {
                        // SAFETY: as for TableSet.
                        if let Obj::List(elems) = unsafe { lv.as_obj_mut() } {
                            retain(v);
                            elems.push(v);
                        }
                    }
                }
                OpCode::ListGet => {
                    let dst = base + ins.a as usize;
                    let lv = self.stack[base + ins.b as usize];
                    let idx = self.stack[base + ins.c as usize].as_scaled() >> INTSCALED_SHIFT;
                    let mut result = Value::nil();
                    if lv.is_obj() {
                        // SAFETY: live reference in a register slot.
                        if let Obj::List(elems) = unsafe { lv.as_obj() } {
                            if idx >= 0 && (idx as usize) < elems.len() {
                                result = elems[idx as usize];
                            }
                        }
                    }
                    self.set_slot(dst, result);
                }
                OpCode::ListSet => {
                    let lv = self.stack[base + ins.a as usize];
                    let idx = self.stack[base + ins.b as usize].as_scaled() >> INTSCALED_SHIFT;
                    let v = self.stack[base + ins.c as usize];
                    if lv.is_obj() {
                        // SAFETY: as for TableSet. Out-of-range writes are
                        // silently ignored.
                        if let Obj::List(elems) = unsafe { lv.as_obj_mut() } {
                            if idx >= 0 && (idx as usize) < elems.len() {
                                retain(v);
                                release(elems[idx as usize]);
                                elems[idx as usize] = v;
                            }
                        }
                    }
                }
                OpCode::ListLen => {
                    let dst = base + ins.a as usize;
                    let lv = self.stack[base + ins.b as usize];
                    let mut result = Value::nil();
                    if lv.is_obj() {
                        // SAFETY: live reference in a register slot.
                        if let Obj::List(elems) = unsafe { lv.as_obj() } {
                            result = Value::int(elems.len() as i64);
                        }
                    }
                    self.set_slot(dst, result);
                }

                OpCode::StructNew => {
                    let dst = base + ins.a as usize;
                    let type_id = ins.b;
                    let n = ins.c.max(0) as usize;
                    let fields = vec![Value::nil(); n];
                    self.set_slot_owned(dst, Value::obj(Obj::Struct { type_id, fields }));
                }
                OpCode::StructSet => {
                    let sv = self.stack[base + ins.a as usize];
                    let idx = ins.b;
                    let v = self.stack[base + ins.c as usize];
                    if sv.is_obj() {
                        // SAFETY: as for TableSet.
                        if let Obj::Struct { fields, .. } = unsafe { sv.as_obj_mut() } {
                            if idx >= 0 && (idx as usize) < fields.len() {
                                retain(v);
                                release(fields[idx as usize]);
                                fields[idx as usize] = v;
                            }
                        }
                    }
                }
                OpCode::StructGet => {
                    let dst = base + ins.a as usize;
                    let sv = self.stack[base + ins.b as usize];
                    let idx = ins.c;
                    let mut result = Value::nil();
                    if sv.is_obj() {
                        // SAFETY: live reference in a register slot.
                        if let Obj::Struct { fields, .. } = unsafe { sv.as_obj() } {
                            if idx >= 0 && (idx as usize) < fields.len() {
                                result = fields[idx as usize];
                            }
                        }
                    }
                    self.set_slot(dst, result);
                }
            }

            ip += 1;
        }
    }
}
