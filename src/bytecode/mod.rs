use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::assembler::{Assembler, Instr, OpCode};
use crate::builtins;
use crate::builtins::std_lib::format_num;
use crate::value::{release, FunctionRef, Obj, TypeKind, Value};

// Constant tags in the container.
const FILE_TAG_NIL: u8 = 0x00;
const FILE_TAG_BOOL: u8 = 0x01;
const FILE_TAG_NUM: u8 = 0x02;
const FILE_TAG_STRING: u8 = 0x03;
const FILE_TAG_FUNC: u8 = 0x10;
const FILE_TAG_STRUCT: u8 = 0x11;
const FILE_TAG_LIST: u8 = 0x12;

const MAGIC: &[u8; 4] = b"MDOT";
const MAX_COUNT: u64 = 1 << 31;

#[derive(Debug, thiserror::Error)]
pub enum BytecodeError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("Invalid file format (Magic Header)")]
    BadMagic,
    #[error("Unknown constant tag in bytecode: {0:#04x}")]
    UnknownTag(u8),
    #[error("Unknown opcode in bytecode: {0}")]
    UnknownOpcode(u8),
    #[error("Declared count exceeds limit: {0}")]
    CountTooLarge(u64),
}

type Result<T> = std::result::Result<T, BytecodeError>;

// ── Primitive writers / readers ──────────────────────────────────────
// Everything is little-endian and written field-by-field; instruction
// records never round-trip through in-memory layout.

fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(i32::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

fn read_bytes<R: Read>(r: &mut R, len: u64) -> Result<Vec<u8>> {
    if len > MAX_COUNT {
        return Err(BytecodeError::CountTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

// ── Constants ────────────────────────────────────────────────────────

fn write_constant<W: Write>(w: &mut W, v: Value) -> Result<()> {
    if v.is_nil() {
        w.write_all(&[FILE_TAG_NIL])?;
        return Ok(());
    }
    if v.is_bool() {
        w.write_all(&[FILE_TAG_BOOL, v.as_bool() as u8])?;
        return Ok(());
    }
    if v.is_num() {
        w.write_all(&[FILE_TAG_NUM])?;
        write_i64(w, v.as_scaled())?;
        return Ok(());
    }
    // SAFETY: pool entries and their children hold live references for the
    // lifetime of the assembler being saved.
    match unsafe { v.as_obj() } {
        Obj::Str(s) => {
            w.write_all(&[FILE_TAG_STRING])?;
            write_u64(w, s.len() as u64)?;
            w.write_all(s.as_bytes())?;
        }
        Obj::Function(f) => {
            w.write_all(&[FILE_TAG_FUNC])?;
            write_i32(w, f.builtin_id)?;
            w.write_all(&[f.return_type as u8, f.param_types.len() as u8])?;
            for t in &f.param_types {
                w.write_all(&[*t as u8])?;
            }
            if f.builtin_id == -1 {
                write_u64(w, f.name.len() as u64)?;
                w.write_all(f.name.as_bytes())?;
            }
        }
        Obj::Struct { type_id, fields } => {
            w.write_all(&[FILE_TAG_STRUCT])?;
            write_i32(w, *type_id)?;
            write_u32(w, fields.len() as u32)?;
            for field in fields {
                write_constant(w, *field)?;
            }
        }
        Obj::List(elems) => {
            w.write_all(&[FILE_TAG_LIST])?;
            write_u64(w, elems.len() as u64)?;
            for e in elems {
                write_constant(w, *e)?;
            }
        }
        Obj::Table(_) => {
            // Tables never reach the pool; the compiler only interns
            // literals and function references.
            w.write_all(&[FILE_TAG_NIL])?;
        }
    }
    Ok(())
}

/// Reads one constant, returning a Value owning one reference.
fn read_constant<R: Read>(r: &mut R) -> Result<Value> {
    let tag = read_u8(r)?;
    match tag {
        FILE_TAG_NIL => Ok(Value::nil()),
        FILE_TAG_BOOL => Ok(Value::boolean(read_u8(r)? != 0)),
        FILE_TAG_NUM => Ok(Value::scaled(read_i64(r)?)),
        FILE_TAG_STRING => {
            let len = read_u64(r)?;
            let bytes = read_bytes(r, len)?;
            Ok(Value::string(String::from_utf8_lossy(&bytes).into_owned()))
        }
        FILE_TAG_FUNC => {
            let bid = read_i32(r)?;
            // Stored return type; rebinding takes types from the registry.
            read_u8(r)?;
            let argc = read_u8(r)?;
            let mut params = Vec::with_capacity(argc as usize);
            for _ in 0..argc {
                params.push(TypeKind::from_u8(read_u8(r)?));
            }
            let mut name = String::new();
            if bid == -1 {
                let len = read_u64(r)?;
                name = String::from_utf8_lossy(&read_bytes(r, len)?).into_owned();
            }
            Ok(rebind_function(bid, params, name))
        }
        FILE_TAG_STRUCT => {
            let type_id = read_i32(r)?;
            let count = read_u32(r)? as u64;
            if count > MAX_COUNT {
                return Err(BytecodeError::CountTooLarge(count));
            }
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match read_constant(r) {
                    Ok(v) => fields.push(v),
                    Err(e) => {
                        for v in fields {
                            release(v);
                        }
                        return Err(e);
                    }
                }
            }
            Ok(Value::obj(Obj::Struct { type_id, fields }))
        }
        FILE_TAG_LIST => {
            let count = read_u64(r)?;
            if count > MAX_COUNT {
                return Err(BytecodeError::CountTooLarge(count));
            }
            let mut elems = Vec::with_capacity(count.min(1 << 16) as usize);
            for _ in 0..count {
                match read_constant(r) {
                    Ok(v) => elems.push(v),
                    Err(e) => {
                        for v in elems {
                            release(v);
                        }
                        return Err(e);
                    }
                }
            }
            Ok(Value::obj(Obj::List(elems)))
        }
        other => Err(BytecodeError::UnknownTag(other)),
    }
}

/// Re-binds a stored function reference against the current registry: by
/// builtin id first, then by (name, parameter types); an unbindable
/// reference loads as nil so missing optional builtins never fail a load.
fn rebind_function(bid: i32, params: Vec<TypeKind>, name: String) -> Value {
    if bid >= 0 {
        if let Some(e) = builtins::entry(bid) {
            return Value::obj(Obj::Function(FunctionRef {
                builtin_id: bid,
                return_type: e.return_type,
                param_types: e.param_types.clone(),
                name: e.name.clone(),
            }));
        }
    }
    if !name.is_empty() {
        let id = builtins::lookup_signature(&name, &params);
        if id >= 0 {
            if let Some(e) = builtins::entry(id) {
                return Value::obj(Obj::Function(FunctionRef {
                    builtin_id: id,
                    return_type: e.return_type,
                    param_types: e.param_types.clone(),
                    name: e.name.clone(),
                }));
            }
        }
    }
    Value::nil()
}

// ── Container ────────────────────────────────────────────────────────

pub fn save_to<W: Write>(w: &mut W, asm: &Assembler) -> Result<()> {
    w.write_all(MAGIC)?;
    write_u64(w, asm.constants.len() as u64)?;
    for v in &asm.constants {
        write_constant(w, *v)?;
    }
    write_u64(w, asm.code.len() as u64)?;
    for ins in &asm.code {
        w.write_all(&[ins.op as u8])?;
        write_i32(w, ins.a)?;
        write_i32(w, ins.b)?;
        write_i32(w, ins.c)?;
        write_i32(w, ins.line)?;
    }
    Ok(())
}

pub fn load_from<R: Read>(r: &mut R) -> Result<Assembler> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(BytecodeError::BadMagic);
    }

    let mut asm = Assembler::new();

    let n_consts = read_u64(r)?;
    if n_consts > MAX_COUNT {
        return Err(BytecodeError::CountTooLarge(n_consts));
    }
    for _ in 0..n_consts {
        // Constants are appended positionally: re-running the dedupe here
        // could renumber indices out from under the loaded code.
        let v = read_constant(r)?;
        asm.constants.push(v);
    }

    let n_code = read_u64(r)?;
    if n_code > MAX_COUNT {
        return Err(BytecodeError::CountTooLarge(n_code));
    }
    for _ in 0..n_code {
        let op_byte = read_u8(r)?;
        let op = OpCode::from_u8(op_byte).ok_or(BytecodeError::UnknownOpcode(op_byte))?;
        let a = read_i32(r)?;
        let b = read_i32(r)?;
        let c = read_i32(r)?;
        let line = read_i32(r)?;
        asm.code.push(Instr { op, a, b, c, line });
    }
    Ok(asm)
}

pub fn save(path: impl AsRef<Path>, asm: &Assembler) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    save_to(&mut w, asm)?;
    w.flush()?;
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<Assembler> {
    let mut r = BufReader::new(File::open(path)?);
    load_from(&mut r)
}

// ── Textual dump ─────────────────────────────────────────────────────

fn constant_line(v: Value) -> String {
    if v.is_nil() {
        return "nil".to_string();
    }
    if v.is_bool() {
        return format!("bool {}", v.as_bool());
    }
    if v.is_num() {
        return format!("num {}", format_num(v.as_f64()));
    }
    // SAFETY: pool entries hold live references.
    match unsafe { v.as_obj() } {
        Obj::Str(s) => format!("string {s:?}"),
        Obj::Function(f) => {
            if f.builtin_id >= 0 {
                format!("func {} (builtin {})", f.name, f.builtin_id)
            } else {
                format!("func {}", f.name)
            }
        }
        Obj::Struct { type_id, fields } => format!("struct #{type_id} ({} fields)", fields.len()),
        Obj::List(elems) => format!("list ({} elems)", elems.len()),
        Obj::Table(entries) => format!("table ({} entries)", entries.len()),
    }
}

/// Human-readable rendition of a program: constants, a blank line, then
/// instructions. Derived output only; never parsed back.
pub fn disassemble(asm: &Assembler) -> String {
    let mut out = String::new();
    for (i, v) in asm.constants.iter().enumerate() {
        out.push_str(&format!("{i} -> {}\n", constant_line(*v)));
    }
    out.push('\n');
    for (pc, ins) in asm.code.iter().enumerate() {
        out.push_str(&format!(
            "{pc}; {} a={} b={} c={}\n",
            ins.op.name(),
            ins.a,
            ins.b,
            ins.c
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::std_lib::register_default_builtins;

    /// Structural equality over reloaded constants: raw bits for scalars,
    /// contents for heap objects.
    fn const_eq(a: Value, b: Value) -> bool {
        if !a.is_obj() || !b.is_obj() {
            return a.raw == b.raw;
        }
        // SAFETY: both sides hold live references in the pools under test.
        match unsafe { (a.as_obj(), b.as_obj()) } {
            (Obj::Str(x), Obj::Str(y)) => x == y,
            (Obj::Function(x), Obj::Function(y)) => x == y,
            (
                Obj::Struct { type_id: ti, fields: fa },
                Obj::Struct { type_id: tj, fields: fb },
            ) => ti == tj && fa.len() == fb.len() && fa.iter().zip(fb).all(|(x, y)| const_eq(*x, *y)),
            (Obj::List(xa), Obj::List(xb)) => {
                xa.len() == xb.len() && xa.iter().zip(xb).all(|(x, y)| const_eq(*x, *y))
            }
            _ => false,
        }
    }

    fn sample_assembler() -> Assembler {
        register_default_builtins();
        let mut asm = Assembler::new();
        asm.add_constant(Value::nil());
        asm.add_constant(Value::boolean(true));
        asm.add_constant(Value::int(42));
        asm.add_constant(Value::string("hello"));
        let print_id = crate::builtins::lookup_name("print");
        asm.add_constant(Value::obj(Obj::Function(FunctionRef {
            builtin_id: print_id,
            return_type: TypeKind::Void,
            param_types: vec![TypeKind::String],
            name: "print".to_string(),
        })));
        asm.add_constant(Value::obj(Obj::Struct {
            type_id: 1,
            fields: vec![Value::int(3), Value::int(4)],
        }));
        asm.add_constant(Value::obj(Obj::List(vec![
            Value::int(1),
            Value::string("x"),
            Value::nil(),
        ])));
        asm.emit(OpCode::Const, 1, 0, 2, 0);
        asm.emit(OpCode::Jmp, 1, 0, 3, 0);
        asm.emit(OpCode::Call, 2, 1, 0, 2);
        asm.emit(OpCode::Return, 3, 0, 0, 0);
        asm
    }

    #[test]
    fn round_trip_preserves_code_and_constants() {
        let asm = sample_assembler();
        let mut buf = Vec::new();
        save_to(&mut buf, &asm).unwrap();
        let loaded = load_from(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.code, asm.code);
        assert_eq!(loaded.constants.len(), asm.constants.len());
        for (a, b) in asm.constants.iter().zip(&loaded.constants) {
            assert!(const_eq(*a, *b), "constant mismatch: {:?} vs {:?}", a, b);
        }
    }

    #[test]
    fn magic_header_leads_the_file() {
        let asm = sample_assembler();
        let mut buf = Vec::new();
        save_to(&mut buf, &asm).unwrap();
        assert_eq!(&buf[..4], b"MDOT");
    }

    #[test]
    fn bad_magic_fails_fast() {
        let err = load_from(&mut &b"XDOT\0\0\0\0\0\0\0\0"[..]).unwrap_err();
        assert!(matches!(err, BytecodeError::BadMagic));
    }

    #[test]
    fn truncated_file_fails() {
        let asm = sample_assembler();
        let mut buf = Vec::new();
        save_to(&mut buf, &asm).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(load_from(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MDOT");
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = load_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, BytecodeError::CountTooLarge(_)));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MDOT");
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.push(0x7f);
        let err = load_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, BytecodeError::UnknownTag(0x7f)));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"MDOT");
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.push(0xee);
        buf.extend_from_slice(&[0u8; 16]);
        let err = load_from(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, BytecodeError::UnknownOpcode(0xee)));
    }

    #[test]
    fn function_rebinds_by_name_when_id_is_unknown() {
        register_default_builtins();
        let mut asm = Assembler::new();
        asm.add_constant(Value::obj(Obj::Function(FunctionRef {
            builtin_id: -1,
            return_type: TypeKind::Number,
            param_types: vec![TypeKind::String],
            name: "len".to_string(),
        })));
        let mut buf = Vec::new();
        save_to(&mut buf, &asm).unwrap();
        let loaded = load_from(&mut buf.as_slice()).unwrap();
        let v = loaded.constants[0];
        assert!(v.is_obj());
        // SAFETY: pool holds a live reference.
        match unsafe { v.as_obj() } {
            Obj::Function(f) => {
                assert!(f.builtin_id >= 0);
                assert_eq!(f.name, "len");
            }
            _ => panic!("expected function constant"),
        }
    }

    #[test]
    fn missing_builtin_loads_as_nil() {
        register_default_builtins();
        let mut asm = Assembler::new();
        asm.add_constant(Value::obj(Obj::Function(FunctionRef {
            builtin_id: -1,
            return_type: TypeKind::Void,
            param_types: vec![],
            name: "absent_optional_builtin".to_string(),
        })));
        let mut buf = Vec::new();
        save_to(&mut buf, &asm).unwrap();
        let loaded = load_from(&mut buf.as_slice()).unwrap();
        assert!(loaded.constants[0].is_nil());
    }

    #[test]
    fn save_and_load_through_a_real_file() {
        let asm = sample_assembler();
        let path = std::env::temp_dir().join(format!("mondot_io_{}.mdotc", std::process::id()));
        save(&path, &asm).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.code, asm.code);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn dump_lists_constants_then_instructions() {
        let asm = sample_assembler();
        let text = disassemble(&asm);
        assert!(text.contains("2 -> num 42"));
        assert!(text.contains("3 -> string \"hello\""));
        assert!(text.contains("\n\n"));
        assert!(text.contains("0; OP_CONST a=0 b=2 c=0"));
        assert!(text.contains("1; OP_JMP a=0 b=3 c=0"));
    }
}
