use std::cell::Cell;

// ── Tagged value ─────────────────────────────────────────────────────
//
// A Value is a single u64. The low 3 bits are the tag; the remaining 61
// bits are the payload. Numbers are signed Q32.32 fixed-point: the scaled
// integer lives in the upper bits and is recovered with an arithmetic
// shift. Obj payloads are pointers to a heap box whose alignment keeps the
// low 3 bits zero.

pub const TAG_NIL: u64 = 0;
pub const TAG_BOOL: u64 = 1;
pub const TAG_NUM: u64 = 2;
pub const TAG_OBJ: u64 = 3;
const TAG_MASK: u64 = 7;

pub const INTSCALED_SHIFT: u32 = 32;
pub const INTSCALED_ONE: i64 = 1 << INTSCALED_SHIFT;

/// Static type of an expression or declaration site. Item-typed slots
/// additionally carry an item-type id next to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeKind {
    Unknown = 0,
    Void = 1,
    Number = 2,
    String = 3,
    Bool = 4,
    List = 5,
    Table = 6,
    Item = 7,
}

impl TypeKind {
    pub fn from_u8(b: u8) -> TypeKind {
        match b {
            1 => TypeKind::Void,
            2 => TypeKind::Number,
            3 => TypeKind::String,
            4 => TypeKind::Bool,
            5 => TypeKind::List,
            6 => TypeKind::Table,
            7 => TypeKind::Item,
            _ => TypeKind::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Void => "void",
            TypeKind::Number => "number",
            TypeKind::String => "string",
            TypeKind::Bool => "bool",
            TypeKind::List => "list",
            TypeKind::Table => "table",
            TypeKind::Item => "item",
            TypeKind::Unknown => "unknown",
        }
    }
}

pub fn parse_type_name(s: &str) -> TypeKind {
    match s {
        "void" => TypeKind::Void,
        "number" => TypeKind::Number,
        "string" => TypeKind::String,
        "bool" => TypeKind::Bool,
        "list" => TypeKind::List,
        "table" => TypeKind::Table,
        _ => TypeKind::Unknown,
    }
}

// ── Heap objects ─────────────────────────────────────────────────────

/// Descriptor for a function value. Builtins carry their registry id;
/// user functions store −1 and are identified by name + parameter types.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRef {
    pub builtin_id: i32,
    pub return_type: TypeKind,
    pub param_types: Vec<TypeKind>,
    pub name: String,
}

pub enum Obj {
    Str(String),
    List(Vec<Value>),
    Table(Vec<(Value, Value)>),
    Struct { type_id: i32, fields: Vec<Value> },
    Function(FunctionRef),
}

impl Drop for Obj {
    fn drop(&mut self) {
        // Value is Copy, so contained references are released by hand.
        match self {
            Obj::Str(_) | Obj::Function(_) => {}
            Obj::List(elems) => {
                for v in elems.iter() {
                    release(*v);
                }
            }
            Obj::Table(entries) => {
                for (k, v) in entries.iter() {
                    release(*k);
                    release(*v);
                }
            }
            Obj::Struct { fields, .. } => {
                for v in fields.iter() {
                    release(*v);
                }
            }
        }
    }
}

// Alignment 8 keeps the low 3 pointer bits free for the tag.
#[repr(align(8))]
struct HeapBox {
    refcount: Cell<i32>,
    obj: Obj,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub raw: u64,
}

impl Value {
    #[inline]
    pub fn nil() -> Value {
        Value { raw: TAG_NIL }
    }

    #[inline]
    pub fn boolean(b: bool) -> Value {
        Value { raw: ((b as u64) << 3) | TAG_BOOL }
    }

    /// Whole number, scaled up to Q32.32.
    #[inline]
    pub fn int(i: i64) -> Value {
        Value::scaled(i << INTSCALED_SHIFT)
    }

    /// Already-scaled Q32.32 payload.
    #[inline]
    pub fn scaled(q: i64) -> Value {
        Value { raw: ((q as u64) << 3) | TAG_NUM }
    }

    /// Allocates a heap box holding `obj` with a reference count of one.
    /// The returned Value owns that reference.
    pub fn obj(obj: Obj) -> Value {
        let ptr = Box::into_raw(Box::new(HeapBox { refcount: Cell::new(1), obj }));
        let raw = ptr as u64;
        debug_assert_eq!(raw & TAG_MASK, 0, "heap box must be 8-aligned");
        Value { raw: raw | TAG_OBJ }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::obj(Obj::Str(s.into()))
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.raw & TAG_MASK == TAG_NIL
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        self.raw & TAG_MASK == TAG_BOOL
    }

    #[inline]
    pub fn is_num(self) -> bool {
        self.raw & TAG_MASK == TAG_NUM
    }

    #[inline]
    pub fn is_obj(self) -> bool {
        self.raw & TAG_MASK == TAG_OBJ
    }

    /// Q32.32 payload. Non-number tags decode to their shifted raw bits,
    /// which for nil and false is 0; arithmetic on nil therefore yields 0.
    #[inline]
    pub fn as_scaled(self) -> i64 {
        (self.raw as i64) >> 3
    }

    #[inline]
    pub fn as_f64(self) -> f64 {
        self.as_scaled() as f64 / INTSCALED_ONE as f64
    }

    #[inline]
    pub fn as_bool(self) -> bool {
        (self.raw >> 3) != 0
    }

    #[inline]
    fn heap_ptr(self) -> *mut HeapBox {
        (self.raw & !TAG_MASK) as *mut HeapBox
    }

    /// # Safety
    /// `self` must be Obj-tagged and its reference count still positive.
    /// The returned reference borrows the heap allocation; callers must not
    /// hold it across an operation that could release the last reference.
    #[inline]
    pub unsafe fn as_obj<'a>(self) -> &'a Obj {
        unsafe { &(*self.heap_ptr()).obj }
    }

    /// # Safety
    /// Same contract as [`Value::as_obj`], plus: the VM is single-threaded
    /// and no other reference into this object may be live while the
    /// returned borrow is.
    #[inline]
    pub unsafe fn as_obj_mut<'a>(self) -> &'a mut Obj {
        unsafe { &mut (*self.heap_ptr()).obj }
    }

    /// Current reference count of an Obj-tagged value; None otherwise.
    pub fn refcount(self) -> Option<i32> {
        if self.is_obj() {
            // SAFETY: is_obj() holds and the caller owns at least one
            // reference, so the box is live.
            Some(unsafe { (*self.heap_ptr()).refcount.get() })
        } else {
            None
        }
    }

    pub fn type_of(self) -> TypeKind {
        if self.is_num() {
            return TypeKind::Number;
        }
        if self.is_bool() {
            return TypeKind::Bool;
        }
        if self.is_obj() {
            // SAFETY: is_obj() holds; the value owns a live reference.
            return match unsafe { self.as_obj() } {
                Obj::Str(_) => TypeKind::String,
                Obj::List(_) => TypeKind::List,
                Obj::Table(_) => TypeKind::Table,
                Obj::Struct { .. } => TypeKind::Item,
                Obj::Function(_) => TypeKind::Unknown,
            };
        }
        TypeKind::Unknown
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if self.is_bool() {
            write!(f, "{}", self.as_bool())
        } else if self.is_num() {
            write!(f, "{}", self.as_f64())
        } else {
            write!(f, "obj@{:#x}", self.raw & !TAG_MASK)
        }
    }
}

#[inline]
pub fn retain(v: Value) {
    if v.is_obj() {
        // SAFETY: Obj-tagged values are only produced by Value::obj and the
        // caller owns a reference, so the box is live.
        unsafe {
            let rc = &(*v.heap_ptr()).refcount;
            rc.set(rc.get() + 1);
        }
    }
}

#[inline]
pub fn release(v: Value) {
    if v.is_obj() {
        // SAFETY: as for retain. Dropping the box releases contained
        // values through Obj::drop.
        unsafe {
            let rc = &(*v.heap_ptr()).refcount;
            let n = rc.get() - 1;
            rc.set(n);
            if n <= 0 {
                drop(Box::from_raw(v.heap_ptr()));
            }
        }
    }
}

// ── Q32.32 arithmetic ────────────────────────────────────────────────

/// Multiply two scaled values through a 128-bit intermediate.
#[inline]
pub fn q_mul(a: i64, b: i64) -> i64 {
    ((a as i128 * b as i128) >> INTSCALED_SHIFT) as i64
}

/// Divide two scaled values; None on a zero divisor.
#[inline]
pub fn q_div(a: i64, b: i64) -> Option<i64> {
    if b == 0 {
        None
    } else {
        Some((((a as i128) << INTSCALED_SHIFT) / b as i128) as i64)
    }
}
