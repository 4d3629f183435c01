use std::collections::HashMap;

use crate::assembler::{Assembler, OpCode};
use crate::builtins;
use crate::source::SourceLocation;
use crate::value::{TypeKind, Value};

/// One collected compile-time problem. Parsing continues after each; the
/// unit fails at its end if any exist.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub location: SourceLocation,
    pub function: String,
}

#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: String,
    pub param_types: Vec<TypeKind>,
    pub return_type: TypeKind,
    /// Item-type id when the return type is an item, else −1.
    pub user_return_type_id: i32,
    /// Assembler label of the body; −1 for builtins and constructors.
    pub label_id: i32,
    pub declared_line: i32,
    pub is_builtin: bool,
}

impl FunctionSig {
    fn new(name: &str) -> FunctionSig {
        FunctionSig {
            name: name.to_string(),
            param_types: Vec::new(),
            return_type: TypeKind::Void,
            user_return_type_id: -1,
            label_id: -1,
            declared_line: 0,
            is_builtin: false,
        }
    }
}

/// A named local or anonymous temporary. Entries are append-only within a
/// function, so the slot always equals the entry's index.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub name: String,
    pub depth: i32,
    pub slot: i32,
    pub ty: TypeKind,
    /// Item-type id for item-typed slots, else −1.
    pub item_id: i32,
}

/// Nominal record type with single inheritance. A child's field list
/// starts with an exact copy of its parent's.
#[derive(Debug, Clone)]
pub struct ItemType {
    pub id: i32,
    pub name: String,
    pub parent_id: i32,
    pub fields: Vec<(String, TypeKind)>,
    /// False while only the prescan has seen the name; true once the
    /// declaration body has been parsed.
    pub defined: bool,
}

#[derive(Debug)]
pub struct Compiler {
    pub asm: Assembler,
    pub locals: Vec<LocalEntry>,
    pub scope_depth: i32,
    pub function_table: HashMap<String, Vec<FunctionSig>>,
    pub items: Vec<ItemType>,
    pub diagnostics: Vec<Diagnostic>,
    pub current_function: String,
    pub expected_return: TypeKind,
}

impl Compiler {
    /// A fresh compiler pre-seeded with every registered builtin.
    pub fn new() -> Compiler {
        let mut function_table: HashMap<String, Vec<FunctionSig>> = HashMap::new();
        for be in builtins::all_entries() {
            let sig = FunctionSig {
                name: be.name.clone(),
                param_types: be.param_types.clone(),
                return_type: be.return_type,
                user_return_type_id: -1,
                label_id: -1,
                declared_line: 0,
                is_builtin: true,
            };
            function_table.entry(be.name).or_default().push(sig);
        }
        Compiler {
            asm: Assembler::new(),
            locals: Vec::new(),
            scope_depth: 0,
            function_table,
            items: Vec::new(),
            diagnostics: Vec::new(),
            current_function: String::new(),
            expected_return: TypeKind::Unknown,
        }
    }

    pub fn push_diag(&mut self, message: impl Into<String>, location: SourceLocation) {
        self.diagnostics.push(Diagnostic {
            message: message.into(),
            location,
            function: self.current_function.clone(),
        });
    }

    // ── Locals ───────────────────────────────────────────────────────

    /// Linear search from the most recent entry; later declarations shadow
    /// earlier ones. Returns the slot, or −1.
    pub fn resolve_local(&self, name: &str) -> i32 {
        for entry in self.locals.iter().rev() {
            if entry.name == name {
                return entry.slot;
            }
        }
        -1
    }

    pub fn define_local(&mut self, name: &str, ty: TypeKind, item_id: i32) -> i32 {
        let slot = self.locals.len() as i32;
        self.locals.push(LocalEntry {
            name: name.to_string(),
            depth: self.scope_depth,
            slot,
            ty,
            item_id,
        });
        slot
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    pub fn end_scope(&mut self) {
        self.scope_depth -= 1;
        while self
            .locals
            .last()
            .is_some_and(|l| l.depth > self.scope_depth)
        {
            self.locals.pop();
        }
    }

    /// Interns `v`, allocates an anonymous slot of its runtime type, and
    /// emits the load.
    pub fn emit_const(&mut self, v: Value, line: i32) -> i32 {
        let ty = v.type_of();
        let idx = self.asm.add_constant(v);
        let reg = self.define_local("", ty, -1);
        self.asm.emit(OpCode::Const, line, reg, idx as i32, 0);
        reg
    }

    // ── Function table ───────────────────────────────────────────────

    /// Overload resolution: exact arity, then known-type agreement
    /// (Unknown matches anything), preferring the expected return type,
    /// else the first survivor, else any overload of matching arity.
    pub fn resolve_function(&self, name: &str, arg_types: &[TypeKind]) -> Option<FunctionSig> {
        let overloads = self.function_table.get(name)?;
        let mut best: Option<&FunctionSig> = None;
        for fs in overloads {
            if fs.param_types.len() != arg_types.len() {
                continue;
            }
            let compatible = arg_types.iter().zip(&fs.param_types).all(|(arg, param)| {
                *arg == TypeKind::Unknown || *param == TypeKind::Unknown || arg == param
            });
            if !compatible {
                continue;
            }
            if self.expected_return != TypeKind::Unknown && fs.return_type == self.expected_return {
                return Some(fs.clone());
            }
            if best.is_none() {
                best = Some(fs);
            }
        }
        if let Some(fs) = best {
            return Some(fs.clone());
        }
        overloads
            .iter()
            .find(|fs| fs.param_types.len() == arg_types.len())
            .cloned()
    }

    // ── Item types ───────────────────────────────────────────────────

    pub fn find_item_id_by_name(&self, name: &str) -> i32 {
        self.items
            .iter()
            .find(|it| it.name == name)
            .map(|it| it.id)
            .unwrap_or(-1)
    }

    /// Reserves an id for an item name before its declaration is parsed,
    /// so item return types resolve regardless of source order.
    pub fn declare_item_name(&mut self, name: &str) -> i32 {
        let existing = self.find_item_id_by_name(name);
        if existing >= 0 {
            return existing;
        }
        let id = self.items.len() as i32;
        self.items.push(ItemType {
            id,
            name: name.to_string(),
            parent_id: -1,
            fields: Vec::new(),
            defined: false,
        });
        id
    }

    /// Fills in a declared item: parent field copy first, then own fields,
    /// and installs the positional constructor overload.
    pub fn register_item_type(
        &mut self,
        name: &str,
        parent_id: i32,
        own_fields: Vec<(String, TypeKind)>,
    ) -> i32 {
        let id = self.declare_item_name(name);
        let mut fields = Vec::new();
        if parent_id >= 0 {
            fields.extend_from_slice(&self.items[parent_id as usize].fields);
        }
        fields.extend(own_fields);

        let it = &mut self.items[id as usize];
        it.parent_id = parent_id;
        it.fields = fields;
        it.defined = true;

        let ctor = FunctionSig {
            param_types: self.items[id as usize].fields.iter().map(|(_, t)| *t).collect(),
            return_type: TypeKind::Item,
            user_return_type_id: id,
            ..FunctionSig::new(name)
        };
        self.function_table.entry(name.to_string()).or_default().push(ctor);
        id
    }

    pub fn item_fields(&self, id: i32) -> &[(String, TypeKind)] {
        if id >= 0 && (id as usize) < self.items.len() {
            &self.items[id as usize].fields
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn locals_shadow_and_pop_by_depth() {
        let mut c = Compiler::new();
        let outer = c.define_local("x", TypeKind::Number, -1);
        c.begin_scope();
        let inner = c.define_local("x", TypeKind::String, -1);
        assert_eq!(c.resolve_local("x"), inner);
        c.end_scope();
        assert_eq!(c.resolve_local("x"), outer);
    }

    #[test]
    fn unknown_local_is_negative() {
        let c = Compiler::new();
        assert_eq!(c.resolve_local("missing"), -1);
    }

    #[test]
    fn slots_are_append_only() {
        let mut c = Compiler::new();
        assert_eq!(c.define_local("a", TypeKind::Number, -1), 0);
        assert_eq!(c.define_local("", TypeKind::Unknown, -1), 1);
        assert_eq!(c.define_local("b", TypeKind::Bool, -1), 2);
    }

    #[test]
    fn emit_const_loads_into_fresh_slot() {
        let mut c = Compiler::new();
        let r = c.emit_const(Value::int(3), 7);
        assert_eq!(r, 0);
        let ins = c.asm.code[0];
        assert_eq!(ins.op, OpCode::Const);
        assert_eq!(ins.a, 0);
        assert_eq!(ins.line, 7);
        assert_eq!(c.locals[0].ty, TypeKind::Number);
    }

    fn sig(name: &str, params: Vec<TypeKind>, ret: TypeKind) -> FunctionSig {
        FunctionSig { param_types: params, return_type: ret, ..FunctionSig::new(name) }
    }

    #[test]
    fn resolution_filters_by_arity() {
        let mut c = Compiler::new();
        c.function_table.insert(
            "f".into(),
            vec![
                sig("f", vec![TypeKind::Number], TypeKind::Number),
                sig("f", vec![TypeKind::Number, TypeKind::Number], TypeKind::Number),
            ],
        );
        let fs = c.resolve_function("f", &[TypeKind::Number, TypeKind::Number]).unwrap();
        assert_eq!(fs.param_types.len(), 2);
    }

    #[test]
    fn resolution_filters_by_known_types() {
        let mut c = Compiler::new();
        c.function_table.insert(
            "g".into(),
            vec![
                sig("g", vec![TypeKind::String], TypeKind::Void),
                sig("g", vec![TypeKind::Number], TypeKind::Void),
            ],
        );
        let fs = c.resolve_function("g", &[TypeKind::Number]).unwrap();
        assert_eq!(fs.param_types, vec![TypeKind::Number]);
    }

    #[test]
    fn unknown_argument_matches_first_overload() {
        let mut c = Compiler::new();
        c.function_table.insert(
            "h".into(),
            vec![
                sig("h", vec![TypeKind::String], TypeKind::Void),
                sig("h", vec![TypeKind::Number], TypeKind::Void),
            ],
        );
        let fs = c.resolve_function("h", &[TypeKind::Unknown]).unwrap();
        assert_eq!(fs.param_types, vec![TypeKind::String]);
    }

    #[test]
    fn expected_return_type_breaks_ties() {
        let mut c = Compiler::new();
        c.function_table.insert(
            "k".into(),
            vec![
                sig("k", vec![TypeKind::Unknown], TypeKind::String),
                sig("k", vec![TypeKind::Unknown], TypeKind::Number),
            ],
        );
        c.expected_return = TypeKind::Number;
        let fs = c.resolve_function("k", &[TypeKind::Unknown]).unwrap();
        assert_eq!(fs.return_type, TypeKind::Number);
    }

    #[test]
    fn arity_fallback_when_types_disagree() {
        let mut c = Compiler::new();
        c.function_table
            .insert("m".into(), vec![sig("m", vec![TypeKind::String], TypeKind::Void)]);
        // Known Number disagrees with String, but the arity fallback still
        // hands back the lone single-argument overload.
        let fs = c.resolve_function("m", &[TypeKind::Number]).unwrap();
        assert_eq!(fs.param_types, vec![TypeKind::String]);
    }

    #[test]
    fn missing_function_is_none() {
        let c = Compiler::new();
        assert!(c.resolve_function("nope_not_here", &[]).is_none());
    }

    #[test]
    fn item_registration_installs_constructor() {
        let mut c = Compiler::new();
        let id = c.register_item_type(
            "Point",
            -1,
            vec![("x".into(), TypeKind::Number), ("y".into(), TypeKind::Number)],
        );
        assert_eq!(c.find_item_id_by_name("Point"), id);
        let ctor = c.resolve_function("Point", &[TypeKind::Number, TypeKind::Number]).unwrap();
        assert_eq!(ctor.user_return_type_id, id);
        assert_eq!(ctor.return_type, TypeKind::Item);
    }

    #[test]
    fn child_fields_start_with_parent_copy() {
        let mut c = Compiler::new();
        let base = c.register_item_type("Base", -1, vec![("a".into(), TypeKind::Number)]);
        let child = c.register_item_type(
            "Child",
            base,
            vec![("b".into(), TypeKind::String)],
        );
        let fields = c.item_fields(child);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], ("a".to_string(), TypeKind::Number));
        assert_eq!(fields[1], ("b".to_string(), TypeKind::String));
        assert_eq!(c.items[child as usize].parent_id, base);
    }

    #[test]
    fn declare_item_name_is_idempotent() {
        let mut c = Compiler::new();
        let a = c.declare_item_name("P");
        let b = c.declare_item_name("P");
        assert_eq!(a, b);
    }

    #[test]
    fn item_fields_out_of_range_is_empty() {
        let c = Compiler::new();
        assert!(c.item_fields(-1).is_empty());
        assert!(c.item_fields(9).is_empty());
    }
}
