pub mod std_lib;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::{TypeKind, Value};

/// Host function callable from bytecode. Closures carry their own context,
/// so there is no separate ctx pointer in an entry.
pub type BuiltinFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct BuiltinEntry {
    pub name: String,
    pub func: BuiltinFn,
    pub return_type: TypeKind,
    pub param_types: Vec<TypeKind>,
}

// Process-wide table, written at startup and read during compilation and
// execution. The lock is mandatory because consumers may register
// dynamically; ids are stable append-only indices.
static REGISTRY: Mutex<Vec<BuiltinEntry>> = Mutex::new(Vec::new());

/// Appends an entry and returns its id.
pub fn register(
    name: &str,
    func: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    return_type: TypeKind,
    param_types: Vec<TypeKind>,
) -> i32 {
    let mut reg = REGISTRY.lock();
    reg.push(BuiltinEntry {
        name: name.to_string(),
        func: Arc::new(func),
        return_type,
        param_types,
    });
    reg.len() as i32 - 1
}

/// Clones the entry out so callers invoke the function without holding
/// the registry lock.
pub fn entry(id: i32) -> Option<BuiltinEntry> {
    if id < 0 {
        return None;
    }
    REGISTRY.lock().get(id as usize).cloned()
}

/// First entry with the given name, or −1.
pub fn lookup_name(name: &str) -> i32 {
    let reg = REGISTRY.lock();
    reg.iter()
        .position(|e| e.name == name)
        .map(|i| i as i32)
        .unwrap_or(-1)
}

/// Compatibility match on (name, parameter types): unknown parameter types
/// match anything. Falls back to name-only lookup when no overload
/// matches structurally.
pub fn lookup_signature(name: &str, params: &[TypeKind]) -> i32 {
    {
        let reg = REGISTRY.lock();
        for (i, e) in reg.iter().enumerate() {
            if e.name != name || e.param_types.len() != params.len() {
                continue;
            }
            let ok = params.iter().zip(&e.param_types).all(|(p, ep)| {
                *p == TypeKind::Unknown || *ep == TypeKind::Unknown || p == ep
            });
            if ok {
                return i as i32;
            }
        }
    }
    lookup_name(name)
}

/// Snapshot of the whole table, for seeding a compiler's function table.
pub fn all_entries() -> Vec<BuiltinEntry> {
    REGISTRY.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn register_and_invoke() {
        let id = register(
            "reg_test_double",
            |args| Value::scaled(args[0].as_scaled() * 2),
            TypeKind::Number,
            vec![TypeKind::Number],
        );
        let e = entry(id).expect("entry exists");
        assert_eq!(e.name, "reg_test_double");
        let out = (e.func)(&[Value::int(4)]);
        assert_eq!(out, Value::int(8));
    }

    #[test]
    fn entry_out_of_range_is_none() {
        assert!(entry(-1).is_none());
        assert!(entry(1_000_000).is_none());
    }

    #[test]
    fn lookup_by_name_returns_first() {
        let first = register("reg_test_over", |_| Value::nil(), TypeKind::Void, vec![TypeKind::String]);
        register("reg_test_over", |_| Value::nil(), TypeKind::Void, vec![TypeKind::Number]);
        assert_eq!(lookup_name("reg_test_over"), first);
    }

    #[test]
    fn lookup_signature_matches_structurally() {
        register("reg_test_sig", |_| Value::nil(), TypeKind::Void, vec![TypeKind::String]);
        let num = register("reg_test_sig", |_| Value::nil(), TypeKind::Void, vec![TypeKind::Number]);
        assert_eq!(lookup_signature("reg_test_sig", &[TypeKind::Number]), num);
    }

    #[test]
    fn lookup_signature_wildcard_matches_anything() {
        let id = register("reg_test_wild", |_| Value::nil(), TypeKind::Void, vec![TypeKind::String]);
        assert_eq!(lookup_signature("reg_test_wild", &[TypeKind::Unknown]), id);
    }

    #[test]
    fn lookup_signature_falls_back_to_name() {
        let id = register("reg_test_fall", |_| Value::nil(), TypeKind::Void, vec![TypeKind::String]);
        // No two-argument overload exists; the name-only fallback wins.
        assert_eq!(
            lookup_signature("reg_test_fall", &[TypeKind::Number, TypeKind::Number]),
            id
        );
    }

    #[test]
    fn lookup_missing_name_is_negative() {
        assert_eq!(lookup_name("reg_test_no_such"), -1);
        assert_eq!(lookup_signature("reg_test_no_such", &[]), -1);
    }

    #[test]
    fn closures_carry_their_own_context() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let id = register(
            "reg_test_ctx",
            |_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Value::nil()
            },
            TypeKind::Void,
            vec![],
        );
        let e = entry(id).unwrap();
        (e.func)(&[]);
        (e.func)(&[]);
        assert!(CALLS.load(Ordering::SeqCst) >= 2);
    }
}
