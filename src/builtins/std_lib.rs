use std::sync::Once;

use crate::value::{Obj, TypeKind, Value, INTSCALED_ONE};

use super::register;

/// Renders a number the way the runtime prints it: fixed six decimals with
/// trailing zeros (and a bare trailing dot) trimmed.
pub fn format_num(d: f64) -> String {
    let mut out = format!("{:.6}", d);
    if out.contains('.') {
        while out.ends_with('0') {
            out.pop();
        }
        if out.ends_with('.') {
            out.pop();
        }
    }
    out
}

fn value_to_short_string(v: Value) -> String {
    if v.is_num() {
        return format_num(v.as_f64());
    }
    if v.is_bool() {
        return if v.as_bool() { "true" } else { "false" }.to_string();
    }
    if v.is_obj() {
        // SAFETY: argument slots hold live references for the duration of
        // the builtin call.
        match unsafe { v.as_obj() } {
            Obj::Str(s) => return s.clone(),
            Obj::List(elems) => {
                let mut out = String::from("[");
                for (i, e) in elems.iter().take(8).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&value_to_short_string(*e));
                }
                if elems.len() > 8 {
                    out.push_str(", ...");
                }
                out.push(']');
                return out;
            }
            _ => {}
        }
    }
    "nil".to_string()
}

fn print_string(args: &[Value]) -> Value {
    match args.first() {
        None => println!(),
        Some(v) => println!("{}", value_to_short_string(*v)),
    }
    Value::nil()
}

fn print_number(args: &[Value]) -> Value {
    match args.first() {
        Some(v) if v.is_num() => println!("{}", format_num(v.as_f64())),
        _ => println!("nil"),
    }
    Value::nil()
}

fn print_list(args: &[Value]) -> Value {
    let Some(v) = args.first() else {
        println!("[]");
        return Value::nil();
    };
    if v.is_obj() {
        // SAFETY: as for value_to_short_string.
        if let Obj::List(elems) = unsafe { v.as_obj() } {
            let rendered: Vec<String> =
                elems.iter().map(|e| value_to_short_string(*e)).collect();
            println!("[{}]", rendered.join(", "));
            return Value::nil();
        }
    }
    println!("nil");
    Value::nil()
}

fn len_string(args: &[Value]) -> Value {
    if let Some(v) = args.first() {
        if v.is_obj() {
            // SAFETY: as above.
            if let Obj::Str(s) = unsafe { v.as_obj() } {
                return Value::int(s.len() as i64);
            }
        }
    }
    Value::nil()
}

fn trig(args: &[Value], f: fn(f64) -> f64) -> Value {
    match args.first() {
        Some(v) if v.is_num() => {
            let q = (f(v.as_f64()) * INTSCALED_ONE as f64).round() as i64;
            Value::scaled(q)
        }
        _ => Value::nil(),
    }
}

/// Installs the io and math builtins. Safe to call more than once; the
/// table is populated a single time.
pub fn register_default_builtins() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register("print", print_string, TypeKind::Void, vec![TypeKind::String]);
        register("print", print_number, TypeKind::Void, vec![TypeKind::Number]);
        register("print", print_list, TypeKind::Void, vec![TypeKind::List]);
        register("len", len_string, TypeKind::Number, vec![TypeKind::String]);
        register("sin", |args| trig(args, f64::sin), TypeKind::Number, vec![TypeKind::Number]);
        register("cos", |args| trig(args, f64::cos), TypeKind::Number, vec![TypeKind::Number]);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::release;

    #[test]
    fn format_num_trims_trailing_zeros() {
        assert_eq!(format_num(5.0), "5");
        assert_eq!(format_num(2.5), "2.5");
        assert_eq!(format_num(0.125), "0.125");
        assert_eq!(format_num(-3.0), "-3");
    }

    #[test]
    fn short_string_for_values() {
        assert_eq!(value_to_short_string(Value::int(9)), "9");
        assert_eq!(value_to_short_string(Value::boolean(true)), "true");
        assert_eq!(value_to_short_string(Value::nil()), "nil");
        let s = Value::string("hi");
        assert_eq!(value_to_short_string(s), "hi");
        release(s);
    }

    #[test]
    fn short_string_previews_long_lists() {
        let elems: Vec<Value> = (0..10).map(Value::int).collect();
        let list = Value::obj(Obj::List(elems));
        let out = value_to_short_string(list);
        assert!(out.starts_with("[0, 1,"));
        assert!(out.ends_with(", ...]"));
        release(list);
    }

    #[test]
    fn len_counts_bytes() {
        let s = Value::string("abcd");
        assert_eq!(len_string(&[s]), Value::int(4));
        release(s);
    }

    #[test]
    fn len_of_non_string_is_nil() {
        assert_eq!(len_string(&[Value::int(1)]), Value::nil());
        assert_eq!(len_string(&[]), Value::nil());
    }

    #[test]
    fn sin_of_zero_is_zero() {
        assert_eq!(trig(&[Value::int(0)], f64::sin), Value::int(0));
    }

    #[test]
    fn cos_of_zero_is_one() {
        assert_eq!(trig(&[Value::int(0)], f64::cos), Value::int(1));
    }

    #[test]
    fn trig_of_non_number_is_nil() {
        assert_eq!(trig(&[Value::nil()], f64::sin), Value::nil());
    }

    #[test]
    fn defaults_register_once() {
        register_default_builtins();
        register_default_builtins();
        let entries = crate::builtins::all_entries();
        let prints = entries.iter().filter(|e| e.name == "print").count();
        assert_eq!(prints, 3);
    }
}
