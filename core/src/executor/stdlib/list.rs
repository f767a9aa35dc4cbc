//! List builtins

use crate::executor::types::Val;

/// Largest list `range()` will build
pub const MAX_RANGE: u64 = 1_000_000;

/// range(n) - `[0, 1, ..., n-1]`
pub fn range(n: &Val) -> Result<Val, String> {
    match n {
        Val::Num(n) if *n > MAX_RANGE as f64 && n.fract() == 0.0 => Err(format!(
            "range() is limited to {} items, got {}",
            MAX_RANGE, n
        )),
        Val::Num(n) if *n >= 0.0 && n.fract() == 0.0 => {
            Ok(Val::List((0..*n as u64).map(|i| Val::Num(i as f64)).collect()))
        }
        Val::Num(n) => Err(format!("range() expects a non-negative integer, got {}", n)),
        other => Err(format!("range() expects a number, got {}", other.type_name())),
    }
}

/// len(x) - length of a list, string or object
pub fn len(value: &Val) -> Result<Val, String> {
    let n = match value {
        Val::List(items) => items.len(),
        Val::Str(s) => s.chars().count(),
        Val::Obj(map) => map.len(),
        other => return Err(format!("len() is not defined for {}", other.type_name())),
    };
    Ok(Val::Num(n as f64))
}
