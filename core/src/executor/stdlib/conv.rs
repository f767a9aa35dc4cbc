//! Value inspection and conversion builtins

use crate::executor::types::Val;

/// available(x) - FALSE for the result of a failed or timed-out branch
pub fn available(value: &Val) -> Val {
    Val::Bool(value.is_available())
}

/// str(x)
pub fn to_str(value: &Val) -> Val {
    match value {
        Val::Str(_) => value.clone(),
        other => Val::Str(other.to_string()),
    }
}
