//! Builtin function implementations
//!
//! Builtins run in-process and never reach the capability provider.

pub mod conv;
pub mod list;

use super::types::Val;
use serde::{Deserialize, Serialize};

/* ===================== Builtin Identifiers ===================== */

/// Builtin function identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Range,
    Len,
    Available,
    Str,
}

impl Builtin {
    pub const ALL: [Builtin; 4] = [Builtin::Range, Builtin::Len, Builtin::Available, Builtin::Str];

    pub fn from_name(name: &str) -> Option<Builtin> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Range => "range",
            Builtin::Len => "len",
            Builtin::Available => "available",
            Builtin::Str => "str",
        }
    }

    pub fn arity(&self) -> usize {
        1
    }
}

/* ===================== Dispatcher ===================== */

/// Call a builtin with already evaluated arguments
pub fn call_builtin(func: Builtin, args: &[Val]) -> Result<Val, String> {
    if args.len() != func.arity() {
        return Err(format!(
            "{}() expects {} argument(s), got {}",
            func.name(),
            func.arity(),
            args.len()
        ));
    }

    match func {
        Builtin::Range => list::range(&args[0]),
        Builtin::Len => list::len(&args[0]),
        Builtin::Available => Ok(conv::available(&args[0])),
        Builtin::Str => Ok(conv::to_str(&args[0])),
    }
}
