//! Builtin functions reachable from source code.
//!
//! With no global table, identifier resolution falls back to this fixed
//! registry; each builtin is a heap object loaded through the constant
//! pool like any other function value.

use itertools::Itertools;

use crate::error::RuntimeError;
use crate::state::State;
use crate::value::{display_value, Value};

pub(crate) fn register(st: &mut State) {
    st.register_builtin("assert", lj_assert);
    st.register_builtin("print", lj_print);
    st.register_builtin("type", lj_type);
}

/// `assert(v, ...)`: raises "assertion failed!" unless `v` is true;
/// otherwise returns all its arguments.
fn lj_assert(st: &mut State, base: usize, nargs: usize) -> Result<usize, RuntimeError> {
    if nargs == 0 || !st.stack[base].compares_true() {
        return Err(RuntimeError::AssertionFailed);
    }
    for i in 0..nargs {
        st.stack[base - 1 + i] = st.stack[base + i];
    }
    Ok(nargs)
}

/// `print(...)`: writes its arguments tab-separated to standard output.
fn lj_print(st: &mut State, base: usize, nargs: usize) -> Result<usize, RuntimeError> {
    let line = (0..nargs)
        .map(|i| display_value(st.stack[base + i]))
        .join("\t");
    println!("{line}");
    Ok(0)
}

/// `type(v)`: returns the type name of its argument as a string.
fn lj_type(st: &mut State, base: usize, nargs: usize) -> Result<usize, RuntimeError> {
    let v = if nargs == 0 {
        Value::nil()
    } else {
        st.stack[base]
    };
    let name = st.alloc_str(v.type_name().as_bytes());
    st.stack[base - 1] = name;
    Ok(1)
}
