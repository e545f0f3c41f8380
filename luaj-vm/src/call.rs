//! Call-frame records for the interpreter.

use crate::object::Proto;

/// Per-call record pushed when a `CALL` enters a function and popped by the
/// matching return.
///
/// The fields describe the *caller*: the function to resume, where in it,
/// its frame base and how many results it expects. The entry frame of an
/// API-level call stores a null function pointer; returning through it
/// leaves the interpreter loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallInfo {
    func: *const Proto,
    pc: usize,
    base: usize,
    expected: u8,
}

impl CallInfo {
    pub(crate) const fn new(func: *const Proto, pc: usize, base: usize, expected: u8) -> Self {
        Self {
            func,
            pc,
            base,
            expected,
        }
    }

    /// Caller's function, null for the entry frame.
    pub(crate) const fn func(&self) -> *const Proto {
        self.func
    }

    /// Caller's saved program counter.
    pub(crate) const fn pc(&self) -> usize {
        self.pc
    }

    /// Caller's frame base (absolute stack index).
    pub(crate) const fn base(&self) -> usize {
        self.base
    }

    /// Number of results the call site expects.
    pub(crate) const fn expected(&self) -> u8 {
        self.expected
    }
}
