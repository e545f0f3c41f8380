//! Interpreter state and the embedding API.

use std::io::Read;

use tracing::debug;

use crate::builtins;
use crate::call::CallInfo;
use crate::compiler;
use crate::consts::STACK_INIT;
use crate::error::{Error, Status};
use crate::interpreter;
use crate::object::{Native, NativeImpl, ObjCell, Proto, Str};
use crate::value::Value;

/// A self-contained interpreter instance.
///
/// Owns the register stack, the call-info stack and every heap object it
/// ever allocated; dropping the state releases all of it. States share
/// nothing and are single-threaded.
#[derive(Debug)]
pub struct State {
    pub(crate) stack: Vec<Value>,
    pub(crate) top: usize,
    pub(crate) base: usize,
    pub(crate) frames: Vec<CallInfo>,
    objects: Vec<ObjCell>,
    builtins: Vec<(&'static str, Value)>,
}

impl State {
    /// Creates a fresh state with the builtin functions registered.
    pub fn new() -> Self {
        let mut s = Self {
            stack: vec![Value::nil(); STACK_INIT],
            top: 0,
            base: 0,
            frames: Vec::new(),
            objects: Vec::new(),
            builtins: Vec::new(),
        };
        builtins::register(&mut s);
        s
    }

    /// Compiles a chunk from `source`.
    ///
    /// On success pushes the compiled function on the stack and returns
    /// [`Status::Ok`]; on failure pushes the error message string and
    /// returns the failing status.
    pub fn load<R: Read>(&mut self, source: R, chunk_name: &str) -> Status {
        match compiler::compile(self, source, chunk_name) {
            Ok(proto) => {
                self.push(proto);
                Status::Ok
            }
            Err(e) => {
                let status = Status::from(&e);
                let msg = self.alloc_str(e.to_string().as_bytes());
                self.push(msg);
                status
            }
        }
    }

    /// Unchecked call: the callee sits below its `n_args` arguments on the
    /// stack; `n_results` results replace callee and arguments.
    ///
    /// Errors propagate to the caller untouched; use [`State::pcall`] for a
    /// protected boundary.
    pub fn call(&mut self, n_args: usize, n_results: usize) -> Result<(), Error> {
        assert!(self.top > n_args, "not enough values on the stack for the call");
        interpreter::call(self, n_args, n_results)
    }

    /// Protected call.
    ///
    /// Like [`State::call`], but catches any error: the stack is restored
    /// to its pre-call shape and the error value (its message as a string)
    /// is pushed. `err_handler` is the 1-based stack index of an error
    /// handler function applied to the error value first, or `0` for none;
    /// a failing handler yields [`Status::ErrErr`].
    pub fn pcall(&mut self, n_args: usize, n_results: usize, err_handler: usize) -> Status {
        assert!(self.top > n_args, "not enough values on the stack for the call");
        let func_idx = self.top - n_args - 1;
        let saved_frames = self.frames.len();
        let saved_base = self.base;
        let err = match self.call(n_args, n_results) {
            Ok(()) => return Status::Ok,
            Err(e) => e,
        };
        self.frames.truncate(saved_frames);
        self.base = saved_base;
        self.top = func_idx;
        let status = Status::from(&err);
        debug!(%err, ?status, "protected call failed");
        let msg = self.alloc_str(err.to_string().as_bytes());
        if err_handler == 0 {
            self.push(msg);
            return status;
        }
        let handler = match err_handler.checked_sub(1).and_then(|i| self.get(i)) {
            Some(h) => h,
            None => {
                self.push(msg);
                return Status::ErrErr;
            }
        };
        self.push(handler);
        self.push(msg);
        match self.call(1, 1) {
            Ok(()) => status,
            Err(_) => {
                self.frames.truncate(saved_frames);
                self.base = saved_base;
                self.top = func_idx;
                let e = Error::ErrErr;
                let msg = self.alloc_str(e.to_string().as_bytes());
                self.push(msg);
                Status::ErrErr
            }
        }
    }

    /// Pushes a value on the stack.
    pub fn push(&mut self, v: Value) {
        self.ensure_stack(self.top + 1);
        self.stack[self.top] = v;
        self.top += 1;
    }

    /// Pops the top value, if any.
    pub fn pop(&mut self) -> Option<Value> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        Some(self.stack[self.top])
    }

    /// Number of values on the stack.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Value at absolute stack index `idx`, if in range.
    pub fn get(&self, idx: usize) -> Option<Value> {
        (idx < self.top).then(|| self.stack[idx])
    }

    /// Renders a value owned by this state for host-side display; the
    /// error value pushed by a failed [`State::load`] or [`State::pcall`]
    /// is a message string.
    pub fn display_value(&self, v: Value) -> String {
        crate::value::display_value(v)
    }

    /// Bytecode listing of the function at stack index `idx`, if that
    /// value is one.
    pub fn dump_function(&self, idx: usize) -> Option<String> {
        self.get(idx)?.as_proto_obj().map(Proto::dump)
    }

    /// Grows the register stack by doubling until it holds `need` slots.
    pub(crate) fn ensure_stack(&mut self, need: usize) {
        if self.stack.len() < need {
            let mut len = self.stack.len().max(STACK_INIT);
            while len < need {
                len *= 2;
            }
            self.stack.resize(len, Value::nil());
        }
    }

    /// Allocates an immutable string object.
    pub(crate) fn alloc_str(&mut self, bytes: &[u8]) -> Value {
        self.store(ObjCell::Str(Box::new(Str::new(bytes))))
    }

    /// Takes ownership of a frozen function prototype.
    pub(crate) fn alloc_proto(&mut self, proto: Proto) -> Value {
        self.store(ObjCell::Proto(Box::new(proto)))
    }

    /// Allocates a builtin function object.
    pub(crate) fn alloc_native(&mut self, name: &'static str, imp: NativeImpl) -> Value {
        self.store(ObjCell::Native(Box::new(Native::new(name, imp))))
    }

    fn store(&mut self, cell: ObjCell) -> Value {
        let v = Value::from_obj(cell.header_ptr());
        self.objects.push(cell);
        v
    }

    /// Registers a builtin under a resolvable name.
    pub(crate) fn register_builtin(&mut self, name: &'static str, imp: NativeImpl) {
        let v = self.alloc_native(name, imp);
        self.builtins.push((name, v));
    }

    /// Looks up a builtin by name.
    pub(crate) fn builtin(&self, name: &str) -> Option<Value> {
        self.builtins
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, v)| v)
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop() {
        let mut st = State::new();
        st.push(Value::num(1.0));
        st.push(Value::from_bool(true));
        assert_eq!(st.top(), 2);
        assert!(st.pop().unwrap().is_true());
        assert_eq!(st.pop().unwrap().as_num(), Some(1.0));
        assert_eq!(st.pop(), None);
    }

    #[test]
    fn stack_grows_by_doubling() {
        let mut st = State::new();
        st.ensure_stack(STACK_INIT + 1);
        assert_eq!(st.stack.len(), STACK_INIT * 2);
        st.ensure_stack(STACK_INIT * 8 + 1);
        assert_eq!(st.stack.len(), STACK_INIT * 16);
    }

    #[test]
    fn builtins_are_resolvable() {
        let st = State::new();
        for name in ["assert", "print", "type"] {
            let v = st.builtin(name).unwrap();
            assert_eq!(v.type_name(), "function");
        }
        assert_eq!(st.builtin("nope"), None);
    }

    #[test]
    fn strings_are_distinct_objects_with_equal_contents() {
        let mut st = State::new();
        let a = st.alloc_str(b"abc");
        let b = st.alloc_str(b"abc");
        assert_ne!(a, b);
        assert!(a.as_str_obj().unwrap().eq_bytes(b.as_str_obj().unwrap()));
    }
}
