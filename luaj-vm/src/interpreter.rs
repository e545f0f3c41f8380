//! The bytecode dispatch loop.
//!
//! A single `match` over the opcode inside a fetch/advance loop: the Rust
//! rendering of a direct-threaded interpreter, compiled to a jump table.
//! Frame transitions (`CALL`, `RET*`) swap the current prototype, program
//! counter and base in place instead of recursing.

use luaj_asm::{Instruction, Op, JMP_BIAS};
use tracing::trace;

use crate::call::CallInfo;
use crate::error::{Error, RuntimeError};
use crate::object::{ObjTag, Proto};
use crate::state::State;
use crate::value::{number_mod, Value};

/// Frame headroom reserved above `base` whenever a function is entered:
/// slot operands are 8-bit, so no frame touches more than this many slots.
const FRAME_SLOTS: usize = 256;

/// Calls the value at `top - n_args - 1` with the arguments above it.
pub(crate) fn call(st: &mut State, n_args: usize, n_results: usize) -> Result<(), Error> {
    let func_idx = st.top - n_args - 1;
    let callee = st.stack[func_idx];
    match callee.obj_tag() {
        Some(ObjTag::Proto) => execute(st, func_idx, n_args, n_results),
        Some(ObjTag::Native) => {
            let imp = match callee.as_native_obj() {
                Some(n) => n.imp(),
                None => unreachable!(),
            };
            let nret = imp(st, func_idx + 1, n_args).map_err(api_err)?;
            st.ensure_stack(func_idx + n_results.max(1));
            for i in nret..n_results {
                st.stack[func_idx + i] = Value::nil();
            }
            st.top = func_idx + n_results;
            Ok(())
        }
        _ => Err(api_err(RuntimeError::NotCallable(callee.type_name()))),
    }
}

/// A runtime error raised at the API boundary, before any bytecode frame
/// exists to look a source location up from.
fn api_err(kind: RuntimeError) -> Error {
    Error::Runtime {
        chunk: "?".to_string(),
        line: 0,
        kind,
    }
}

/// A runtime error located via the faulting instruction's line info.
fn rt_err(proto: &Proto, pc: usize, kind: RuntimeError) -> Error {
    Error::Runtime {
        chunk: proto.chunk_name().to_string(),
        line: proto.line_at(pc),
        kind,
    }
}

/// Runs the prototype at `func_idx` to completion.
fn execute(st: &mut State, func_idx: usize, n_args: usize, n_results: usize) -> Result<(), Error> {
    let callee = st.stack[func_idx];
    let mut fun: *const Proto = match callee.as_proto_obj() {
        Some(p) => p,
        None => unreachable!(),
    };
    st.frames
        .push(CallInfo::new(core::ptr::null(), 0, st.base, n_results.min(255) as u8));
    let mut base = func_idx + 1;
    st.base = base;
    st.ensure_stack(base + FRAME_SLOTS);
    // Safety: prototypes are frozen before they become values and owned by
    // the state, which outlives this loop; `fun` always points at one, and
    // nothing mutates a frozen prototype.
    let num_params = unsafe { (*fun).num_params() } as usize;
    for i in n_args..num_params {
        st.stack[base + i] = Value::nil();
    }
    let mut pc: usize = 0;

    loop {
        let proto = unsafe { &*fun };
        let ins = proto.ins()[pc];
        let i_pc = pc;
        pc += 1;
        trace!(pc = i_pc, "dispatch {ins}");
        let (a, d) = (ins.a() as usize, ins.d() as usize);
        match ins.op() {
            Op::NOP => {}

            Op::MOV => st.stack[base + a] = st.stack[base + d],
            Op::KPRIM => st.stack[base + a] = Value::prim(ins.d() as u8),
            Op::KINT => st.stack[base + a] = Value::num(ins.d() as i16 as f64),
            Op::KNUM | Op::KSTR | Op::KFN => st.stack[base + a] = proto.k()[d],
            Op::KNIL => {
                for i in a..=d {
                    st.stack[base + i] = Value::nil();
                }
            }

            Op::NEG => {
                let v = st.stack[base + d];
                match v.as_num() {
                    Some(n) => st.stack[base + a] = Value::num(-n),
                    None => {
                        return Err(rt_err(proto, i_pc, RuntimeError::Negate(v.type_name())))
                    }
                }
            }
            Op::NOT => {
                st.stack[base + a] = Value::from_bool(!st.stack[base + d].compares_true())
            }

            Op::ADDVV => arith_vv(st, proto, base, i_pc, ins, "add", |x, y| x + y)?,
            Op::SUBVV => arith_vv(st, proto, base, i_pc, ins, "subtract", |x, y| x - y)?,
            Op::MULVV => arith_vv(st, proto, base, i_pc, ins, "multiply", |x, y| x * y)?,
            Op::DIVVV => arith_vv(st, proto, base, i_pc, ins, "divide", |x, y| x / y)?,
            Op::MODVV => arith_vv(st, proto, base, i_pc, ins, "take modulo of", number_mod)?,
            Op::ADDVN => arith_vn(st, proto, base, i_pc, ins, "add", |x, y| x + y)?,
            Op::SUBVN => arith_vn(st, proto, base, i_pc, ins, "subtract", |x, y| x - y)?,
            Op::MULVN => arith_vn(st, proto, base, i_pc, ins, "multiply", |x, y| x * y)?,
            Op::DIVVN => arith_vn(st, proto, base, i_pc, ins, "divide", |x, y| x / y)?,
            Op::MODVN => arith_vn(st, proto, base, i_pc, ins, "take modulo of", number_mod)?,
            Op::SUBNV => arith_nv(st, proto, base, i_pc, ins, "subtract", |x, y| x - y)?,
            Op::DIVNV => arith_nv(st, proto, base, i_pc, ins, "divide", |x, y| x / y)?,
            Op::MODNV => arith_nv(st, proto, base, i_pc, ins, "take modulo of", number_mod)?,
            Op::POW => arith_vv(st, proto, base, i_pc, ins, "raise", f64::powf)?,

            Op::CONCAT => {
                let (b, c) = (ins.b() as usize, ins.c() as usize);
                let mut len = 0;
                for i in b..=c {
                    let v = st.stack[base + i];
                    match v.as_str_obj() {
                        Some(s) => len += s.len(),
                        None => {
                            return Err(rt_err(
                                proto,
                                i_pc,
                                RuntimeError::Concat(v.type_name()),
                            ))
                        }
                    }
                }
                let mut buf = Vec::with_capacity(len);
                for i in b..=c {
                    let v = st.stack[base + i];
                    if let Some(s) = v.as_str_obj() {
                        buf.extend_from_slice(s.as_bytes());
                    }
                }
                let out = st.alloc_str(&buf);
                st.stack[base + a] = out;
            }

            Op::IST => {
                if !st.stack[base + d].compares_true() {
                    pc += 1;
                }
            }
            Op::ISF => {
                if st.stack[base + d].compares_true() {
                    pc += 1;
                }
            }
            Op::ISTC => {
                let v = st.stack[base + d];
                if v.compares_true() {
                    st.stack[base + a] = v;
                } else {
                    pc += 1;
                }
            }
            Op::ISFC => {
                let v = st.stack[base + d];
                if !v.compares_true() {
                    st.stack[base + a] = v;
                } else {
                    pc += 1;
                }
            }

            Op::EQVV => {
                if !value_eq(st.stack[base + a], st.stack[base + d]) {
                    pc += 1;
                }
            }
            Op::NEQVV => {
                if value_eq(st.stack[base + a], st.stack[base + d]) {
                    pc += 1;
                }
            }
            Op::EQVP => {
                if st.stack[base + a] != Value::prim(ins.d() as u8) {
                    pc += 1;
                }
            }
            Op::NEQVP => {
                if st.stack[base + a] == Value::prim(ins.d() as u8) {
                    pc += 1;
                }
            }
            Op::EQVN | Op::EQVS => {
                if !value_eq(st.stack[base + a], proto.k()[d]) {
                    pc += 1;
                }
            }
            Op::NEQVN | Op::NEQVS => {
                if value_eq(st.stack[base + a], proto.k()[d]) {
                    pc += 1;
                }
            }

            Op::LTVV => ord_vv(st, proto, base, i_pc, ins, &mut pc, |x, y| x < y)?,
            Op::LEVV => ord_vv(st, proto, base, i_pc, ins, &mut pc, |x, y| x <= y)?,
            Op::GTVV => ord_vv(st, proto, base, i_pc, ins, &mut pc, |x, y| x > y)?,
            Op::GEVV => ord_vv(st, proto, base, i_pc, ins, &mut pc, |x, y| x >= y)?,
            Op::LTVN => ord_vn(st, proto, base, i_pc, ins, &mut pc, |x, y| x < y)?,
            Op::LEVN => ord_vn(st, proto, base, i_pc, ins, &mut pc, |x, y| x <= y)?,
            Op::GTVN => ord_vn(st, proto, base, i_pc, ins, &mut pc, |x, y| x > y)?,
            Op::GEVN => ord_vn(st, proto, base, i_pc, ins, &mut pc, |x, y| x >= y)?,

            Op::JMP => {
                let off = ins.e() as i64 - JMP_BIAS as i64;
                pc = (i_pc as i64 + off) as usize;
            }

            Op::CALL => {
                let nargs = ins.b() as usize;
                let nres = ins.c();
                let target = st.stack[base + a];
                match target.obj_tag() {
                    Some(ObjTag::Proto) => {
                        trace!(callee = ?target, "call");
                        st.frames.push(CallInfo::new(fun, pc, base, nres));
                        fun = match target.as_proto_obj() {
                            Some(p) => p,
                            None => unreachable!(),
                        };
                        base = base + a + 1;
                        st.base = base;
                        st.ensure_stack(base + FRAME_SLOTS);
                        let np = unsafe { (*fun).num_params() } as usize;
                        for i in nargs..np {
                            st.stack[base + i] = Value::nil();
                        }
                        pc = 0;
                    }
                    Some(ObjTag::Native) => {
                        let imp = match target.as_native_obj() {
                            Some(n) => n.imp(),
                            None => unreachable!(),
                        };
                        let nret = imp(st, base + a + 1, nargs)
                            .map_err(|k| rt_err(proto, i_pc, k))?;
                        for i in nret..nres as usize {
                            st.stack[base + a + i] = Value::nil();
                        }
                    }
                    _ => {
                        return Err(rt_err(
                            proto,
                            i_pc,
                            RuntimeError::NotCallable(target.type_name()),
                        ))
                    }
                }
            }

            Op::RET0 | Op::RET1 | Op::RET => {
                let (src, count) = match ins.op() {
                    Op::RET0 => (0, 0),
                    Op::RET1 => (ins.e() as usize, 1),
                    _ => (a, d),
                };
                let ci = match st.frames.pop() {
                    Some(ci) => ci,
                    None => return Ok(()),
                };
                let dst = base - 1;
                let expected = ci.expected() as usize;
                for i in 0..expected {
                    st.stack[dst + i] = if i < count {
                        st.stack[base + src + i]
                    } else {
                        Value::nil()
                    };
                }
                trace!(results = count, expected, "return");
                if ci.func().is_null() {
                    st.base = ci.base();
                    st.top = dst + expected;
                    return Ok(());
                }
                fun = ci.func();
                pc = ci.pc();
                base = ci.base();
                st.base = base;
            }
        }
    }
}

/// Equality as observed by `==`: numbers by numeric value, strings by
/// contents, everything else by identity.
fn value_eq(x: Value, y: Value) -> bool {
    if x.is_num() && y.is_num() {
        return x.as_num_unchecked() == y.as_num_unchecked();
    }
    if let (Some(a), Some(b)) = (x.as_str_obj(), y.as_str_obj()) {
        return a.eq_bytes(b);
    }
    x == y
}

fn arith_nums(
    x: Value,
    y: Value,
    verb: &'static str,
) -> Result<(f64, f64), RuntimeError> {
    if x.is_num() && y.is_num() {
        Ok((x.as_num_unchecked(), y.as_num_unchecked()))
    } else {
        Err(RuntimeError::BinaryType {
            op: verb,
            lhs: x.type_name(),
            rhs: y.type_name(),
        })
    }
}

fn arith_vv(
    st: &mut State,
    proto: &Proto,
    base: usize,
    pc: usize,
    ins: Instruction,
    verb: &'static str,
    f: fn(f64, f64) -> f64,
) -> Result<(), Error> {
    let x = st.stack[base + ins.b() as usize];
    let y = st.stack[base + ins.c() as usize];
    let (x, y) = arith_nums(x, y, verb).map_err(|k| rt_err(proto, pc, k))?;
    st.stack[base + ins.a() as usize] = Value::num(f(x, y));
    Ok(())
}

fn arith_vn(
    st: &mut State,
    proto: &Proto,
    base: usize,
    pc: usize,
    ins: Instruction,
    verb: &'static str,
    f: fn(f64, f64) -> f64,
) -> Result<(), Error> {
    let x = st.stack[base + ins.b() as usize];
    let y = proto.k()[ins.c() as usize];
    let (x, y) = arith_nums(x, y, verb).map_err(|k| rt_err(proto, pc, k))?;
    st.stack[base + ins.a() as usize] = Value::num(f(x, y));
    Ok(())
}

fn arith_nv(
    st: &mut State,
    proto: &Proto,
    base: usize,
    pc: usize,
    ins: Instruction,
    verb: &'static str,
    f: fn(f64, f64) -> f64,
) -> Result<(), Error> {
    let x = proto.k()[ins.b() as usize];
    let y = st.stack[base + ins.c() as usize];
    let (x, y) = arith_nums(x, y, verb).map_err(|k| rt_err(proto, pc, k))?;
    st.stack[base + ins.a() as usize] = Value::num(f(x, y));
    Ok(())
}

fn ord_cond(
    proto: &Proto,
    pc: usize,
    x: Value,
    y: Value,
    f: fn(f64, f64) -> bool,
) -> Result<bool, Error> {
    if x.is_num() && y.is_num() {
        Ok(f(x.as_num_unchecked(), y.as_num_unchecked()))
    } else {
        Err(rt_err(
            proto,
            pc,
            RuntimeError::Compare(x.type_name(), y.type_name()),
        ))
    }
}

fn ord_vv(
    st: &State,
    proto: &Proto,
    base: usize,
    i_pc: usize,
    ins: Instruction,
    pc: &mut usize,
    f: fn(f64, f64) -> bool,
) -> Result<(), Error> {
    let x = st.stack[base + ins.a() as usize];
    let y = st.stack[base + ins.d() as usize];
    if !ord_cond(proto, i_pc, x, y, f)? {
        *pc += 1;
    }
    Ok(())
}

fn ord_vn(
    st: &State,
    proto: &Proto,
    base: usize,
    i_pc: usize,
    ins: Instruction,
    pc: &mut usize,
    f: fn(f64, f64) -> bool,
) -> Result<(), Error> {
    let x = st.stack[base + ins.a() as usize];
    let y = proto.k()[ins.d() as usize];
    if !ord_cond(proto, i_pc, x, y, f)? {
        *pc += 1;
    }
    Ok(())
}
