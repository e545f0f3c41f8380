//! Per-function emitter: bytecode buffer, constant pool, register
//! allocation and instruction selection.
//!
//! Slots are handed out from a bump counter (`num_stack`) and released in
//! strict stack order; a slot is only reclaimed when it is both the current
//! top and above the committed locals. Between statements the parser resets
//! the counter back to the locals, which keeps every statement's
//! temporaries transient.

use std::collections::HashMap;
use std::mem;
use std::rc::Rc;

use luaj_asm::{Instruction, Op, NO_SLOT};
use tracing::debug;

use crate::compiler::expr::{BinOp, ExprDesc, ExprKind};
use crate::consts::{MAX_CONSTS, MAX_LOCALS, MAX_SLOTS};
use crate::error::{Error, SyntaxError};
use crate::object::Proto;
use crate::state::State;
use crate::value::{number_mod, Value, TAG_FALSE, TAG_TRUE};

/// Lexical block scope.
#[derive(Debug)]
pub(crate) struct BlockScope {
    /// Number of committed locals at entry; restored on exit.
    pub first_local: u32,
    /// Whether `break` may target this scope.
    pub is_loop: bool,
    /// Jump list of `break`s out of this scope.
    pub breaks: Option<usize>,
}

/// Compilation state of one function scope.
#[derive(Debug)]
pub(crate) struct FuncState {
    pub chunk_name: Rc<str>,
    pub name: Option<String>,
    pub start_line: u32,
    pub num_params: u8,
    pub ins: Vec<Instruction>,
    pub line_info: Vec<u32>,
    pub k: Vec<Value>,
    num_map: HashMap<u64, u16>,
    str_map: HashMap<String, u16>,
    fn_map: HashMap<u64, u16>,
    /// Live register top.
    pub num_stack: u32,
    /// Committed local names, indexed by slot.
    pub locals: Vec<String>,
    pub blocks: Vec<BlockScope>,
    /// Source line of the last consumed token; stamped on emissions.
    pub line: u32,
    /// Source column of the last consumed token; used by emitter errors.
    pub col: u32,
}

impl FuncState {
    pub fn new(chunk_name: Rc<str>, name: Option<String>, start_line: u32) -> Self {
        Self {
            chunk_name,
            name,
            start_line,
            num_params: 0,
            ins: Vec::new(),
            line_info: Vec::new(),
            k: Vec::new(),
            num_map: HashMap::new(),
            str_map: HashMap::new(),
            fn_map: HashMap::new(),
            num_stack: 0,
            locals: Vec::new(),
            blocks: Vec::new(),
            line: start_line,
            col: 1,
        }
    }

    pub fn err(&self, kind: SyntaxError) -> Error {
        Error::Syntax {
            chunk: self.chunk_name.to_string(),
            line: self.line,
            col: self.col,
            kind,
        }
    }

    /// Next instruction position.
    pub fn pc(&self) -> usize {
        self.ins.len()
    }

    /// Appends an instruction, stamping the current source line.
    pub fn emit(&mut self, ins: Instruction) -> usize {
        let pc = self.ins.len();
        self.ins.push(ins);
        self.line_info.push(self.line);
        pc
    }

    /// Freezes the scope into a prototype owned by the state.
    pub fn finish(self, st: &mut State, end_line: u32) -> Value {
        let mut fs = self;
        fs.emit(Instruction::new_ad(Op::RET0, 0, 0));
        debug!(
            chunk = %fs.chunk_name,
            name = fs.name.as_deref().unwrap_or("?"),
            instructions = fs.ins.len(),
            constants = fs.k.len(),
            "function frozen"
        );
        let proto = Proto::new(
            fs.name.map(String::into_boxed_str),
            fs.chunk_name,
            fs.start_line,
            end_line,
            fs.num_params,
            fs.ins,
            fs.line_info,
            fs.k,
        );
        st.alloc_proto(proto)
    }

    // ---- locals and scopes ------------------------------------------------

    pub fn num_locals(&self) -> u32 {
        self.locals.len() as u32
    }

    pub fn define_local(&mut self, name: String) -> Result<(), Error> {
        self.check_local_room(1)?;
        self.locals.push(name);
        Ok(())
    }

    /// Checks that `extra` more locals would stay within the limit; done
    /// before a declaration's right-hand side so the locals ceiling is
    /// reported ahead of the slot ceiling.
    pub fn check_local_room(&self, extra: usize) -> Result<(), Error> {
        if self.locals.len() + extra > MAX_LOCALS {
            return Err(self.err(SyntaxError::TooManyLocals));
        }
        Ok(())
    }

    /// Innermost local with this name, honouring shadowing.
    pub fn lookup_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().rposition(|n| n == name).map(|i| i as u8)
    }

    pub fn scope_begin(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            first_local: self.num_locals(),
            is_loop,
            breaks: None,
        });
    }

    pub fn scope_end(&mut self) -> Result<(), Error> {
        let bs = match self.blocks.pop() {
            Some(bs) => bs,
            None => unreachable!("scope_end without scope_begin"),
        };
        self.locals.truncate(bs.first_local as usize);
        self.num_stack = self.num_locals();
        self.patch_to_here(bs.breaks)
    }

    /// Registers a `break` against the nearest enclosing loop scope.
    pub fn add_break(&mut self) -> Result<(), Error> {
        let idx = match self.blocks.iter().rposition(|b| b.is_loop) {
            Some(idx) => idx,
            None => return Err(self.err(SyntaxError::NoLoopToBreak)),
        };
        let j = self.emit_jmp();
        let mut head = self.blocks[idx].breaks.take();
        self.append_jmp(&mut head, Some(j))?;
        self.blocks[idx].breaks = head;
        Ok(())
    }

    // ---- constant pool ----------------------------------------------------

    pub fn const_num(&mut self, n: f64) -> Result<u16, Error> {
        let bits = n.to_bits();
        if let Some(&i) = self.num_map.get(&bits) {
            return Ok(i);
        }
        if self.k.len() >= MAX_CONSTS {
            return Err(self.err(SyntaxError::TooManyConstants));
        }
        let i = self.k.len() as u16;
        self.k.push(Value::num(n));
        self.num_map.insert(bits, i);
        Ok(i)
    }

    pub fn const_str(&mut self, st: &mut State, s: &str) -> Result<u16, Error> {
        if let Some(&i) = self.str_map.get(s) {
            return Ok(i);
        }
        if self.k.len() >= MAX_CONSTS {
            return Err(self.err(SyntaxError::TooManyConstants));
        }
        let v = st.alloc_str(s.as_bytes());
        let i = self.k.len() as u16;
        self.k.push(v);
        self.str_map.insert(s.to_string(), i);
        Ok(i)
    }

    pub fn const_fn(&mut self, v: Value) -> Result<u16, Error> {
        let bits = v.to_bits();
        if let Some(&i) = self.fn_map.get(&bits) {
            return Ok(i);
        }
        if self.k.len() >= MAX_CONSTS {
            return Err(self.err(SyntaxError::TooManyConstants));
        }
        let i = self.k.len() as u16;
        self.k.push(v);
        self.fn_map.insert(bits, i);
        Ok(i)
    }

    /// Pool index of a number constant if it fits an 8-bit operand and the
    /// pool has room; otherwise the caller materialises the value.
    fn inline_uint8_num(&mut self, e: &ExprDesc) -> Option<u8> {
        let n = e.as_num_nojump()?;
        match self.const_num(n) {
            Ok(i) if i <= u8::MAX as u16 => Some(i as u8),
            _ => None,
        }
    }

    /// Pool index of a number constant for a 16-bit operand.
    fn inline_uint16_num(&mut self, e: &ExprDesc) -> Option<u16> {
        let n = e.as_num_nojump()?;
        self.const_num(n).ok()
    }

    // ---- register allocation ----------------------------------------------

    /// Claims `n` fresh slots on top of the stack.
    pub fn reserve(&mut self, n: u32) -> Result<(), Error> {
        self.num_stack += n;
        if self.num_stack > MAX_SLOTS {
            return Err(self.err(SyntaxError::TooComplex));
        }
        Ok(())
    }

    /// Releases a slot if it is a temporary on top of the stack. Locals and
    /// interior slots stay put.
    pub fn free_slot(&mut self, s: u8) {
        let s = s as u32;
        if s >= self.num_locals() && s != NO_SLOT as u32 {
            self.num_stack -= 1;
            debug_assert_eq!(s, self.num_stack, "freed slot is not the stack top");
        }
    }

    pub fn free_expr(&mut self, e: &ExprDesc) {
        if let ExprKind::NonReloc(s) = e.kind {
            self.free_slot(s);
        }
    }

    /// Releases both operands' temporaries, top first.
    pub fn free_operands(&mut self, a: &ExprDesc, b: &ExprDesc) {
        let sa = match a.kind {
            ExprKind::NonReloc(s) => Some(s),
            _ => None,
        };
        let sb = match b.kind {
            ExprKind::NonReloc(s) => Some(s),
            _ => None,
        };
        match (sa, sb) {
            (Some(x), Some(y)) => {
                self.free_slot(x.max(y));
                self.free_slot(x.min(y));
            }
            (Some(x), None) => self.free_slot(x),
            (None, Some(y)) => self.free_slot(y),
            (None, None) => {}
        }
    }

    // ---- expression sinks -------------------------------------------------

    /// Normalises variable-like variants: a local references its own slot,
    /// a call its base slot.
    pub fn discharge(&mut self, e: &mut ExprDesc) {
        match e.kind {
            ExprKind::Local(s) => e.kind = ExprKind::NonReloc(s),
            ExprKind::Call(pc) => e.kind = ExprKind::NonReloc(self.ins[pc].a()),
            _ => {}
        }
    }

    /// Materialises the expression's plain value into `dst`, ignoring any
    /// pending jump lists. `Jmp` descriptors are left alone for the caller.
    pub fn discharge_to_slot(
        &mut self,
        st: &mut State,
        e: &mut ExprDesc,
        dst: u8,
    ) -> Result<(), Error> {
        self.discharge(e);
        match &e.kind {
            ExprKind::Prim(t) => {
                self.emit(Instruction::new_ad(Op::KPRIM, dst, *t as u16));
            }
            ExprKind::Num(n) => {
                match small_int(*n) {
                    Some(d) => self.emit(Instruction::new_ad(Op::KINT, dst, d)),
                    None => {
                        let idx = self.const_num(*n)?;
                        self.emit(Instruction::new_ad(Op::KNUM, dst, idx))
                    }
                };
            }
            ExprKind::Str(s) => {
                let s = s.clone();
                let idx = self.const_str(st, &s)?;
                self.emit(Instruction::new_ad(Op::KSTR, dst, idx));
            }
            ExprKind::Reloc(pc) => {
                self.ins[*pc].set_a(dst);
            }
            ExprKind::NonReloc(s) => {
                if *s != dst {
                    let s = *s;
                    self.emit(Instruction::new_ad(Op::MOV, dst, s as u16));
                }
            }
            ExprKind::Jmp(_) => return Ok(()),
            ExprKind::Local(_) | ExprKind::Call(_) => unreachable!("discharged above"),
        }
        e.kind = ExprKind::NonReloc(dst);
        Ok(())
    }

    /// Forces the expression's value into `dst`, synthesising boolean
    /// true/false tails when a pending jump carries no value of its own.
    pub fn to_slot(&mut self, st: &mut State, e: &mut ExprDesc, dst: u8) -> Result<(), Error> {
        self.discharge_to_slot(st, e, dst)?;
        if let ExprKind::Jmp(pc) = e.kind {
            let pc = Some(pc);
            self.append_jmp(&mut e.true_list, pc)?;
        }
        if e.has_jumps() {
            let (mut jfalse, mut jtrue) = (None, None);
            if self.needs_fall_through(e.true_list) || self.needs_fall_through(e.false_list) {
                let jval = match e.kind {
                    ExprKind::Jmp(_) => None,
                    _ => Some(self.emit_jmp()),
                };
                jfalse = Some(self.pc());
                self.emit(Instruction::new_ad(Op::KPRIM, dst, TAG_FALSE as u16));
                let jskip = self.emit_jmp();
                jtrue = Some(self.pc());
                self.emit(Instruction::new_ad(Op::KPRIM, dst, TAG_TRUE as u16));
                let end = self.pc();
                self.patch_jmp(jskip, end)?;
                if let Some(j) = jval {
                    self.patch_jmp(j, end)?;
                }
            }
            let end = self.pc();
            let flist = e.false_list.take();
            let tlist = e.true_list.take();
            self.patch_jmps_and_vals(flist, end, Some(dst), jfalse.unwrap_or(end))?;
            self.patch_jmps_and_vals(tlist, end, Some(dst), jtrue.unwrap_or(end))?;
        }
        e.true_list = None;
        e.false_list = None;
        e.kind = ExprKind::NonReloc(dst);
        Ok(())
    }

    /// Frees the expression's temporary, claims the next slot and forces
    /// the value there.
    pub fn to_next_slot(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<u8, Error> {
        self.discharge(e);
        self.free_expr(e);
        self.reserve(1)?;
        let dst = (self.num_stack - 1) as u8;
        self.to_slot(st, e, dst)?;
        Ok(dst)
    }

    /// Leaves the expression wherever it already lives if possible,
    /// otherwise moves it to the next slot. Returns the slot.
    pub fn to_any_slot(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<u8, Error> {
        self.discharge(e);
        if let ExprKind::NonReloc(s) = e.kind {
            if !e.has_jumps() {
                return Ok(s);
            }
            if s as u32 >= self.num_locals() {
                self.to_slot(st, e, s)?;
                return Ok(s);
            }
        }
        self.to_next_slot(st, e)
    }

    /// Collapses the expression to a value-producing variant: constants are
    /// kept symbolic, anything carrying jumps is materialised.
    pub fn to_val(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<(), Error> {
        if e.has_jumps() {
            self.to_any_slot(st, e)?;
        } else {
            self.discharge(e);
        }
        Ok(())
    }

    /// Stores the expression into a local's slot (assignment sink).
    pub fn store_local(&mut self, st: &mut State, e: &mut ExprDesc, slot: u8) -> Result<(), Error> {
        self.free_expr(e);
        self.to_slot(st, e, slot)
    }

    // ---- branches ---------------------------------------------------------

    /// Emits a conditional branch on the expression: `ISTC` when `cond`
    /// (fires on truth), `ISFC` otherwise. Returns the pc of the `JMP`.
    fn emit_branch(&mut self, st: &mut State, e: &mut ExprDesc, cond: bool) -> Result<usize, Error> {
        if !matches!(e.kind, ExprKind::NonReloc(_)) {
            self.reserve(1)?;
            let dst = (self.num_stack - 1) as u8;
            self.discharge_to_slot(st, e, dst)?;
        }
        let slot = match e.kind {
            ExprKind::NonReloc(s) => s,
            _ => unreachable!("branch operand not materialised"),
        };
        self.free_expr(e);
        let op = if cond { Op::ISTC } else { Op::ISFC };
        self.emit(Instruction::new_ad(op, NO_SLOT, slot as u16));
        Ok(self.emit_jmp())
    }

    /// Branches taken when the expression is false; used by `and` and by
    /// conditions. Grows the false list, resolves the true list here.
    pub fn emit_branch_true(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<(), Error> {
        self.discharge(e);
        let pc = match &e.kind {
            ExprKind::Str(_) | ExprKind::Num(_) => None,
            ExprKind::Prim(t) if *t == TAG_TRUE => None,
            ExprKind::Jmp(j) => {
                let j = *j;
                self.invert_cond(j);
                Some(j)
            }
            ExprKind::Prim(_) => {
                // always-false operand: drop the value, jump unconditionally
                self.discharge_to_slot(st, e, NO_SLOT)?;
                Some(self.emit_jmp())
            }
            _ => Some(self.emit_branch(st, e, false)?),
        };
        self.append_jmp(&mut e.false_list, pc)?;
        let tlist = e.true_list.take();
        self.patch_to_here(tlist)?;
        Ok(())
    }

    /// Branches taken when the expression is true; used by `or`. Grows the
    /// true list, resolves the false list here.
    pub fn emit_branch_false(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<(), Error> {
        self.discharge(e);
        let pc = match &e.kind {
            ExprKind::Prim(t) if *t != TAG_TRUE => None,
            ExprKind::Jmp(j) => Some(*j),
            ExprKind::Prim(_) | ExprKind::Str(_) | ExprKind::Num(_) => {
                self.discharge_to_slot(st, e, NO_SLOT)?;
                Some(self.emit_jmp())
            }
            _ => Some(self.emit_branch(st, e, true)?),
        };
        self.append_jmp(&mut e.true_list, pc)?;
        let flist = e.false_list.take();
        self.patch_to_here(flist)?;
        Ok(())
    }

    // ---- operators --------------------------------------------------------

    /// Pre-emits the left operand into the shape the operator's emitter
    /// expects; for `and`/`or` this is where the short-circuit branch goes.
    pub fn emit_binop_left(
        &mut self,
        st: &mut State,
        op: BinOp,
        e: &mut ExprDesc,
    ) -> Result<(), Error> {
        match op {
            BinOp::And => self.emit_branch_true(st, e),
            BinOp::Or => self.emit_branch_false(st, e),
            BinOp::Concat => {
                self.to_next_slot(st, e)?;
                Ok(())
            }
            BinOp::Eq | BinOp::Ne => {
                if !e.is_const_nojump() {
                    self.to_any_slot(st, e)?;
                }
                Ok(())
            }
            _ => {
                if e.as_num_nojump().is_none() {
                    self.to_any_slot(st, e)?;
                }
                Ok(())
            }
        }
    }

    /// Completes a binary operation; the result replaces `l`.
    pub fn emit_binop(
        &mut self,
        st: &mut State,
        op: BinOp,
        l: &mut ExprDesc,
        r: &mut ExprDesc,
    ) -> Result<(), Error> {
        match op {
            BinOp::And => {
                debug_assert!(l.true_list.is_none(), "unresolved true list across 'and'");
                self.discharge(r);
                let absorbed = l.false_list.take();
                self.append_jmp(&mut r.false_list, absorbed)?;
                mem::swap(l, r);
                Ok(())
            }
            BinOp::Or => {
                debug_assert!(l.false_list.is_none(), "unresolved false list across 'or'");
                self.discharge(r);
                let absorbed = l.true_list.take();
                self.append_jmp(&mut r.true_list, absorbed)?;
                mem::swap(l, r);
                Ok(())
            }
            BinOp::Concat => self.emit_concat(st, l, r),
            BinOp::Eq | BinOp::Ne => self.emit_eq(st, op, l, r),
            o if o.is_ordered() => self.emit_comp(st, op, l, r),
            _ => self.emit_arith(st, op, l, r),
        }
    }

    fn emit_arith(
        &mut self,
        st: &mut State,
        op: BinOp,
        l: &mut ExprDesc,
        r: &mut ExprDesc,
    ) -> Result<(), Error> {
        debug_assert!(op.is_arith());
        if let (Some(a), Some(b)) = (l.as_num_nojump(), r.as_num_nojump()) {
            l.kind = ExprKind::Num(arith_fold(op, a, b));
            return Ok(());
        }
        let pc = if op == BinOp::Pow {
            // never inlined: both operands go to slots
            let rc = self.to_any_slot(st, r)?;
            let rb = self.to_any_slot(st, l)?;
            self.free_operands(l, r);
            self.emit(Instruction::new_abc(Op::POW, NO_SLOT, rb, rc))
        } else {
            self.to_val(st, r)?;
            let (opc, rb, rc) = match self.inline_uint8_num(r) {
                Some(kidx) => {
                    let rb = self.to_any_slot(st, l)?;
                    (op.arith_vn(), rb, kidx)
                }
                None => {
                    let rc_slot = self.to_any_slot(st, r)?;
                    self.to_val(st, l)?;
                    match self.inline_uint8_num(l) {
                        Some(kidx) if op.is_commutative() => (op.arith_vn(), rc_slot, kidx),
                        Some(kidx) => (op.arith_nv(), kidx, rc_slot),
                        None => {
                            let rb = self.to_any_slot(st, l)?;
                            (op.arith_vv(), rb, rc_slot)
                        }
                    }
                }
            };
            self.free_operands(l, r);
            self.emit(Instruction::new_abc(opc, NO_SLOT, rb, rc))
        };
        l.kind = ExprKind::Reloc(pc);
        debug_assert!(!l.has_jumps(), "arith operand left jumps unresolved");
        Ok(())
    }

    fn emit_eq(
        &mut self,
        st: &mut State,
        op: BinOp,
        l: &mut ExprDesc,
        r: &mut ExprDesc,
    ) -> Result<(), Error> {
        if l.is_const_nojump() && r.is_const_nojump() {
            let eq = const_equals(&l.kind, &r.kind);
            let truth = eq == (op == BinOp::Eq);
            l.kind = ExprKind::Prim(if truth { TAG_TRUE } else { TAG_FALSE });
            return Ok(());
        }
        // the constant side, if any, goes to the right
        if l.is_const_nojump() {
            mem::swap(l, r);
        }
        let (vv, vp, vn, vs) = if op == BinOp::Eq {
            (Op::EQVV, Op::EQVP, Op::EQVN, Op::EQVS)
        } else {
            (Op::NEQVV, Op::NEQVP, Op::NEQVN, Op::NEQVS)
        };
        let ra = self.to_any_slot(st, l)?;
        self.to_val(st, r)?;
        let ins = match &r.kind {
            ExprKind::Prim(t) => Instruction::new_ad(vp, ra, *t as u16),
            ExprKind::Num(_) => match self.inline_uint16_num(r) {
                Some(idx) => Instruction::new_ad(vn, ra, idx),
                None => {
                    let rd = self.to_any_slot(st, r)?;
                    Instruction::new_ad(vv, ra, rd as u16)
                }
            },
            ExprKind::Str(s) => {
                let s = s.clone();
                let idx = self.const_str(st, &s)?;
                Instruction::new_ad(vs, ra, idx)
            }
            _ => {
                let rd = self.to_any_slot(st, r)?;
                Instruction::new_ad(vv, ra, rd as u16)
            }
        };
        self.free_operands(l, r);
        self.emit(ins);
        let j = self.emit_jmp();
        l.kind = ExprKind::Jmp(j);
        Ok(())
    }

    fn emit_comp(
        &mut self,
        st: &mut State,
        op: BinOp,
        l: &mut ExprDesc,
        r: &mut ExprDesc,
    ) -> Result<(), Error> {
        if let (Some(a), Some(b)) = (l.as_num_nojump(), r.as_num_nojump()) {
            let truth = match op {
                BinOp::Lt => a < b,
                BinOp::Le => a <= b,
                BinOp::Gt => a > b,
                BinOp::Ge => a >= b,
                _ => unreachable!(),
            };
            l.kind = ExprKind::Prim(if truth { TAG_TRUE } else { TAG_FALSE });
            return Ok(());
        }
        let mut op = op;
        if !matches!(l.kind, ExprKind::NonReloc(_) | ExprKind::Local(_)) {
            // constant on the left: swap operands, mirror the operator
            mem::swap(l, r);
            op = op.mirror();
        }
        let ra = self.to_any_slot(st, l)?;
        self.to_val(st, r)?;
        let ins = match self.inline_uint16_num(r) {
            Some(idx) => Instruction::new_ad(op.ord_vn(), ra, idx),
            None => {
                let rd = self.to_any_slot(st, r)?;
                Instruction::new_ad(op.ord_vv(), ra, rd as u16)
            }
        };
        self.free_operands(l, r);
        self.emit(ins);
        let j = self.emit_jmp();
        l.kind = ExprKind::Jmp(j);
        Ok(())
    }

    fn emit_concat(
        &mut self,
        st: &mut State,
        l: &mut ExprDesc,
        r: &mut ExprDesc,
    ) -> Result<(), Error> {
        let ls = match l.kind {
            ExprKind::NonReloc(s) => s,
            _ => unreachable!("concat left operand not materialised"),
        };
        self.to_val(st, r)?;
        // growing a pending CONCAT leftwards folds chains into one opcode
        if let ExprKind::Reloc(pc) = r.kind {
            if self.ins[pc].op() == Op::CONCAT && self.ins[pc].b() == ls + 1 {
                self.free_expr(l);
                self.ins[pc].set_b(ls);
                l.kind = ExprKind::Reloc(pc);
                return Ok(());
            }
        }
        let rs = self.to_next_slot(st, r)?;
        self.free_expr(r);
        self.free_expr(l);
        let pc = self.emit(Instruction::new_abc(Op::CONCAT, NO_SLOT, ls, rs));
        l.kind = ExprKind::Reloc(pc);
        Ok(())
    }

    /// Unary minus.
    pub fn emit_neg(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<(), Error> {
        if let Some(n) = e.as_num_nojump() {
            e.kind = ExprKind::Num(-n);
            return Ok(());
        }
        let s = self.to_any_slot(st, e)?;
        self.free_expr(e);
        e.kind = ExprKind::Reloc(self.emit(Instruction::new_ad(Op::NEG, NO_SLOT, s as u16)));
        Ok(())
    }

    /// Unary `not`. Swaps the jump lists (their values are dropped: `not`
    /// always produces a boolean) and inverts or complements the payload.
    pub fn emit_not(&mut self, st: &mut State, e: &mut ExprDesc) -> Result<(), Error> {
        mem::swap(&mut e.true_list, &mut e.false_list);
        let (t, f) = (e.true_list, e.false_list);
        self.drop_jump_vals(t);
        self.drop_jump_vals(f);
        self.discharge(e);
        match e.kind {
            ExprKind::Prim(t) => {
                e.kind = ExprKind::Prim(if t == TAG_TRUE { TAG_FALSE } else { TAG_TRUE });
            }
            ExprKind::Num(_) | ExprKind::Str(_) => e.kind = ExprKind::Prim(TAG_FALSE),
            ExprKind::Jmp(pc) => self.invert_cond(pc),
            _ => {
                if let ExprKind::Reloc(_) = e.kind {
                    self.reserve(1)?;
                    let dst = (self.num_stack - 1) as u8;
                    self.discharge_to_slot(st, e, dst)?;
                }
                let s = match e.kind {
                    ExprKind::NonReloc(s) => s,
                    _ => unreachable!("'not' operand not materialised"),
                };
                self.free_expr(e);
                e.kind =
                    ExprKind::Reloc(self.emit(Instruction::new_ad(Op::NOT, NO_SLOT, s as u16)));
            }
        }
        Ok(())
    }
}

/// Constant-folding kernel; the same arithmetic the interpreter performs.
fn arith_fold(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => number_mod(a, b),
        BinOp::Pow => a.powf(b),
        _ => unreachable!("not an arithmetic operator"),
    }
}

fn const_equals(a: &ExprKind, b: &ExprKind) -> bool {
    match (a, b) {
        (ExprKind::Prim(x), ExprKind::Prim(y)) => x == y,
        (ExprKind::Num(x), ExprKind::Num(y)) => x == y,
        (ExprKind::Str(x), ExprKind::Str(y)) => x == y,
        _ => false,
    }
}

/// `KINT` payload for a number that is exactly a small integer. The bit
/// comparison keeps `-0.0` out (it must round-trip through the pool).
fn small_int(n: f64) -> Option<u16> {
    let i = n as i64;
    if (i as f64).to_bits() == n.to_bits() && (i16::MIN as i64..=i16::MAX as i64).contains(&i) {
        Some(i as i16 as u16)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FuncState {
        FuncState::new("test".into(), None, 1)
    }

    #[test]
    fn small_int_bounds() {
        assert_eq!(small_int(0.0), Some(0));
        assert_eq!(small_int(-1.0), Some(-1i16 as u16));
        assert_eq!(small_int(32767.0), Some(32767));
        assert_eq!(small_int(-32768.0), Some(-32768i16 as u16));
        assert_eq!(small_int(32768.0), None);
        assert_eq!(small_int(0.5), None);
        assert_eq!(small_int(-0.0), None);
        assert_eq!(small_int(f64::NAN), None);
    }

    #[test]
    fn constants_dedup() {
        let mut f = fs();
        let a = f.const_num(1.5).unwrap();
        let b = f.const_num(1.5).unwrap();
        let c = f.const_num(2.5).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(f.k.len(), 2);
        // -0.0 and 0.0 are distinct pool entries
        let z = f.const_num(0.0).unwrap();
        let nz = f.const_num(-0.0).unwrap();
        assert_ne!(z, nz);
    }

    #[test]
    fn slots_free_in_stack_order() {
        let mut f = fs();
        f.reserve(3).unwrap();
        assert_eq!(f.num_stack, 3);
        f.free_slot(2);
        f.free_slot(1);
        assert_eq!(f.num_stack, 1);
    }

    #[test]
    fn locals_are_never_freed() {
        let mut f = fs();
        f.define_local("x".into()).unwrap();
        f.reserve(1).unwrap();
        f.num_stack = 1;
        f.free_slot(0);
        assert_eq!(f.num_stack, 1);
    }

    #[test]
    fn too_many_locals() {
        let mut f = fs();
        for i in 0..MAX_LOCALS {
            f.define_local(format!("v{i}")).unwrap();
        }
        let err = f.define_local("overflow".into()).unwrap_err();
        assert!(err.to_string().contains("too many local variables"));
    }

    #[test]
    fn fold_matches_runtime_semantics() {
        assert_eq!(arith_fold(BinOp::Pow, 2.0, 9.0), 512.0);
        assert_eq!(arith_fold(BinOp::Mod, -5.0, 3.0), 1.0);
        assert_eq!(arith_fold(BinOp::Div, 1.0, 0.0), f64::INFINITY);
        assert!(arith_fold(BinOp::Div, 0.0, 0.0).is_nan());
    }
}
