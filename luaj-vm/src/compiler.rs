//! Single-pass compiler: a Pratt expression parser driving the emitter.
//!
//! There is no syntax tree. Operand parsers hand back expression
//! descriptors, operator emitters consume them, and statements keep the
//! register stack balanced: after every statement the live top equals the
//! committed locals.

mod emit;
mod expr;
mod jumps;

use std::io::Read;
use std::mem;

use luaj_asm::{Instruction, Op, NO_SLOT};

use self::emit::FuncState;
use self::expr::{BinOp, ExprDesc, ExprKind, UNARY_PREC};
use crate::error::{Error, SyntaxError};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::state::State;
use crate::value::{Value, TAG_FALSE, TAG_NIL, TAG_TRUE};

/// Compiles one chunk; on success the root prototype is returned as a
/// function value owned by `st`.
pub(crate) fn compile<R: Read>(
    st: &mut State,
    source: R,
    chunk_name: &str,
) -> Result<Value, Error> {
    let mut lex = Lexer::new(source, chunk_name)?;
    let tok = lex.next_token()?;
    let fs = FuncState::new(lex.chunk_name(), None, tok.line);
    let parser = Parser {
        lex,
        tok,
        st,
        fs,
        fstack: Vec::new(),
    };
    parser.parse_chunk()
}

struct Parser<'st, R> {
    lex: Lexer<R>,
    /// One-token lookahead.
    tok: Token,
    st: &'st mut State,
    /// Function scope being compiled.
    fs: FuncState,
    /// Enclosing function scopes.
    fstack: Vec<FuncState>,
}

impl<R: Read> Parser<'_, R> {
    fn parse_chunk(mut self) -> Result<Value, Error> {
        self.fs.scope_begin(false);
        self.parse_block()?;
        if self.tok.kind != TokenKind::Eof {
            return Err(self.unexpected());
        }
        self.fs.scope_end()?;
        let end_line = self.tok.line;
        let Parser { st, fs, .. } = self;
        Ok(fs.finish(st, end_line))
    }

    // ---- token plumbing ---------------------------------------------------

    fn next(&mut self) -> Result<(), Error> {
        self.fs.line = self.tok.line;
        self.fs.col = self.tok.col;
        self.tok = self.lex.next_token()?;
        Ok(())
    }

    fn syntax_err(&self, kind: SyntaxError) -> Error {
        Error::Syntax {
            chunk: self.fs.chunk_name.to_string(),
            line: self.tok.line,
            col: self.tok.col,
            kind,
        }
    }

    fn unexpected(&self) -> Error {
        let described = self.tok.kind.describe();
        self.syntax_err(SyntaxError::UnexpectedSymbol(
            described.trim_matches('\'').to_string(),
        ))
    }

    /// Consumes the expected token or fails with expected/found.
    fn check(&mut self, want: &TokenKind) -> Result<(), Error> {
        if mem::discriminant(&self.tok.kind) == mem::discriminant(want) {
            self.next()
        } else {
            Err(self.syntax_err(SyntaxError::Expected {
                expected: want.describe(),
                found: self.tok.kind.describe(),
            }))
        }
    }

    /// Consumes the token if present.
    fn opt(&mut self, want: &TokenKind) -> Result<bool, Error> {
        if mem::discriminant(&self.tok.kind) == mem::discriminant(want) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn check_ident(&mut self) -> Result<String, Error> {
        match &self.tok.kind {
            TokenKind::Ident(n) => {
                let n = n.clone();
                self.next()?;
                Ok(n)
            }
            _ => Err(self.syntax_err(SyntaxError::Expected {
                expected: "identifier".to_string(),
                found: self.tok.kind.describe(),
            })),
        }
    }

    // ---- statements -------------------------------------------------------

    fn block_follow(&self) -> bool {
        matches!(
            self.tok.kind,
            TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
        )
    }

    /// Statement list up to a block terminator. Scopes are handled by the
    /// callers; temporaries are released after every statement.
    fn parse_block(&mut self) -> Result<(), Error> {
        while !self.block_follow() {
            if self.tok.kind == TokenKind::Return {
                self.parse_return()?;
                self.fs.num_stack = self.fs.num_locals();
                break;
            }
            self.parse_stmt()?;
            debug_assert_eq!(
                self.fs.num_stack,
                self.fs.num_locals(),
                "temporaries left live after a statement"
            );
            self.fs.num_stack = self.fs.num_locals();
        }
        Ok(())
    }

    fn parse_stmt(&mut self) -> Result<(), Error> {
        match self.tok.kind {
            TokenKind::Local => {
                self.next()?;
                self.parse_local()
            }
            TokenKind::If => {
                self.next()?;
                self.parse_if()
            }
            TokenKind::While => {
                self.next()?;
                self.parse_while()
            }
            TokenKind::Repeat => {
                self.next()?;
                self.parse_repeat()
            }
            TokenKind::Do => {
                self.next()?;
                self.fs.scope_begin(false);
                self.parse_block()?;
                self.check(&TokenKind::End)?;
                self.fs.scope_end()
            }
            TokenKind::Break => {
                self.next()?;
                self.fs.add_break()
            }
            TokenKind::Semi => self.next(),
            _ => self.parse_call_assign(),
        }
    }

    fn parse_local(&mut self) -> Result<(), Error> {
        if self.opt(&TokenKind::Function)? {
            let line = self.fs.line;
            let name = self.check_ident()?;
            // the slot and name exist before the body parses, so the name
            // resolves for statements that follow immediately
            let reg = self.fs.num_stack as u8;
            self.fs.define_local(name.clone())?;
            self.fs.reserve(1)?;
            let mut e = self.parse_body(Some(name), line)?;
            self.fs.free_expr(&e);
            self.fs.to_slot(self.st, &mut e, reg)?;
            return Ok(());
        }
        let mut names = vec![self.check_ident()?];
        while self.opt(&TokenKind::Comma)? {
            names.push(self.check_ident()?);
        }
        self.fs.check_local_room(names.len())?;
        let (nexps, mut last) = if self.opt(&TokenKind::Assign)? {
            let (n, e) = self.parse_expr_list()?;
            (n, Some(e))
        } else {
            (0, None)
        };
        self.adjust_assign(names.len() as u32, nexps, last.as_mut())?;
        // names become visible only now, after the right-hand side
        for name in names {
            self.fs.define_local(name)?;
        }
        Ok(())
    }

    /// `name_list = expr_list` tail of an assignment, or a bare call.
    fn parse_call_assign(&mut self) -> Result<(), Error> {
        let e = self.parse_primary_expr()?;
        if let ExprKind::Call(pc) = e.kind {
            if !matches!(self.tok.kind, TokenKind::Assign | TokenKind::Comma) {
                // call statement: discard all results
                self.fs.ins[pc].set_c(0);
                self.fs.num_stack = self.fs.num_locals();
                return Ok(());
            }
        }
        let mut targets = vec![self.assign_target(e)?];
        while self.opt(&TokenKind::Comma)? {
            let e = self.parse_primary_expr()?;
            targets.push(self.assign_target(e)?);
        }
        self.check(&TokenKind::Assign)?;
        let (nexps, mut last) = self.parse_expr_list()?;
        let nvars = targets.len() as u32;
        if nexps == nvars {
            // the last expression goes straight into the last target; a
            // trailing call collapses to its base slot first so the slot
            // can be reclaimed
            self.fs.discharge(&mut last);
            let slot = targets[targets.len() - 1];
            self.fs.store_local(self.st, &mut last, slot)?;
            for i in (0..targets.len() - 1).rev() {
                self.assign_top_to(targets[i])?;
            }
        } else {
            self.adjust_assign(nvars, nexps, Some(&mut last))?;
            for i in (0..targets.len()).rev() {
                self.assign_top_to(targets[i])?;
            }
        }
        self.fs.num_stack = self.fs.num_locals();
        Ok(())
    }

    fn assign_target(&mut self, e: ExprDesc) -> Result<u8, Error> {
        match e.kind {
            ExprKind::Local(s) => Ok(s),
            _ => Err(self.syntax_err(SyntaxError::CannotAssign)),
        }
    }

    /// Moves the value on top of the register stack into a local's slot.
    fn assign_top_to(&mut self, slot: u8) -> Result<(), Error> {
        let top = (self.fs.num_stack - 1) as u8;
        let mut e = ExprDesc::new(ExprKind::NonReloc(top), self.fs.line);
        self.fs.store_local(self.st, &mut e, slot)
    }

    /// Comma-separated expressions; all but the last land in consecutive
    /// slots, the last is returned undischarged.
    fn parse_expr_list(&mut self) -> Result<(u32, ExprDesc), Error> {
        let mut n = 1u32;
        let mut e = self.parse_expr()?;
        while self.opt(&TokenKind::Comma)? {
            self.fs.to_next_slot(self.st, &mut e)?;
            e = self.parse_expr()?;
            n += 1;
        }
        Ok((n, e))
    }

    /// Balances `nvars` targets against `nexps` produced values.
    ///
    /// A trailing call has its expected-result operand rewritten to
    /// `max(0, nvars - nexps + 1)`; otherwise the tail expression closes
    /// into its own slot and missing values are nil-filled. Surplus value
    /// slots are dropped afterwards.
    fn adjust_assign(
        &mut self,
        nvars: u32,
        nexps: u32,
        last: Option<&mut ExprDesc>,
    ) -> Result<(), Error> {
        let extra = nvars as i64 - nexps as i64;
        match last {
            Some(e) if matches!(e.kind, ExprKind::Call(_)) => {
                let pc = match e.kind {
                    ExprKind::Call(pc) => pc,
                    _ => unreachable!(),
                };
                let nrets = (extra + 1).max(0) as u32;
                self.fs.ins[pc].set_c(nrets as u8);
                if nrets > 1 {
                    // results beyond the call's own slot need live slots
                    self.fs.reserve(nrets - 1)?;
                }
            }
            Some(e) => {
                self.fs.to_next_slot(self.st, e)?;
                if extra > 0 {
                    self.nil_fill(extra as u32)?;
                }
            }
            None => {
                if extra > 0 {
                    self.nil_fill(extra as u32)?;
                }
            }
        }
        if nexps > nvars {
            self.fs.num_stack -= nexps - nvars;
        }
        Ok(())
    }

    /// Writes nil into `count` fresh slots: one `KPRIM` for a single slot,
    /// a spanning `KNIL` otherwise.
    fn nil_fill(&mut self, count: u32) -> Result<(), Error> {
        let reg = self.fs.num_stack as u8;
        self.fs.reserve(count)?;
        if count == 1 {
            self.fs
                .emit(Instruction::new_ad(Op::KPRIM, reg, TAG_NIL as u16));
        } else {
            let end = reg as u16 + count as u16 - 1;
            self.fs.emit(Instruction::new_ad(Op::KNIL, reg, end));
        }
        Ok(())
    }

    fn parse_if(&mut self) -> Result<(), Error> {
        let mut end_jumps: Option<usize> = None;
        loop {
            let flist = self.expr_cond()?;
            self.check(&TokenKind::Then)?;
            self.fs.scope_begin(false);
            self.parse_block()?;
            self.fs.scope_end()?;
            match self.tok.kind {
                TokenKind::Elseif => {
                    self.next()?;
                    let j = self.fs.emit_jmp();
                    self.fs.append_jmp(&mut end_jumps, Some(j))?;
                    self.fs.patch_to_here(flist)?;
                }
                TokenKind::Else => {
                    self.next()?;
                    let j = self.fs.emit_jmp();
                    self.fs.append_jmp(&mut end_jumps, Some(j))?;
                    self.fs.patch_to_here(flist)?;
                    self.fs.scope_begin(false);
                    self.parse_block()?;
                    self.fs.scope_end()?;
                    self.check(&TokenKind::End)?;
                    break;
                }
                _ => {
                    self.check(&TokenKind::End)?;
                    self.fs.patch_to_here(flist)?;
                    break;
                }
            }
        }
        self.fs.patch_to_here(end_jumps)
    }

    fn parse_while(&mut self) -> Result<(), Error> {
        let start = self.fs.pc();
        let condexit = self.expr_cond()?;
        self.fs.scope_begin(true);
        self.check(&TokenKind::Do)?;
        self.parse_block()?;
        let j = self.fs.emit_jmp();
        self.fs.patch_jmp(j, start)?;
        self.check(&TokenKind::End)?;
        self.fs.scope_end()?;
        self.fs.patch_to_here(condexit)
    }

    fn parse_repeat(&mut self) -> Result<(), Error> {
        let start = self.fs.pc();
        self.fs.scope_begin(true);
        self.parse_block()?;
        self.check(&TokenKind::Until)?;
        // loop locals stay in scope for the condition
        let condexit = self.expr_cond()?;
        self.fs.patch_jmps(condexit, start)?;
        self.fs.scope_end()
    }

    fn parse_return(&mut self) -> Result<(), Error> {
        self.next()?;
        if self.block_follow() || self.tok.kind == TokenKind::Semi {
            self.fs.emit(Instruction::new_ad(Op::RET0, 0, 0));
        } else {
            let base = self.fs.num_locals() as u8;
            let (n, mut last) = self.parse_expr_list()?;
            if n == 1 {
                let s = self.fs.to_any_slot(self.st, &mut last)?;
                self.fs.emit(Instruction::new_e(Op::RET1, s as u32));
            } else {
                self.fs.to_next_slot(self.st, &mut last)?;
                self.fs.emit(Instruction::new_ad(Op::RET, base, n as u16));
            }
        }
        let _ = self.opt(&TokenKind::Semi)?;
        Ok(())
    }

    /// Condition position: parse, canonicalise nil to false, branch on
    /// falseness. Returns the pending false list.
    fn expr_cond(&mut self) -> Result<Option<usize>, Error> {
        let mut e = self.parse_expr()?;
        if e.kind == ExprKind::Prim(TAG_NIL) {
            e.kind = ExprKind::Prim(TAG_FALSE);
        }
        self.fs.emit_branch_true(self.st, &mut e)?;
        Ok(e.false_list.take())
    }

    // ---- expressions ------------------------------------------------------

    fn parse_expr(&mut self) -> Result<ExprDesc, Error> {
        self.parse_bin_expr(0)
    }

    /// Precedence climbing: operators binding tighter than `limit` are
    /// consumed, the rest left for the enclosing level.
    fn parse_bin_expr(&mut self, limit: u8) -> Result<ExprDesc, Error> {
        let mut left = match self.tok.kind {
            TokenKind::Not => {
                self.next()?;
                let mut e = self.parse_bin_expr(UNARY_PREC)?;
                self.fs.emit_not(self.st, &mut e)?;
                e
            }
            TokenKind::Minus => {
                self.next()?;
                let mut e = self.parse_bin_expr(UNARY_PREC)?;
                self.fs.emit_neg(self.st, &mut e)?;
                e
            }
            _ => self.parse_simple()?,
        };
        while let Some(op) = BinOp::from_token(&self.tok.kind) {
            if op.left_prec() <= limit {
                break;
            }
            self.next()?;
            self.fs.emit_binop_left(self.st, op, &mut left)?;
            let mut right = self.parse_bin_expr(op.right_prec())?;
            self.fs.emit_binop(self.st, op, &mut left, &mut right)?;
        }
        Ok(left)
    }

    fn parse_simple(&mut self) -> Result<ExprDesc, Error> {
        let line = self.tok.line;
        let e = match &self.tok.kind {
            TokenKind::Num(n) => {
                let n = *n;
                self.next()?;
                ExprDesc::new(ExprKind::Num(n), line)
            }
            TokenKind::Str(s) => {
                let s = s.clone();
                self.next()?;
                ExprDesc::new(ExprKind::Str(s), line)
            }
            TokenKind::Nil => {
                self.next()?;
                ExprDesc::new(ExprKind::Prim(TAG_NIL), line)
            }
            TokenKind::True => {
                self.next()?;
                ExprDesc::new(ExprKind::Prim(TAG_TRUE), line)
            }
            TokenKind::False => {
                self.next()?;
                ExprDesc::new(ExprKind::Prim(TAG_FALSE), line)
            }
            TokenKind::Function => {
                self.next()?;
                return self.parse_body(None, line);
            }
            _ => return self.parse_primary_expr(),
        };
        Ok(e)
    }

    /// Identifier or parenthesised expression, followed by call suffixes.
    fn parse_primary_expr(&mut self) -> Result<ExprDesc, Error> {
        let line = self.tok.line;
        let mut e = match &self.tok.kind {
            TokenKind::Ident(n) => {
                let name = n.clone();
                self.next()?;
                self.var_lookup(name, line)?
            }
            TokenKind::LParen => {
                self.next()?;
                let mut e = self.parse_expr()?;
                self.check(&TokenKind::RParen)?;
                // parentheses truncate a call to exactly one value
                self.fs.discharge(&mut e);
                e
            }
            _ => return Err(self.unexpected()),
        };
        while self.tok.kind == TokenKind::LParen {
            e = self.parse_args(e)?;
        }
        Ok(e)
    }

    /// Reverse scan honours shadowing; unknown names fall back to the
    /// builtin registry, loaded through the constant pool.
    fn var_lookup(&mut self, name: String, line: u32) -> Result<ExprDesc, Error> {
        if let Some(slot) = self.fs.lookup_local(&name) {
            return Ok(ExprDesc::new(ExprKind::Local(slot), line));
        }
        if let Some(v) = self.st.builtin(&name) {
            let idx = self.fs.const_fn(v)?;
            let pc = self.fs.emit(Instruction::new_ad(Op::KFN, NO_SLOT, idx));
            return Ok(ExprDesc::new(ExprKind::Reloc(pc), line));
        }
        Err(self.syntax_err(SyntaxError::UndefinedVariable(name)))
    }

    /// Call suffix: callee forced to a fresh slot, arguments stacked above
    /// it, one result expected until a consumer rewrites operand C.
    fn parse_args(&mut self, mut f: ExprDesc) -> Result<ExprDesc, Error> {
        let line = self.tok.line;
        let base = self.fs.to_next_slot(self.st, &mut f)?;
        self.check(&TokenKind::LParen)?;
        let mut nargs: u32 = 0;
        if self.tok.kind != TokenKind::RParen {
            loop {
                let mut a = self.parse_expr()?;
                self.fs.to_next_slot(self.st, &mut a)?;
                nargs += 1;
                if !self.opt(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.check(&TokenKind::RParen)?;
        let pc = self
            .fs
            .emit(Instruction::new_abc(Op::CALL, base, nargs as u8, 1));
        // the call's value lives in its base slot
        self.fs.num_stack = base as u32 + 1;
        Ok(ExprDesc::new(ExprKind::Call(pc), line))
    }

    /// Function literal: parameters become the new scope's first locals,
    /// the frozen prototype lands in the enclosing constant pool.
    fn parse_body(&mut self, name: Option<String>, line: u32) -> Result<ExprDesc, Error> {
        let chunk = self.lex.chunk_name();
        let mut inner = FuncState::new(chunk, name, line);
        inner.line = self.tok.line;
        inner.col = self.tok.col;
        mem::swap(&mut self.fs, &mut inner);
        self.fstack.push(inner);

        self.check(&TokenKind::LParen)?;
        if self.tok.kind != TokenKind::RParen {
            loop {
                let pname = self.check_ident()?;
                self.fs.define_local(pname)?;
                self.fs.reserve(1)?;
                if !self.opt(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.fs.num_params = self.fs.num_locals() as u8;
        self.check(&TokenKind::RParen)?;
        self.fs.scope_begin(false);
        self.parse_block()?;
        self.fs.scope_end()?;
        let end_line = self.tok.line;
        self.check(&TokenKind::End)?;

        let parent = match self.fstack.pop() {
            Some(p) => p,
            None => unreachable!("function scope stack underflow"),
        };
        let child = mem::replace(&mut self.fs, parent);
        let v = child.finish(self.st, end_line);
        let idx = self.fs.const_fn(v)?;
        let pc = self.fs.emit(Instruction::new_ad(Op::KFN, NO_SLOT, idx));
        Ok(ExprDesc::new(ExprKind::Reloc(pc), line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use luaj_asm::JMP_BIAS;

    use crate::object::Proto;

    fn compile_ok(src: &str) -> (State, Value) {
        let mut st = State::new();
        let v = compile(&mut st, src.as_bytes(), "test").expect("compile failed");
        (st, v)
    }

    fn compile_err(src: &str) -> Error {
        let mut st = State::new();
        compile(&mut st, src.as_bytes(), "test").expect_err("compile unexpectedly succeeded")
    }

    fn ops(p: &Proto) -> Vec<Op> {
        p.ins().iter().map(|i| i.op()).collect()
    }

    fn is_arith(op: Op) -> bool {
        matches!(
            op,
            Op::ADDVV
                | Op::SUBVV
                | Op::MULVV
                | Op::DIVVV
                | Op::MODVV
                | Op::ADDVN
                | Op::SUBVN
                | Op::MULVN
                | Op::DIVVN
                | Op::MODVN
                | Op::SUBNV
                | Op::DIVNV
                | Op::MODNV
                | Op::POW
        )
    }

    #[test]
    fn closed_arithmetic_folds_to_one_load() {
        let (_st, v) = compile_ok("local x = 1 + 2 * 3 - 4 / 2");
        let p = v.as_proto_obj().unwrap();
        assert_eq!(ops(p), vec![Op::KINT, Op::RET0]);
        assert_eq!(p.ins()[0].d() as i16, 5);
    }

    #[test]
    fn exponentiation_is_right_associative_when_folding() {
        let (_st, v) = compile_ok("local r = 2^3^2");
        let p = v.as_proto_obj().unwrap();
        assert_eq!(ops(p), vec![Op::KINT, Op::RET0]);
        assert_eq!(p.ins()[0].d() as i16, 512);
    }

    #[test]
    fn unary_minus_binds_looser_than_exponent() {
        let (_st, v) = compile_ok("local r = -2^2");
        let p = v.as_proto_obj().unwrap();
        assert_eq!(p.ins()[0].op(), Op::KINT);
        assert_eq!(p.ins()[0].d() as i16, -4);
    }

    #[test]
    fn constant_equality_folds_to_kprim() {
        for (src, truth) in [
            ("local c = 1 == 1", true),
            ("local c = 1 == 2", false),
            ("local c = 'a' == 'a'", true),
            ("local c = 'a' ~= 'b'", true),
            ("local c = nil == false", false),
            ("local c = 1 == 'a'", false),
        ] {
            let (_st, v) = compile_ok(src);
            let p = v.as_proto_obj().unwrap();
            assert_eq!(ops(p), vec![Op::KPRIM, Op::RET0], "for {src}");
            let want = if truth { TAG_TRUE } else { TAG_FALSE };
            assert_eq!(p.ins()[0].d(), want as u16, "for {src}");
        }
    }

    #[test]
    fn folded_expressions_emit_no_arithmetic() {
        let (_st, v) = compile_ok("local a = (1 + 2) * (3 - 1) ^ 2");
        let p = v.as_proto_obj().unwrap();
        assert!(ops(p).iter().all(|&op| !is_arith(op)));
    }

    #[test]
    fn arith_selects_vn_and_nv_forms() {
        let (_st, v) = compile_ok("local a = 1 local b = a + 1000 local c = 1000 - a");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::ADDVN), "{o:?}");
        assert!(o.contains(&Op::SUBNV), "{o:?}");
    }

    #[test]
    fn commutative_swap_uses_vn_for_left_constant() {
        let (_st, v) = compile_ok("local a = 1 local b = 1000 + a");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::ADDVN), "{o:?}");
        assert!(!o.contains(&Op::ADDVV), "{o:?}");
    }

    #[test]
    fn pow_never_inlines_constants() {
        let (_st, v) = compile_ok("local a = 1 local b = a ^ 2");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::POW));
        // the constant 2 was materialised into a slot first
        assert!(o.contains(&Op::KINT));
    }

    #[test]
    fn and_of_comparisons_materialises_boolean_tails() {
        let (_st, v) = compile_ok("local a = 3 local b = 4 local c = a == 3 and b == 4");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::EQVN));
        let kprims: Vec<_> = p
            .ins()
            .iter()
            .filter(|i| i.op() == Op::KPRIM)
            .map(|i| i.d())
            .collect();
        assert_eq!(kprims, vec![TAG_FALSE as u16, TAG_TRUE as u16]);
    }

    #[test]
    fn and_of_values_keeps_right_operand_value() {
        let (_st, v) = compile_ok("local a = 3 local b = 4 local c = a and b");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::ISFC), "{o:?}");
        // no synthetic true/false tails: the branch carries the value
        assert!(!o.contains(&Op::KPRIM), "{o:?}");
    }

    #[test]
    fn while_emits_one_backward_jump() {
        let (_st, v) = compile_ok("local i = 0 while i < 10 do i = i + 1 end");
        let p = v.as_proto_obj().unwrap();
        assert!(ops(p).contains(&Op::LTVN));
        let back: Vec<_> = p
            .ins()
            .iter()
            .filter(|i| i.op() == Op::JMP && (i.e() as i64) < JMP_BIAS as i64)
            .collect();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn every_jump_lands_inside_the_function() {
        let srcs = [
            "local a = 1 if a == 1 then a = 2 elseif a == 2 then a = 3 else a = 4 end",
            "local i = 0 while i < 3 do if i == 1 then break end i = i + 1 end",
            "local i = 0 repeat i = i + 1 until i > 2",
            "local a = 1 local b = a == 1 and a < 3 or a > 5",
        ];
        for src in srcs {
            let (_st, v) = compile_ok(src);
            let p = v.as_proto_obj().unwrap();
            for (pc, ins) in p.ins().iter().enumerate() {
                if ins.op() == Op::JMP {
                    let dest = pc as i64 + (ins.e() as i64 - JMP_BIAS as i64);
                    assert!(
                        dest >= 0 && dest <= p.ins().len() as i64,
                        "jump at {pc} escapes the function in {src}"
                    );
                }
            }
        }
    }

    #[test]
    fn line_info_is_monotonic_for_straight_line_code() {
        let (_st, v) = compile_ok("local a = 1\nlocal b = 2\nlocal c = a + b\nreturn c");
        let p = v.as_proto_obj().unwrap();
        assert_eq!(p.ins().len(), p.line_info().len());
        let lines = p.line_info();
        assert!(lines.windows(2).all(|w| w[0] <= w[1]), "{lines:?}");
        assert!(lines.iter().all(|&l| l >= 1));
    }

    #[test]
    fn call_statement_expects_zero_results() {
        let (_st, v) = compile_ok("local function f() end f()");
        let p = v.as_proto_obj().unwrap();
        let call = p.ins().iter().find(|i| i.op() == Op::CALL).unwrap();
        assert_eq!(call.c(), 0);
    }

    #[test]
    fn multi_assign_rewrites_call_result_count() {
        let (_st, v) = compile_ok("local function f() return 1, 2 end local x, y, z = f()");
        let p = v.as_proto_obj().unwrap();
        let call = p.ins().iter().find(|i| i.op() == Op::CALL).unwrap();
        assert_eq!(call.c(), 3);
    }

    #[test]
    fn extra_locals_are_nil_filled() {
        let (_st, v) = compile_ok("local a, b, c = 1");
        let p = v.as_proto_obj().unwrap();
        let o = ops(p);
        assert!(o.contains(&Op::KNIL), "{o:?}");
        let (_st, v) = compile_ok("local a, b = 1");
        let p = v.as_proto_obj().unwrap();
        let kprim = p.ins().iter().find(|i| i.op() == Op::KPRIM).unwrap();
        assert_eq!(kprim.d(), TAG_NIL as u16);
    }

    #[test]
    fn concat_chain_is_one_instruction() {
        let (_st, v) = compile_ok("local s = 'a' .. 'b' .. 'c'");
        let p = v.as_proto_obj().unwrap();
        let cats: Vec<_> = p.ins().iter().filter(|i| i.op() == Op::CONCAT).collect();
        assert_eq!(cats.len(), 1);
        let cat = cats[0];
        assert_eq!((cat.c() - cat.b()) + 1, 3, "spans three slots");
    }

    #[test]
    fn nested_function_lands_in_constant_pool() {
        let (_st, v) = compile_ok("local f = function(a, b) return a end");
        let p = v.as_proto_obj().unwrap();
        assert!(ops(p).contains(&Op::KFN));
        let inner = p.k().iter().find_map(|k| k.as_proto_obj()).unwrap();
        assert_eq!(inner.num_params(), 2);
        assert_eq!(inner.chunk_name(), "test");
    }

    #[test]
    fn listing_names_every_instruction() {
        let (_st, v) = compile_ok("local function f(a) return a end local x = f(1)");
        let p = v.as_proto_obj().unwrap();
        let text = p.dump();
        assert!(text.contains("CALL"), "{text}");
        assert!(text.contains("KFN"), "{text}");
        // nested prototypes are listed after their parent
        assert!(text.matches("function test:").count() >= 2, "{text}");
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let err = compile_err("break");
        assert!(err.to_string().contains("no loop to break"), "{err}");
        let err = compile_err("do break end");
        assert!(err.to_string().contains("no loop to break"), "{err}");
    }

    #[test]
    fn break_inside_loop_compiles() {
        compile_ok("while true do break end");
        compile_ok("repeat break until false");
    }

    #[test]
    fn too_many_locals_is_rejected() {
        let mut src = String::new();
        for i in 0..256 {
            src.push_str(&format!("local v{i} = {i}\n"));
        }
        let err = compile_err(&src);
        assert!(
            err.to_string().contains("too many local variables"),
            "{err}"
        );
    }

    #[test]
    fn local_at_eof_reports_expected_identifier() {
        let err = compile_err("local");
        let msg = err.to_string();
        assert!(msg.contains("expected identifier, found end of file"), "{msg}");
    }

    #[test]
    fn undefined_variable_is_a_syntax_error() {
        let err = compile_err("local x = y");
        assert!(err.to_string().contains("undefined variable 'y'"), "{err}");
    }

    #[test]
    fn assignment_to_non_variable_is_rejected() {
        let err = compile_err("print() = 2");
        assert!(err.to_string().contains("cannot assign"), "{err}");
    }

    #[test]
    fn shadowing_resolves_to_innermost_local() {
        let (_st, v) = compile_ok("local a = 1 do local a = 2 a = a + 1 end a = a + 1");
        let p = v.as_proto_obj().unwrap();
        // both additions use ADDVN against slot-local operands
        let adds: Vec<_> = p.ins().iter().filter(|i| i.op() == Op::ADDVN).collect();
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].b(), 1, "inner add reads the shadowing local");
        assert_eq!(adds[1].b(), 0, "outer add reads the original local");
    }

    #[test]
    fn statements_leave_no_temporaries() {
        // parse_block debug-asserts the slot discipline after each statement
        compile_ok(
            "local a = 1 + 2 * 3\n\
             local b = a .. 'x' .. 'y'\n\
             local function f(p) return p end\n\
             f(a)\n\
             local c, d = f(a), f(b)\n\
             a, c = c, a\n\
             if a == 1 and c ~= 2 then a = 2 else a = 3 end\n\
             while a < 10 do a = a + 1 end\n\
             repeat a = a - 1 until a == 0\n\
             return a",
        );
    }
}
