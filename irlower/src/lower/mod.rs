//! The SSA-to-native lowering engine.
//!
//! The driver visits blocks in the order the upstream optimiser dictates (reverse postorder).
//! That order guarantees a predecessor's *native block handle* exists before a successor needs it
//! (handles are forward-declared on first reference), but not that a predecessor's *values* have
//! been translated. Two deferral mechanisms bridge the gap:
//!
//!  * the phi rebuild worklist: a block merging values from a not-yet-started predecessor builds
//!    placeholder phis and records a [NotMergedPhi] per missing edge; one finalisation pass adds
//!    the missing edges (with type coercion) once every block has been translated.
//!  * exception live-in queues: a throwing call site whose handler has not been translated yet
//!    appends a snapshot of the handler's live-in values to the handler's queue; the handler
//!    drains the queue when it starts. If the handler is already translated, the call site merges
//!    immediately instead.
//!
//! Every call goes through [call::CallResolver], which wraps it in the backend's statepoint
//! primitive: the set of SSA ids live across the call (minus rematerialisable constants, minus
//! everything for tail calls) is passed as extra operands so the collector can relocate the heap
//! objects they reference, and each is overwritten with its relocated counterpart after the
//! call. One call-site record per call is submitted to the [StackMapTable].
//!
//! Exactly one block is "current" (started, not ended) at any time; the emission cursor sits at
//! its native end except while a resolver temporarily repositions it.

mod call;
mod diamond;

use crate::{
    backend::{
        raw_smi, thread_slot, BlockIdx, CastKind, NativeModule, Ty, ValueIdx, HEAP_OBJECT_TAG,
        OBJ_CLASS_ID_OFFSET, SMI_CID, SMI_TAG_MASK, SMI_TAG_SIZE,
    },
    liveness::{iter_set, InstId, Liveness},
    log::{Log, Verbosity},
    ssa_ir::{
        BinOp, BlockId, ConstDef, Function, Inst, NumConst, Obj, Predicate, Rep, RuntimeEntry,
        SsaId,
    },
    LowerError,
};
use call::{CallResolver, CcReg, CALL_INSTRUCTION_SIZE, CC_REG_PARAM_COUNT};
use diamond::DiamondResolver;
use irsmp::{CallSiteInfo, CallTarget, StackMapTable};
use std::{collections::HashMap, mem};
use typed_index_collections::TiVec;

/// The result of lowering one function: the sealed native module and its call-site records.
pub struct LoweredFunction {
    pub native: NativeModule,
    pub stackmaps: StackMapTable,
}

/// Lower `fg` into a native module. Invoked once per compiled function.
pub fn lower_function(fg: &Function, liveness: &Liveness) -> Result<LoweredFunction, LowerError> {
    let mut lw = Lowerer::new(fg, liveness)?;
    lw.run()?;
    Ok(lw.into_output())
}

/// A value descriptor: what a block currently knows about one SSA id.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueDesc {
    /// A realised native value.
    Value(ValueIdx),
    /// An unrealised constant: materialised on first read and memoised in `cached`. The cache is
    /// dropped whenever the descriptor is propagated across a merge or survives a call, because
    /// the native value minted before the call is not the one the statepoint protocol hands back
    /// after it.
    Const {
        def: ConstDef,
        cached: Option<ValueIdx>,
    },
}

/// A phi edge that could not be added because its predecessor had not been translated yet.
#[derive(Debug)]
pub(crate) struct NotMergedPhi {
    pub(crate) phi: ValueIdx,
    pub(crate) ssa: SsaId,
    pub(crate) pred: BlockId,
}

/// A throwing call site's contribution to a handler it could not merge into yet.
#[derive(Debug)]
pub(crate) struct ExceptionLiveIn {
    pub(crate) vals: HashMap<SsaId, ValueDesc>,
    /// The native block the exceptional edge leaves from: the continuation of the calling block
    /// at the moment the call was emitted.
    pub(crate) from: BlockIdx,
}

/// Per-block translation state.
#[derive(Debug)]
pub(crate) struct BlockState {
    /// The native block handle. May exist before the block starts (forward declaration).
    pub(crate) native: Option<BlockIdx>,
    /// The native block control falls into when translation of this block finishes. Starts equal
    /// to `native`; shifted by internal diamonds and exceptional-call continuations.
    pub(crate) continuation: Option<BlockIdx>,
    pub(crate) vals: HashMap<SsaId, ValueDesc>,
    pub(crate) not_merged_phis: Vec<NotMergedPhi>,
    pub(crate) exception_entries: Vec<ExceptionLiveIn>,
    /// The thrown object, populated on handler entry.
    pub(crate) exception_val: Option<ValueIdx>,
    /// The stack-trace object, populated on handler entry.
    pub(crate) stacktrace_val: Option<ValueIdx>,
    pub(crate) is_handler: bool,
    pub(crate) started: bool,
    pub(crate) ended: bool,
}

impl BlockState {
    fn new(is_handler: bool) -> Self {
        Self {
            native: None,
            continuation: None,
            vals: HashMap::new(),
            not_merged_phis: Vec::new(),
            exception_entries: Vec::new(),
            exception_val: None,
            stacktrace_val: None,
            is_handler,
            started: false,
            ended: false,
        }
    }

    fn start(&mut self) {
        assert!(!self.started);
        assert!(!self.ended);
        self.started = true;
    }

    fn end(&mut self) {
        assert!(self.started);
        assert!(!self.ended);
        self.ended = true;
    }
}

/// The per-function lowering engine. Single-threaded, single-pass, synchronous.
pub(crate) struct Lowerer<'a> {
    pub(crate) fg: &'a Function,
    pub(crate) liveness: &'a Liveness,
    pub(crate) nm: NativeModule,
    pub(crate) blocks: TiVec<BlockId, BlockState>,
    /// The block currently being translated.
    pub(crate) cur: Option<BlockId>,
    pub(crate) phi_rebuild_worklist: Vec<BlockId>,
    /// The pushed-argument staging area; cleared when a block ends.
    pub(crate) pushed_args: Vec<ValueIdx>,
    next_patchid: u64,
    pub(crate) smaps: StackMapTable,
    /// try-region id -> shared native handler block.
    catch_blocks: HashMap<crate::ssa_ir::TryRegionId, BlockIdx>,
    log: Log,
}

impl<'a> Lowerer<'a> {
    pub(crate) fn new(fg: &'a Function, liveness: &'a Liveness) -> Result<Self, LowerError> {
        let mut param_tys = vec![Ty::Tagged; CC_REG_PARAM_COUNT];
        param_tys[CcReg::Fp as usize] = Ty::Ptr;
        param_tys[CcReg::Thread as usize] = Ty::Ptr;
        param_tys.extend(std::iter::repeat(Ty::Tagged).take(fg.num_params()));
        let nm = NativeModule::new(&param_tys);
        let blocks = (0..fg.blocks_len())
            .map(|i| BlockState::new(fg.block(BlockId::new(i).unwrap()).is_handler()))
            .collect::<TiVec<_, _>>();
        let log = Log::new().map_err(|e| LowerError::Internal(e.to_string()))?;
        Ok(Self {
            fg,
            liveness,
            nm,
            blocks,
            cur: None,
            phi_rebuild_worklist: Vec::new(),
            pushed_args: Vec::new(),
            next_patchid: 0,
            smaps: StackMapTable::new(),
            catch_blocks: HashMap::new(),
            log,
        })
    }

    pub(crate) fn into_output(self) -> LoweredFunction {
        LoweredFunction {
            native: self.nm,
            stackmaps: self.smaps,
        }
    }

    // Calling-convention environment values.

    pub(crate) fn pp(&self) -> ValueIdx {
        self.nm.param(CcReg::Pp as usize)
    }

    pub(crate) fn thread(&self) -> ValueIdx {
        self.nm.param(CcReg::Thread as usize)
    }

    pub(crate) fn args_desc(&self) -> ValueIdx {
        self.nm.param(CcReg::ArgsDesc as usize)
    }

    pub(crate) fn current(&self) -> BlockId {
        self.cur.expect("no current block")
    }

    pub(crate) fn next_patch_point(&mut self) -> u64 {
        let id = self.next_patchid;
        self.next_patchid += 1;
        id
    }

    /// Idempotently create the native block (and initial continuation) for `bid`. Handler blocks
    /// share one native block per try-region.
    pub(crate) fn ensure_native_block(&mut self, bid: BlockId) -> Result<BlockIdx, LowerError> {
        if let Some(nb) = self.blocks[bid].native {
            return Ok(nb);
        }
        let nb = if self.fg.block(bid).is_handler() {
            let tri = self.fg.block(bid).try_region().ok_or_else(|| {
                LowerError::Internal(format!("handler block {bid} has no try-region"))
            })?;
            match self.catch_blocks.get(&tri) {
                Some(nb) => *nb,
                None => {
                    let nb = self.nm.append_block(&format!("catch{tri}"));
                    self.catch_blocks.insert(tri, nb);
                    nb
                }
            }
        } else {
            self.nm.append_block(&format!("bb{bid}"))
        };
        self.blocks[bid].native = Some(nb);
        self.blocks[bid].continuation = Some(nb);
        Ok(nb)
    }

    fn start_block(&mut self, bid: BlockId) -> Result<(), LowerError> {
        assert!(self.cur.is_none(), "a block is already being translated");
        self.blocks[bid].start();
        let nb = self.ensure_native_block(bid)?;
        self.cur = Some(bid);
        self.nm.position_at_end(nb);
        Ok(())
    }

    fn end_block(&mut self) {
        let bid = self.cur.take().expect("no current block");
        self.blocks[bid].end();
        self.pushed_args.clear();
    }

    /// Record the native block the current block's translation now falls into.
    pub(crate) fn set_current_continuation(&mut self, bb: BlockIdx) {
        let bid = self.current();
        self.blocks[bid].continuation = Some(bb);
    }

    // Value map access.

    pub(crate) fn set_val(&mut self, ssa: SsaId, v: ValueIdx) {
        let bid = self.current();
        self.blocks[bid].vals.insert(ssa, ValueDesc::Value(v));
    }

    fn set_lazy(&mut self, ssa: SsaId, def: ConstDef) {
        let bid = self.current();
        self.blocks[bid]
            .vals
            .insert(ssa, ValueDesc::Const { def, cached: None });
    }

    /// Read `ssa` in `bid`'s map, materialising (and memoising) an unrealised constant at the
    /// emission cursor.
    pub(crate) fn read_block_val(&mut self, bid: BlockId, ssa: SsaId) -> Result<ValueIdx, LowerError> {
        match self.blocks[bid].vals.get(&ssa) {
            None => Err(LowerError::UndefinedValue(ssa.to_usize())),
            Some(ValueDesc::Value(v)) => Ok(*v),
            Some(ValueDesc::Const {
                cached: Some(v), ..
            }) => Ok(*v),
            Some(ValueDesc::Const { def, cached: None }) => {
                let def = def.clone();
                let v = self.materialise(&def)?;
                match self.blocks[bid].vals.get_mut(&ssa) {
                    Some(ValueDesc::Const { cached, .. }) => *cached = Some(v),
                    _ => unreachable!(),
                }
                Ok(v)
            }
        }
    }

    pub(crate) fn read_val(&mut self, ssa: SsaId) -> Result<ValueIdx, LowerError> {
        let bid = self.current();
        self.read_block_val(bid, ssa)
    }

    /// Read `ssa` in `pred`'s map with the cursor temporarily moved before `pred`'s
    /// continuation's terminator, so that anything materialised dominates the edge.
    fn read_in_pred(&mut self, pred: BlockId, ssa: SsaId) -> Result<ValueIdx, LowerError> {
        let saved = self.nm.cursor();
        let cont = self.blocks[pred]
            .continuation
            .expect("predecessor has no native block");
        self.nm.position_before_terminator(cont);
        let res = self.read_block_val(pred, ssa);
        self.nm.set_cursor(saved);
        res
    }

    /// Turn a constant definition into a native value at the emission cursor.
    fn materialise(&mut self, def: &ConstDef) -> Result<ValueIdx, LowerError> {
        match def {
            ConstDef::Num(NumConst::Smi(v)) => Ok(self.nm.const_tagged(raw_smi(*v))),
            ConstDef::Num(NumConst::Double(d)) => Ok(self.nm.const_double(*d)),
            ConstDef::Obj(obj) => self.load_object(obj),
        }
    }

    /// Load a heap-object constant: from a fixed per-thread slot when the backend recognises the
    /// object, as an immediate for small integers, otherwise through the pooled-object table.
    pub(crate) fn load_object(&mut self, obj: &Obj) -> Result<ValueIdx, LowerError> {
        if let Some(slot) = thread_slot(obj) {
            let off = self.nm.const_intptr(i64::from(slot));
            let thread = self.thread();
            let gep = self.nm.build_gep(thread, off);
            return Ok(self.nm.build_load(gep, Ty::Tagged));
        }
        if let Obj::Smi(v) = obj {
            // Relocation doesn't apply to small integers.
            return Ok(self.nm.const_intptr(raw_smi(*v)));
        }
        let idx = self.nm.pool_find_or_add(obj);
        let off = NativeModule::pool_element_offset(idx) - HEAP_OBJECT_TAG;
        let off = self.nm.const_intptr(i64::from(off));
        let pp = self.pp();
        let gep = self.nm.build_gep(pp, off);
        Ok(self.nm.build_load(gep, Ty::Tagged))
    }

    // Representation helpers.

    fn ty_for_rep(rep: Rep) -> Ty {
        match rep {
            Rep::Tagged => Ty::Tagged,
            Rep::Word => Ty::intptr(),
            Rep::Int32 => Ty::Int(32),
            Rep::Int64 => Ty::Int(64),
            Rep::Float => Ty::Float,
            Rep::Double => Ty::Double,
        }
    }

    pub(crate) fn ensure_boolean(&mut self, v: ValueIdx) -> ValueIdx {
        let mut v = v;
        if matches!(self.nm.ty_of(v), Ty::Ptr | Ty::Tagged) {
            v = self.nm.build_cast(CastKind::PtrToInt, v, Ty::intptr());
        }
        if self.nm.ty_of(v) == Ty::boolean() {
            return v;
        }
        let zero = self.nm.const_int(self.nm.ty_of(v), 0);
        self.nm.build_icmp(Predicate::NotEqual, v, zero)
    }

    pub(crate) fn ensure_intptr(&mut self, v: ValueIdx) -> ValueIdx {
        match self.nm.ty_of(v) {
            t if t == Ty::intptr() => v,
            Ty::Ptr | Ty::Tagged => self.nm.build_cast(CastKind::PtrToInt, v, Ty::intptr()),
            Ty::Int(_) => self.nm.build_cast(CastKind::ZExt, v, Ty::intptr()),
            _ => v,
        }
    }

    pub(crate) fn smi_tag(&mut self, v: ValueIdx) -> ValueIdx {
        assert_eq!(self.nm.ty_of(v), Ty::intptr());
        let shift = self.nm.const_intptr(SMI_TAG_SIZE);
        let shifted = self.nm.build_binop(BinOp::Shl, v, shift);
        self.nm.build_cast(CastKind::IntToPtr, shifted, Ty::Tagged)
    }

    /// Is `v` a tagged small integer?
    pub(crate) fn tst_smi(&mut self, v: ValueIdx) -> ValueIdx {
        assert_eq!(self.nm.ty_of(v), Ty::Tagged);
        let raw = self.nm.build_cast(CastKind::PtrToInt, v, Ty::intptr());
        let mask = self.nm.const_intptr(SMI_TAG_MASK);
        let bit = self.nm.build_binop(BinOp::And, raw, mask);
        let zero = self.nm.const_intptr(0);
        self.nm.build_icmp(Predicate::Equal, bit, zero)
    }

    // Predecessor merging.

    fn all_preds_started(&self, bid: BlockId) -> (bool, Option<BlockId>) {
        let mut all = true;
        let mut ref_pred = None;
        for &pred in self.fg.block(bid).preds() {
            if self.blocks[pred].started {
                if ref_pred.is_none() {
                    ref_pred = Some(pred);
                }
            } else {
                all = false;
            }
        }
        (all, ref_pred)
    }

    /// Populate the current block's value map with the live-in values from its predecessors.
    fn merge_predecessors(&mut self, bid: BlockId) -> Result<(), LowerError> {
        let preds = self.fg.block(bid).preds().to_vec();
        if preds.is_empty() {
            return Ok(());
        }
        assert!(!self.blocks[bid].is_handler);
        let live = iter_set(self.liveness.live_in(bid)).collect::<Vec<_>>();
        if preds.len() == 1 {
            // A single incoming edge cannot disagree with itself: copy descriptors verbatim.
            let pred = preds[0];
            assert!(self.blocks[pred].started);
            for ssa in live {
                let desc = self.blocks[pred]
                    .vals
                    .get(&ssa)
                    .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?
                    .clone();
                self.blocks[bid].vals.insert(ssa, desc);
            }
            return Ok(());
        }
        let (all_started, ref_pred) = self.all_preds_started(bid);
        if !all_started {
            let ref_pred = ref_pred.expect("no translated predecessor to take types from");
            return self.build_phi_and_push_to_worklist(bid, ref_pred, &preds, &live);
        }
        let ref_pred = ref_pred.unwrap();
        for ssa in live {
            let desc = self.blocks[ref_pred]
                .vals
                .get(&ssa)
                .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?
                .clone();
            match desc {
                ValueDesc::Const { def, .. } => {
                    // Rematerialisable: propagate the definition, dropping the cached value.
                    self.blocks[bid]
                        .vals
                        .insert(ssa, ValueDesc::Const { def, cached: None });
                }
                ValueDesc::Value(ref_val) => {
                    let ref_ty = self.nm.ty_of(ref_val);
                    if ref_ty != Ty::Tagged {
                        // Types other than the tagged representation are invariant across edges
                        // (engine precondition).
                        self.blocks[bid].vals.insert(ssa, ValueDesc::Value(ref_val));
                        continue;
                    }
                    let phi = self.nm.build_phi(ref_ty);
                    for &pred in &preds {
                        let v = self.read_in_pred(pred, ssa)?;
                        let from = self.blocks[pred].continuation.unwrap();
                        self.nm.add_incoming(phi, v, from);
                    }
                    self.blocks[bid].vals.insert(ssa, ValueDesc::Value(phi));
                }
            }
        }
        Ok(())
    }

    /// Build placeholder phis for `bid` (typed from `ref_pred`'s values), adding real edges for
    /// started predecessors and [NotMergedPhi] records for the rest.
    fn build_phi_and_push_to_worklist(
        &mut self,
        bid: BlockId,
        ref_pred: BlockId,
        preds: &[BlockId],
        live: &[SsaId],
    ) -> Result<(), LowerError> {
        for &ssa in live {
            let desc = self.blocks[ref_pred]
                .vals
                .get(&ssa)
                .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?
                .clone();
            match desc {
                ValueDesc::Const { def, .. } => {
                    self.blocks[bid]
                        .vals
                        .insert(ssa, ValueDesc::Const { def, cached: None });
                }
                ValueDesc::Value(ref_val) => {
                    let ref_ty = self.nm.ty_of(ref_val);
                    if ref_ty != Ty::Tagged {
                        self.blocks[bid].vals.insert(ssa, ValueDesc::Value(ref_val));
                        continue;
                    }
                    let phi = self.nm.build_phi(ref_ty);
                    self.blocks[bid].vals.insert(ssa, ValueDesc::Value(phi));
                    for &pred in preds {
                        if !self.blocks[pred].started {
                            self.blocks[bid].not_merged_phis.push(NotMergedPhi {
                                phi,
                                ssa,
                                pred,
                            });
                            continue;
                        }
                        let v = self.read_in_pred(pred, ssa)?;
                        let from = self.blocks[pred].continuation.unwrap();
                        self.nm.add_incoming(phi, v, from);
                    }
                }
            }
        }
        self.phi_rebuild_worklist.push(bid);
        Ok(())
    }

    /// Finalisation: add every deferred phi edge. Runs exactly once, after all blocks.
    fn process_phi_worklist(&mut self) -> Result<(), LowerError> {
        let worklist = mem::take(&mut self.phi_rebuild_worklist);
        for bid in worklist {
            let pending = mem::take(&mut self.blocks[bid].not_merged_phis);
            for nmp in pending {
                assert!(self.blocks[nmp.pred].started);
                let ty = self.nm.ty_of(nmp.phi);
                let v = self.ensure_phi_input(nmp.pred, nmp.ssa, ty)?;
                let from = self.blocks[nmp.pred].continuation.unwrap();
                self.nm.add_incoming(nmp.phi, v, from);
            }
        }
        Ok(())
    }

    /// Read `pred`'s value for `ssa` and coerce it to `ty`, inserting any coercion immediately
    /// before `pred`'s continuation's terminator.
    fn ensure_phi_input(
        &mut self,
        pred: BlockId,
        ssa: SsaId,
        ty: Ty,
    ) -> Result<ValueIdx, LowerError> {
        let val = self.read_in_pred(pred, ssa)?;
        let val_ty = self.nm.ty_of(val);
        if val_ty == ty {
            return Ok(val);
        }
        let cont = self.blocks[pred].continuation.unwrap();
        let saved = self.nm.cursor();
        self.nm.position_before_terminator(cont);
        let res = if val_ty == Ty::intptr() && ty == Ty::Tagged {
            Ok(self.nm.build_cast(CastKind::IntToPtr, val, Ty::Tagged))
        } else if matches!(val_ty, Ty::Ptr | Ty::Tagged) && ty == Ty::intptr() {
            Ok(self.nm.build_cast(CastKind::PtrToInt, val, ty))
        } else if val_ty == Ty::boolean() && ty == Ty::intptr() {
            Ok(self.nm.build_cast(CastKind::ZExt, val, ty))
        } else if let (Ty::Int(from), Ty::Int(to)) = (val_ty, ty) {
            if from > to {
                Ok(self.nm.build_cast(CastKind::Trunc, val, ty))
            } else {
                Ok(self.nm.build_cast(CastKind::ZExt, val, ty))
            }
        } else {
            Err(LowerError::PhiInputType {
                from: val_ty,
                to: ty,
            })
        };
        self.nm.set_cursor(saved);
        res
    }

    // Exception-edge merging.

    /// Handler-entry merge: build the landing pad and the two handler pseudo-values, then drain
    /// the queued contributions from call sites translated before us.
    fn merge_exception_virtual_predecessors(&mut self, bid: BlockId) -> Result<(), LowerError> {
        if !self.blocks[bid].is_handler {
            return Err(LowerError::Internal(format!(
                "block {bid} has no virtual predecessors to merge"
            )));
        }
        let pad = self.nm.build_landing_pad();
        let entries = mem::take(&mut self.blocks[bid].exception_entries);
        for e in &entries {
            self.merge_exception_live_in(e, bid)?;
        }
        let exc = self.nm.build_exception_object(pad);
        let trace = self.nm.build_exception_data(pad);
        self.blocks[bid].exception_val = Some(exc);
        self.blocks[bid].stacktrace_val = Some(trace);
        Ok(())
    }

    /// Merge one call site's live-in snapshot into `handler`'s value map. The emission cursor
    /// must point at the handler's native block when this is called.
    pub(crate) fn merge_exception_live_in(
        &mut self,
        e: &ExceptionLiveIn,
        handler: BlockId,
    ) -> Result<(), LowerError> {
        let live = iter_set(self.liveness.live_in(handler)).collect::<Vec<_>>();
        for ssa in live {
            let incoming = e
                .vals
                .get(&ssa)
                .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?;
            match self.blocks[handler].vals.get(&ssa).cloned() {
                None => match incoming {
                    ValueDesc::Const { def, .. } => {
                        self.blocks[handler].vals.insert(
                            ssa,
                            ValueDesc::Const {
                                def: def.clone(),
                                cached: None,
                            },
                        );
                    }
                    ValueDesc::Value(v) => {
                        let phi = self.nm.build_phi(self.nm.ty_of(*v));
                        self.nm.add_incoming(phi, *v, e.from);
                        self.blocks[handler].vals.insert(ssa, ValueDesc::Value(phi));
                    }
                },
                Some(existing) => match (incoming, existing) {
                    (ValueDesc::Const { def: di, .. }, ValueDesc::Const { def: dc, .. }) => {
                        // Constants must agree across throw sites.
                        if *di != dc {
                            return Err(LowerError::ConstantMismatch(ssa.to_usize()));
                        }
                    }
                    (ValueDesc::Value(v), ValueDesc::Value(phi)) => {
                        assert_eq!(self.nm.ty_of(phi), self.nm.ty_of(*v));
                        self.nm.add_incoming(phi, *v, e.from);
                    }
                    _ => return Err(LowerError::ConstantMismatch(ssa.to_usize())),
                },
            }
        }
        Ok(())
    }

    // The driver.

    pub(crate) fn run(&mut self) -> Result<(), LowerError> {
        self.log
            .log(Verbosity::LowerEvent, &format!("lowering {}", self.fg.name()));
        for bid in self.fg.visit_order() {
            self.lower_block(bid)?;
        }
        self.finish()
    }

    fn lower_block(&mut self, bid: BlockId) -> Result<(), LowerError> {
        debug_assert!(
            self.fg
                .block(bid)
                .insts()
                .last()
                .is_some_and(Inst::is_terminator),
            "block {bid} does not end in a terminator"
        );
        self.start_block(bid)?;
        if self.blocks[bid].is_handler {
            self.merge_exception_virtual_predecessors(bid)?;
        } else {
            self.merge_predecessors(bid)?;
        }
        for iidx in 0..self.fg.block(bid).insts().len() {
            let inst = self.fg.block(bid).insts()[iidx].clone();
            self.lower_inst(InstId::new(bid, iidx), &inst)?;
        }
        self.end_block();
        Ok(())
    }

    fn finish(&mut self) -> Result<(), LowerError> {
        assert!(self.cur.is_none());
        self.process_phi_worklist()?;
        // The function entry: the first non-handler block in visitation order.
        let entry = self
            .fg
            .visit_order()
            .into_iter()
            .find(|bid| !self.fg.block(*bid).is_handler())
            .ok_or_else(|| LowerError::Internal("function has no entry block".into()))?;
        let entry_nb = self.ensure_native_block(entry)?;
        let prologue = self.nm.prologue();
        self.nm.position_at_end(prologue);
        self.nm.build_br(entry_nb);
        self.nm.finalize()?;
        self.log.log(
            Verbosity::LowerEvent,
            &format!(
                "lowered {}: {} native blocks, {} patch points",
                self.fg.name(),
                self.nm.blocks_len(),
                self.smaps.len()
            ),
        );
        Ok(())
    }

    fn lower_inst(&mut self, iid: InstId, inst: &Inst) -> Result<(), LowerError> {
        match inst {
            Inst::NumConst { dst, val } => {
                self.set_lazy(*dst, ConstDef::Num(*val));
            }
            Inst::ObjConst { dst, obj } => {
                self.set_lazy(*dst, ConstDef::Obj(obj.clone()));
            }
            Inst::Param { dst, index } => {
                // Stack parameters are pushed in reverse: the last logical argument sits first.
                let i = CC_REG_PARAM_COUNT + self.fg.num_params() - index - 1;
                let v = self.nm.param(i);
                self.set_val(*dst, v);
            }
            Inst::Phi { dst, rep, inputs } => {
                self.lower_phi(iid.bid, *dst, Self::ty_for_rep(*rep), inputs)?;
            }
            Inst::BinOp { dst, op, lhs, rhs } => {
                let l = self.read_val(*lhs)?;
                let r = self.read_val(*rhs)?;
                let l = self.ensure_intptr(l);
                let r = self.ensure_intptr(r);
                let v = self.nm.build_binop(*op, l, r);
                self.set_val(*dst, v);
            }
            Inst::Cmp {
                dst,
                pred,
                lhs,
                rhs,
            } => {
                let l = self.read_val(*lhs)?;
                let r = self.read_val(*rhs)?;
                let l = self.ensure_intptr(l);
                let r = self.ensure_intptr(r);
                let v = self.nm.build_icmp(*pred, l, r);
                self.set_val(*dst, v);
            }
            Inst::BoolNegate { dst, val } => {
                let v = self.read_val(*val)?;
                let b = self.ensure_boolean(v);
                let one = self.nm.const_int(Ty::boolean(), 1);
                let v = self.nm.build_binop(BinOp::Xor, b, one);
                self.set_val(*dst, v);
            }
            Inst::LoadField {
                dst,
                base,
                offset,
                rep,
            } => {
                let base = self.read_val(*base)?;
                let off = self.nm.const_intptr(i64::from(offset - HEAP_OBJECT_TAG));
                let gep = self.nm.build_gep(base, off);
                let v = self.nm.build_load(gep, Self::ty_for_rep(*rep));
                self.set_val(*dst, v);
            }
            Inst::StoreField { base, offset, val } => {
                let base = self.read_val(*base)?;
                let v = self.read_val(*val)?;
                let off = self.nm.const_intptr(i64::from(offset - HEAP_OBJECT_TAG));
                let gep = self.nm.build_gep(base, off);
                self.nm.build_store(v, gep);
            }
            Inst::LoadClassId {
                dst,
                obj,
                maybe_smi,
            } => {
                self.lower_load_class_id(*dst, *obj, *maybe_smi)?;
            }
            Inst::ExceptionObject { dst } => {
                let bid = self.current();
                assert!(self.blocks[bid].is_handler);
                let v = self.blocks[bid]
                    .exception_val
                    .ok_or_else(|| LowerError::Internal("handler has no exception value".into()))?;
                self.set_val(*dst, v);
            }
            Inst::StackTraceObject { dst } => {
                let bid = self.current();
                assert!(self.blocks[bid].is_handler);
                let v = self.blocks[bid]
                    .stacktrace_val
                    .ok_or_else(|| LowerError::Internal("handler has no stack-trace value".into()))?;
                self.set_val(*dst, v);
            }
            Inst::PushArg { val } => {
                let v = self.read_val(*val)?;
                self.pushed_args.push(v);
            }
            Inst::StaticCall {
                dst,
                target,
                argc,
                deopt_id,
                source_pos,
            } => {
                let info = CallSiteInfo::new(
                    CallTarget::CodeRelative(*target),
                    *deopt_id,
                    *source_pos,
                    *argc,
                    CALL_INSTRUCTION_SIZE,
                );
                let mut r = CallResolver::new(self, Some(*dst), info, iid, false);
                r.add_staged_arguments(*argc)?;
                let v = r
                    .build_call()?
                    .ok_or_else(|| LowerError::Internal("call produced no value".into()))?;
                self.set_val(*dst, v);
            }
            Inst::InstanceCall {
                dst,
                ic_data,
                argc,
                deopt_id,
                source_pos,
            } => {
                let data_val = self.load_object(ic_data)?;
                let stub_val = self.load_object(&Obj::Code("unlinked_call".to_owned()))?;
                let info = CallSiteInfo::new(
                    CallTarget::Register(CcReg::CallTarget as u8),
                    *deopt_id,
                    *source_pos,
                    *argc,
                    CALL_INSTRUCTION_SIZE,
                );
                let mut r = CallResolver::new(self, Some(*dst), info, iid, false);
                r.set_reg(CcReg::IcData, data_val);
                r.set_reg(CcReg::CallTarget, stub_val);
                r.add_staged_arguments(*argc)?;
                let recv = r.stack_parameter(*argc - 1);
                r.set_reg(CcReg::Receiver, recv);
                let v = r
                    .build_call()?
                    .ok_or_else(|| LowerError::Internal("call produced no value".into()))?;
                self.set_val(*dst, v);
            }
            Inst::RuntimeCall {
                dst,
                entry,
                argc,
                deopt_id,
                source_pos,
            } => {
                let v = self.generate_runtime_call(iid, *entry, *argc, *deopt_id, *source_pos)?;
                self.set_val(*dst, v);
            }
            Inst::Throw {
                deopt_id,
                source_pos,
            } => {
                self.generate_runtime_call(iid, RuntimeEntry::Throw, 1, *deopt_id, *source_pos)?;
                self.nm.build_trap();
            }
            Inst::ReThrow {
                deopt_id,
                source_pos,
            } => {
                self.generate_runtime_call(iid, RuntimeEntry::ReThrow, 2, *deopt_id, *source_pos)?;
                self.nm.build_trap();
            }
            Inst::TailCall { code } => {
                let code_val = self.load_object(code)?;
                let args_desc = self.args_desc();
                let info = CallSiteInfo::new(CallTarget::CodeObject, 0, 0, 0, CALL_INSTRUCTION_SIZE);
                let mut r = CallResolver::new(self, None, info, iid, true);
                r.set_reg(CcReg::Code, code_val);
                r.set_reg(CcReg::ArgsDesc, args_desc);
                r.build_call()?;
            }
            Inst::Goto { target } => {
                let nb = self.ensure_native_block(*target)?;
                self.nm.build_br(nb);
            }
            Inst::Branch {
                cond,
                true_target,
                false_target,
            } => {
                let tb = self.ensure_native_block(*true_target)?;
                let fb = self.ensure_native_block(*false_target)?;
                let c = self.read_val(*cond)?;
                let c = self.ensure_boolean(c);
                self.nm.build_cond_br(c, tb, fb);
            }
            Inst::Return { val } => {
                let v = self.read_val(*val)?;
                self.nm.build_ret(v);
            }
            Inst::IndirectGoto { .. } => {
                return Err(LowerError::Unsupported(inst.name()));
            }
        }
        Ok(())
    }

    /// Lower an explicit IR phi: the same started/deferred split per predecessor as the live-in
    /// merge, but with per-edge source SSA ids from the instruction itself.
    fn lower_phi(
        &mut self,
        bid: BlockId,
        dst: SsaId,
        ty: Ty,
        inputs: &[SsaId],
    ) -> Result<(), LowerError> {
        let preds = self.fg.block(bid).preds().to_vec();
        assert_eq!(preds.len(), inputs.len());
        let phi = self.nm.build_phi(ty);
        let mut defer = false;
        for (i, &pred) in preds.iter().enumerate() {
            if self.blocks[pred].started {
                let v = self.ensure_phi_input(pred, inputs[i], ty)?;
                let from = self.blocks[pred].continuation.unwrap();
                self.nm.add_incoming(phi, v, from);
            } else {
                self.blocks[bid].not_merged_phis.push(NotMergedPhi {
                    phi,
                    ssa: inputs[i],
                    pred,
                });
                defer = true;
            }
        }
        if defer {
            self.phi_rebuild_worklist.push(bid);
        }
        self.set_val(dst, phi);
        Ok(())
    }

    fn lower_load_class_id(
        &mut self,
        dst: SsaId,
        obj: SsaId,
        maybe_smi: bool,
    ) -> Result<(), LowerError> {
        let obj = self.read_val(obj)?;
        let cid_off = i64::from(OBJ_CLASS_ID_OFFSET - HEAP_OBJECT_TAG);
        let value = if maybe_smi {
            let mut d = DiamondResolver::new(self, dst);
            let is_smi = self.tst_smi(obj);
            d.build_cmp(self, is_smi);
            d.build_left(self, |lw| Ok(lw.nm.const_int(Ty::Int(16), SMI_CID)))?;
            d.build_right(self, |lw| {
                let off = lw.nm.const_intptr(cid_off);
                let gep = lw.nm.build_gep(obj, off);
                Ok(lw.nm.build_load(gep, Ty::Int(16)))
            })?;
            d.end(self)
        } else {
            let off = self.nm.const_intptr(cid_off);
            let gep = self.nm.build_gep(obj, off);
            self.nm.build_load(gep, Ty::Int(16))
        };
        let wide = self.nm.build_cast(CastKind::ZExt, value, Ty::intptr());
        let tagged = self.smi_tag(wide);
        self.set_val(dst, tagged);
        Ok(())
    }

    /// Call a leaf runtime entry through the per-thread table, consuming `argc` staged arguments.
    fn generate_runtime_call(
        &mut self,
        iid: InstId,
        entry: RuntimeEntry,
        argc: usize,
        deopt_id: u64,
        source_pos: u32,
    ) -> Result<ValueIdx, LowerError> {
        let off = self.nm.const_intptr(i64::from(entry.thread_offset()));
        let thread = self.thread();
        let gep = self.nm.build_gep(thread, off);
        let code = self.nm.build_load(gep, Ty::Tagged);
        let info = CallSiteInfo::new(
            CallTarget::CodeObject,
            deopt_id,
            source_pos,
            argc,
            CALL_INSTRUCTION_SIZE,
        );
        let mut r = CallResolver::new(self, None, info, iid, false);
        r.set_reg(CcReg::Code, code);
        r.add_staged_arguments(argc)?;
        r.build_call()?
            .ok_or_else(|| LowerError::Internal("call produced no value".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Inst as NInst;
    use crate::ssa_ir::{Block, TryRegionId};
    use fm::FMatcher;

    fn bid(i: usize) -> BlockId {
        BlockId::new(i).unwrap()
    }

    fn sid(i: usize) -> SsaId {
        SsaId::new(i).unwrap()
    }

    /// The instructions of the native block labelled `label`.
    fn block_insts(nm: &NativeModule, label: &str) -> Vec<ValueIdx> {
        for i in 0..nm.blocks_len() {
            let bb = BlockIdx::from(i);
            if nm.block(bb).label() == label {
                return nm.block(bb).insts().to_vec();
            }
        }
        panic!("no native block labelled {label}");
    }

    fn block_label(nm: &NativeModule, bb: BlockIdx) -> String {
        nm.block(bb).label().to_owned()
    }

    fn find_statepoint(nm: &NativeModule, label: &str) -> ValueIdx {
        *block_insts(nm, label)
            .iter()
            .find(|v| matches!(nm.inst(**v), NInst::Statepoint { .. }))
            .unwrap()
    }

    #[test]
    fn lowers_straight_line_function() {
        let mut fg = Function::new("f", 0);
        let mut b = Block::new(vec![], None, false);
        b.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(21),
        });
        b.push(Inst::Return { val: sid(0) });
        fg.push_block(b).unwrap();
        let lv = Liveness::new(1);
        let lf = lower_function(&fg, &lv).unwrap();

        let insts = block_insts(&lf.native, "bb0");
        // A small integer constant is emitted pre-encoded.
        assert!(matches!(
            lf.native.inst(insts[0]),
            NInst::ConstInt {
                ty: Ty::Tagged,
                val: 42
            }
        ));
        assert!(matches!(lf.native.inst(insts[1]), NInst::Ret { .. }));
        assert!(lf.stackmaps.is_empty());
        // The prologue falls through to the entry block.
        let prologue = block_insts(&lf.native, "prologue");
        assert!(matches!(lf.native.inst(prologue[0]), NInst::Br { .. }));
    }

    #[test]
    fn display_output() {
        let mut fg = Function::new("f", 0);
        let mut b = Block::new(vec![], None, false);
        b.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(21),
        });
        b.push(Inst::Return { val: sid(0) });
        fg.push_block(b).unwrap();
        let lv = Liveness::new(1);
        let lf = lower_function(&fg, &lv).unwrap();

        let ptn = "...
prologue:
  br bb0
bb0:
  %8: tagged = const 42
  ret %8
";
        let text = lf.native.to_string();
        if let Err(e) = FMatcher::new(ptn).unwrap().matches(&text) {
            panic!("{e}");
        }
    }

    #[test]
    fn single_predecessor_copies_value_map() {
        let mut fg = Function::new("f", 0);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(5),
        });
        b0.push(Inst::Goto { target: bid(1) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![bid(0)], None, false);
        b1.push(Inst::Return { val: sid(0) });
        fg.push_block(b1).unwrap();
        let mut lv = Liveness::new(1);
        lv.set_live_in(bid(1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // The constant was never read in bb0, so it materialises in bb1 only.
        let b0_insts = block_insts(&lf.native, "bb0");
        assert_eq!(b0_insts.len(), 1);
        assert!(matches!(lf.native.inst(b0_insts[0]), NInst::Br { .. }));
        let b1_insts = block_insts(&lf.native, "bb1");
        assert!(matches!(
            lf.native.inst(b1_insts[0]),
            NInst::ConstInt {
                ty: Ty::Tagged,
                val: 10
            }
        ));
    }

    #[test]
    fn all_started_merge_builds_phi() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::Cmp {
            dst: sid(1),
            pred: Predicate::Equal,
            lhs: sid(0),
            rhs: sid(0),
        });
        b0.push(Inst::Branch {
            cond: sid(1),
            true_target: bid(1),
            false_target: bid(2),
        });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![bid(0)], None, false);
        b1.push(Inst::Goto { target: bid(3) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Goto { target: bid(3) });
        fg.push_block(b2).unwrap();
        let mut b3 = Block::new(vec![bid(1), bid(2)], None, false);
        b3.push(Inst::Return { val: sid(0) });
        fg.push_block(b3).unwrap();
        let mut lv = Liveness::new(2);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(0)]);
        lv.set_live_in(bid(3), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        let b3_insts = block_insts(&lf.native, "bb3");
        assert!(matches!(lf.native.inst(b3_insts[0]), NInst::Phi { .. }));
        assert_eq!(lf.native.phi_incomings(b3_insts[0]).len(), 2);
    }

    #[test]
    fn deferred_merge_completes_at_finalisation() {
        // A loop: bb1's latch predecessor (bb2) is translated after bb1.
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::Goto { target: bid(1) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![bid(0), bid(2)], None, false);
        b1.push(Inst::Cmp {
            dst: sid(1),
            pred: Predicate::Equal,
            lhs: sid(0),
            rhs: sid(0),
        });
        b1.push(Inst::Branch {
            cond: sid(1),
            true_target: bid(2),
            false_target: bid(3),
        });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(1)], None, false);
        b2.push(Inst::Goto { target: bid(1) });
        fg.push_block(b2).unwrap();
        let mut b3 = Block::new(vec![bid(1)], None, false);
        b3.push(Inst::Return { val: sid(0) });
        fg.push_block(b3).unwrap();
        let mut lv = Liveness::new(2);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(0)]);
        lv.set_live_in(bid(3), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // The placeholder phi got its latch edge during finalisation.
        let b1_insts = block_insts(&lf.native, "bb1");
        assert!(matches!(lf.native.inst(b1_insts[0]), NInst::Phi { .. }));
        let incomings = lf.native.phi_incomings(b1_insts[0]);
        assert_eq!(incomings.len(), 2);
        let labels = incomings
            .iter()
            .map(|(_, bb)| block_label(&lf.native, *bb))
            .collect::<Vec<_>>();
        assert!(labels.contains(&"bb0".to_owned()));
        assert!(labels.contains(&"bb2".to_owned()));
    }

    #[test]
    fn phi_inputs_coerced_in_predecessor() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::Cmp {
            dst: sid(1),
            pred: Predicate::Equal,
            lhs: sid(0),
            rhs: sid(0),
        });
        b0.push(Inst::Branch {
            cond: sid(1),
            true_target: bid(1),
            false_target: bid(2),
        });
        fg.push_block(b0).unwrap();
        // bb1 supplies a word-sized value to a tagged phi.
        let mut b1 = Block::new(vec![bid(0)], None, false);
        b1.push(Inst::BinOp {
            dst: sid(2),
            op: BinOp::Add,
            lhs: sid(0),
            rhs: sid(0),
        });
        b1.push(Inst::Goto { target: bid(3) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::NumConst {
            dst: sid(3),
            val: NumConst::Smi(1),
        });
        b2.push(Inst::Goto { target: bid(3) });
        fg.push_block(b2).unwrap();
        let mut b3 = Block::new(vec![bid(1), bid(2)], None, false);
        b3.push(Inst::Phi {
            dst: sid(4),
            rep: Rep::Tagged,
            inputs: vec![sid(2), sid(3)],
        });
        b3.push(Inst::Return { val: sid(4) });
        fg.push_block(b3).unwrap();
        let mut lv = Liveness::new(5);
        lv.set_live_in(bid(1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // The coercion sits in bb1, immediately before its terminator.
        let b1_insts = block_insts(&lf.native, "bb1");
        let n = b1_insts.len();
        assert!(matches!(lf.native.inst(b1_insts[n - 1]), NInst::Br { .. }));
        assert!(matches!(
            lf.native.inst(b1_insts[n - 2]),
            NInst::Cast {
                kind: CastKind::IntToPtr,
                ..
            }
        ));
    }

    #[test]
    fn phi_input_type_mismatch_is_an_error() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::Cmp {
            dst: sid(1),
            pred: Predicate::Equal,
            lhs: sid(0),
            rhs: sid(0),
        });
        b0.push(Inst::Branch {
            cond: sid(1),
            true_target: bid(1),
            false_target: bid(2),
        });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![bid(0)], None, false);
        b1.push(Inst::NumConst {
            dst: sid(2),
            val: NumConst::Double(1.5),
        });
        b1.push(Inst::Goto { target: bid(3) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::NumConst {
            dst: sid(3),
            val: NumConst::Smi(1),
        });
        b2.push(Inst::Goto { target: bid(3) });
        fg.push_block(b2).unwrap();
        let mut b3 = Block::new(vec![bid(1), bid(2)], None, false);
        b3.push(Inst::Phi {
            dst: sid(4),
            rep: Rep::Tagged,
            inputs: vec![sid(2), sid(3)],
        });
        b3.push(Inst::Return { val: sid(4) });
        fg.push_block(b3).unwrap();
        let lv = Liveness::new(5);
        assert!(matches!(
            lower_function(&fg, &lv),
            Err(LowerError::PhiInputType { .. })
        ));
    }

    #[test]
    fn call_roots_are_relocated() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 64,
            argc: 0,
            deopt_id: 7,
            source_pos: 9,
        });
        b0.push(Inst::Return { val: sid(0) });
        fg.push_block(b0).unwrap();
        let mut lv = Liveness::new(2);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint {
                gc_roots, edges, ..
            } => {
                assert_eq!(gc_roots.len(), 1);
                assert!(edges.is_none());
            }
            _ => unreachable!(),
        }
        // The return value is the relocated root, not the pre-call parameter.
        let insts = block_insts(&lf.native, "bb0");
        let ret = insts
            .iter()
            .find(|v| matches!(lf.native.inst(**v), NInst::Ret { .. }))
            .unwrap();
        match lf.native.inst(*ret) {
            NInst::Ret { val } => {
                assert!(matches!(
                    lf.native.inst(*val),
                    NInst::GcRelocate { index: 0, .. }
                ));
            }
            _ => unreachable!(),
        }
        assert_eq!(lf.stackmaps.len(), 1);
        let rec = lf.stackmaps.get(0).unwrap();
        assert_eq!(rec.target(), irsmp::CallTarget::CodeRelative(64));
        assert_eq!(rec.deopt_id(), 7);
        assert!(!rec.is_tailcall());
    }

    #[test]
    fn constants_rematerialise_after_calls() {
        let mut fg = Function::new("f", 0);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(3),
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::Return { val: sid(0) });
        fg.push_block(b0).unwrap();
        let mut lv = Liveness::new(2);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        let insts = block_insts(&lf.native, "bb0");
        let sp_pos = insts
            .iter()
            .position(|v| matches!(lf.native.inst(*v), NInst::Statepoint { .. }))
            .unwrap();
        match lf.native.inst(insts[sp_pos]) {
            // Constants are not tracked as roots.
            NInst::Statepoint { gc_roots, .. } => assert!(gc_roots.is_empty()),
            _ => unreachable!(),
        }
        // The constant materialises fresh, after the call.
        let const_pos = insts
            .iter()
            .position(|v| {
                matches!(
                    lf.native.inst(*v),
                    NInst::ConstInt {
                        ty: Ty::Tagged,
                        val: 6
                    }
                )
            })
            .unwrap();
        assert!(const_pos > sp_pos);
    }

    #[test]
    fn exception_edges_reach_the_handler() {
        let mut fg = Function::new("f", 1);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 5,
            source_pos: 1,
        });
        b0.push(Inst::Goto { target: bid(2) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![], Some(tri), true);
        b1.push(Inst::ExceptionObject { dst: sid(2) });
        b1.push(Inst::Return { val: sid(0) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Return { val: sid(1) });
        fg.push_block(b2).unwrap();
        let mut lv = Liveness::new(3);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(1)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // The call became the invoke form, unwinding to the shared handler block.
        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint { edges, .. } => {
                let (normal, unwind) = edges.unwrap();
                assert_eq!(block_label(&lf.native, normal), "cont1");
                assert_eq!(block_label(&lf.native, unwind), "catch0");
            }
            _ => unreachable!(),
        }
        // The handler: landing pad, merge phi fed from the pre-call continuation, then the two
        // handler pseudo-values.
        let catch = block_insts(&lf.native, "catch0");
        assert!(matches!(lf.native.inst(catch[0]), NInst::LandingPad));
        assert!(matches!(lf.native.inst(catch[1]), NInst::Phi { .. }));
        let incomings = lf.native.phi_incomings(catch[1]);
        assert_eq!(incomings.len(), 1);
        assert_eq!(block_label(&lf.native, incomings[0].1), "bb0");
        assert!(matches!(
            lf.native.inst(catch[2]),
            NInst::ExceptionObject { .. }
        ));
        assert!(matches!(
            lf.native.inst(catch[3]),
            NInst::ExceptionData { .. }
        ));
        // The record carries the try-region.
        let rec = lf.stackmaps.get(0).unwrap();
        assert_eq!(rec.try_region(), Some(0));
    }

    #[test]
    fn exception_merge_into_translated_handler() {
        // Same shape as above, but the handler is translated before the call site: the call
        // merges immediately instead of queuing.
        let mut fg = Function::new("f", 1);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::Goto { target: bid(2) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![], Some(tri), true);
        b1.push(Inst::ExceptionObject { dst: sid(2) });
        b1.push(Inst::Return { val: sid(2) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Return { val: sid(1) });
        fg.push_block(b2).unwrap();
        fg.set_visit_order(vec![bid(1), bid(0), bid(2)]);
        let mut lv = Liveness::new(3);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(1)]);
        let lf = lower_function(&fg, &lv).unwrap();

        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint { edges, .. } => {
                assert_eq!(block_label(&lf.native, edges.unwrap().1), "catch0");
            }
            _ => unreachable!(),
        }
        // The merge phi was inserted into the already-terminated handler, before its return.
        let catch = block_insts(&lf.native, "catch0");
        let n = catch.len();
        assert!(matches!(lf.native.inst(catch[0]), NInst::LandingPad));
        assert!(matches!(lf.native.inst(catch[n - 1]), NInst::Ret { .. }));
        assert!(matches!(lf.native.inst(catch[n - 2]), NInst::Phi { .. }));
        let incomings = lf.native.phi_incomings(catch[n - 2]);
        assert_eq!(incomings.len(), 1);
        assert_eq!(block_label(&lf.native, incomings[0].1), "bb0");
    }

    #[test]
    fn two_throw_sites_build_one_handler_phi() {
        let mut fg = Function::new("f", 1);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(2),
            target: 8,
            argc: 0,
            deopt_id: 1,
            source_pos: 0,
        });
        b0.push(Inst::Goto { target: bid(2) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![], Some(tri), true);
        b1.push(Inst::Return { val: sid(0) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Return { val: sid(2) });
        fg.push_block(b2).unwrap();
        let mut lv = Liveness::new(3);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(2)]);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        lv.set_call_out(InstId::new(bid(0), 2), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // Each throw site contributed one edge to the handler's merge phi: the first from the
        // calling block itself, the second from the first call's continuation.
        let catch = block_insts(&lf.native, "catch0");
        let phi = *catch
            .iter()
            .find(|v| matches!(lf.native.inst(**v), NInst::Phi { .. }))
            .unwrap();
        let incomings = lf.native.phi_incomings(phi);
        assert_eq!(incomings.len(), 2);
        let labels = incomings
            .iter()
            .map(|(_, bb)| block_label(&lf.native, *bb))
            .collect::<Vec<_>>();
        assert!(labels.contains(&"bb0".to_owned()));
        assert!(labels.contains(&"cont1".to_owned()));
        assert_eq!(lf.stackmaps.len(), 2);
    }

    #[test]
    fn two_throw_sites_merge_after_handler_translation() {
        // Same shape, but the handler is translated first: both call sites merge into the
        // already-terminated handler block instead of queuing.
        let mut fg = Function::new("f", 1);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::StaticCall {
            dst: sid(2),
            target: 8,
            argc: 0,
            deopt_id: 1,
            source_pos: 0,
        });
        b0.push(Inst::Goto { target: bid(2) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![], Some(tri), true);
        b1.push(Inst::ExceptionObject { dst: sid(3) });
        b1.push(Inst::Return { val: sid(3) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Return { val: sid(2) });
        fg.push_block(b2).unwrap();
        fg.set_visit_order(vec![bid(1), bid(0), bid(2)]);
        let mut lv = Liveness::new(4);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(2)]);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        lv.set_call_out(InstId::new(bid(0), 2), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // Visit order must not change the outcome: the same 2-edge phi, inserted before the
        // handler's terminator.
        let catch = block_insts(&lf.native, "catch0");
        let n = catch.len();
        assert!(matches!(lf.native.inst(catch[n - 1]), NInst::Ret { .. }));
        assert!(matches!(lf.native.inst(catch[n - 2]), NInst::Phi { .. }));
        let incomings = lf.native.phi_incomings(catch[n - 2]);
        assert_eq!(incomings.len(), 2);
        let labels = incomings
            .iter()
            .map(|(_, bb)| block_label(&lf.native, *bb))
            .collect::<Vec<_>>();
        assert!(labels.contains(&"bb0".to_owned()));
        assert!(labels.contains(&"cont1".to_owned()));
    }

    #[test]
    fn constant_live_in_crosses_exception_edge_without_phi() {
        let mut fg = Function::new("f", 0);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(7),
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::Goto { target: bid(2) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![], Some(tri), true);
        b1.push(Inst::Return { val: sid(0) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![bid(0)], None, false);
        b2.push(Inst::Return { val: sid(1) });
        fg.push_block(b2).unwrap();
        let mut lv = Liveness::new(2);
        lv.set_live_in(bid(1), &[sid(0)]);
        lv.set_live_in(bid(2), &[sid(1)]);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        // The constant crosses the edge as a descriptor and rematerialises in the handler.
        let catch = block_insts(&lf.native, "catch0");
        assert!(!catch
            .iter()
            .any(|v| matches!(lf.native.inst(*v), NInst::Phi { .. })));
        assert!(catch.iter().any(|v| {
            matches!(
                lf.native.inst(*v),
                NInst::ConstInt {
                    ty: Ty::Tagged,
                    val: 14
                }
            )
        }));
    }

    #[test]
    fn disagreeing_constant_live_ins_are_a_mismatch() {
        // Two throw sites whose value maps carry different constants for the same id cannot
        // merge.
        let mut fg = Function::new("f", 0);
        let tri = TryRegionId::new(0).unwrap();
        let mut b0 = Block::new(vec![], Some(tri), false);
        b0.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(1),
        });
        b0.push(Inst::StaticCall {
            dst: sid(1),
            target: 0,
            argc: 0,
            deopt_id: 0,
            source_pos: 0,
        });
        b0.push(Inst::Goto { target: bid(1) });
        fg.push_block(b0).unwrap();
        let mut b1 = Block::new(vec![bid(0)], Some(tri), false);
        b1.push(Inst::NumConst {
            dst: sid(0),
            val: NumConst::Smi(2),
        });
        b1.push(Inst::StaticCall {
            dst: sid(2),
            target: 0,
            argc: 0,
            deopt_id: 1,
            source_pos: 0,
        });
        b1.push(Inst::Return { val: sid(2) });
        fg.push_block(b1).unwrap();
        let mut b2 = Block::new(vec![], Some(tri), true);
        b2.push(Inst::Return { val: sid(0) });
        fg.push_block(b2).unwrap();
        let mut lv = Liveness::new(3);
        lv.set_live_in(bid(2), &[sid(0)]);
        assert!(matches!(
            lower_function(&fg, &lv),
            Err(LowerError::ConstantMismatch(0))
        ));
    }

    #[test]
    fn tail_calls_skip_root_tracking() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::TailCall {
            code: Obj::Code("reentry".to_owned()),
        });
        fg.push_block(b0).unwrap();
        let mut lv = Liveness::new(1);
        lv.set_call_out(InstId::new(bid(0), 1), &[sid(0)]);
        let lf = lower_function(&fg, &lv).unwrap();

        let insts = block_insts(&lf.native, "bb0");
        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint { gc_roots, .. } => assert!(gc_roots.is_empty()),
            _ => unreachable!(),
        }
        assert!(!insts
            .iter()
            .any(|v| matches!(lf.native.inst(*v), NInst::GcRelocate { .. } | NInst::GcResult { .. })));
        assert!(matches!(
            lf.native.inst(*insts.last().unwrap()),
            NInst::TailRet
        ));
        let rec = lf.stackmaps.get(0).unwrap();
        assert!(rec.is_tailcall());
        assert_eq!(rec.target(), irsmp::CallTarget::CodeObject);
        // The callee's code object went through the pooled-object table.
        assert_eq!(lf.native.pool_len(), 1);
    }

    #[test]
    fn instance_call_threads_receiver_and_cache() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::PushArg { val: sid(0) });
        b0.push(Inst::InstanceCall {
            dst: sid(1),
            ic_data: Obj::Str("cache".to_owned()),
            argc: 1,
            deopt_id: 2,
            source_pos: 3,
        });
        b0.push(Inst::Return { val: sid(1) });
        fg.push_block(b0).unwrap();
        let lv = Liveness::new(2);
        let lf = lower_function(&fg, &lv).unwrap();

        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint { args, .. } => {
                assert_eq!(args.len(), CC_REG_PARAM_COUNT + 1);
                // The receiver register carries the last-pushed argument.
                assert_eq!(args[CcReg::Receiver as usize], args[CC_REG_PARAM_COUNT]);
                assert!(!lf.native.is_undef(args[CcReg::IcData as usize]));
                assert!(!lf.native.is_undef(args[CcReg::CallTarget as usize]));
            }
            _ => unreachable!(),
        }
        // The cache object and the call stub both live in the pool.
        assert_eq!(lf.native.pool_len(), 2);
        let rec = lf.stackmaps.get(0).unwrap();
        assert_eq!(
            rec.target(),
            irsmp::CallTarget::Register(CcReg::CallTarget as u8)
        );
    }

    #[test]
    fn throw_calls_runtime_and_traps() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::PushArg { val: sid(0) });
        b0.push(Inst::Throw {
            deopt_id: 11,
            source_pos: 4,
        });
        fg.push_block(b0).unwrap();
        let lv = Liveness::new(1);
        let lf = lower_function(&fg, &lv).unwrap();

        let insts = block_insts(&lf.native, "bb0");
        assert!(matches!(lf.native.inst(*insts.last().unwrap()), NInst::Trap));
        let sp = find_statepoint(&lf.native, "bb0");
        match lf.native.inst(sp) {
            NInst::Statepoint { args, .. } => {
                // One staged argument, and the entry's code object read off the thread.
                assert_eq!(args.len(), CC_REG_PARAM_COUNT + 1);
                assert!(matches!(
                    lf.native.inst(args[CcReg::Code as usize]),
                    NInst::Load { .. }
                ));
            }
            _ => unreachable!(),
        }
        let rec = lf.stackmaps.get(0).unwrap();
        assert_eq!(rec.target(), irsmp::CallTarget::CodeObject);
        assert_eq!(rec.deopt_id(), 11);
    }

    #[test]
    fn class_id_load_diamonds_on_possible_smi() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::LoadClassId {
            dst: sid(1),
            obj: sid(0),
            maybe_smi: true,
        });
        b0.push(Inst::Return { val: sid(1) });
        fg.push_block(b0).unwrap();
        let lv = Liveness::new(2);
        let lf = lower_function(&fg, &lv).unwrap();

        // bb0 ends in the dispatch branch; the return follows the rejoined value.
        let b0_insts = block_insts(&lf.native, "bb0");
        assert!(matches!(
            lf.native.inst(*b0_insts.last().unwrap()),
            NInst::CondBr { .. }
        ));
        let join = block_insts(&lf.native, "diamond1_join");
        assert!(matches!(lf.native.inst(join[0]), NInst::Phi { .. }));
        assert!(matches!(
            lf.native.inst(*join.last().unwrap()),
            NInst::Ret { .. }
        ));
    }

    #[test]
    fn indirect_goto_is_unsupported() {
        let mut fg = Function::new("f", 1);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Param {
            dst: sid(0),
            index: 0,
        });
        b0.push(Inst::IndirectGoto { target: sid(0) });
        fg.push_block(b0).unwrap();
        let lv = Liveness::new(1);
        assert!(matches!(
            lower_function(&fg, &lv),
            Err(LowerError::Unsupported("IndirectGoto"))
        ));
    }

    #[test]
    fn use_before_definition_is_an_error() {
        let mut fg = Function::new("f", 0);
        let mut b0 = Block::new(vec![], None, false);
        b0.push(Inst::Return { val: sid(3) });
        fg.push_block(b0).unwrap();
        let lv = Liveness::new(4);
        assert!(matches!(
            lower_function(&fg, &lv),
            Err(LowerError::UndefinedValue(3))
        ));
    }
}
