//! Call lowering.
//!
//! Every call the engine emits, whatever its target kind, goes through a [CallResolver]: a
//! one-shot builder that assembles the register-role operands, captures the GC root set and (for
//! calls inside a try-region) the handler's live-in snapshot, emits the statepoint, rewrites the
//! caller's value map with relocated values, and submits one call-site record.

use super::{ExceptionLiveIn, Lowerer, ValueDesc};
use crate::{
    backend::{Ty, ValueIdx},
    liveness::{iter_set, InstId},
    ssa_ir::SsaId,
    LowerError,
};
use irsmp::{CallSiteInfo, CallTarget};
use std::{collections::HashMap, mem};
use strum::EnumCount;

/// The byte size of the patchable call instruction a statepoint stands in for.
pub(crate) const CALL_INSTRUCTION_SIZE: usize = 4;

/// The register roles of the calling convention, in parameter order. The generated function
/// receives these same roles as its leading parameters, followed by the stack-parameter area.
#[derive(Copy, Clone, Debug, EnumCount, Eq, PartialEq)]
pub(crate) enum CcReg {
    /// The callee's code object.
    Code,
    /// The arguments descriptor.
    ArgsDesc,
    /// The caller's frame pointer.
    Fp,
    /// The pooled-object table pointer.
    Pp,
    /// The per-thread state pointer.
    Thread,
    /// The inline-cache data object (instance calls only).
    IcData,
    /// The resolved call target (instance calls only).
    CallTarget,
    /// The receiver (instance calls only).
    Receiver,
}

pub(crate) const CC_REG_PARAM_COUNT: usize = CcReg::COUNT;
static_assertions::const_assert_eq!(CC_REG_PARAM_COUNT, 8);

/// Lowers one call site. Consumed by [Self::build_call].
pub(crate) struct CallResolver<'l, 'a> {
    lw: &'l mut Lowerer<'a>,
    /// The SSA id the call defines, used to label the continuation block. `None` for calls with
    /// no definition (runtime entries, tail calls).
    ssa: Option<SsaId>,
    info: CallSiteInfo,
    iid: InstId,
    tail_call: bool,
    /// Register-role operands first, then stack parameters.
    parameters: Vec<ValueIdx>,
    /// (ssa, root index) pairs: which value-map entries must be rewritten with relocations.
    gc_descs: Vec<(SsaId, usize)>,
}

impl<'l, 'a> CallResolver<'l, 'a> {
    pub(crate) fn new(
        lw: &'l mut Lowerer<'a>,
        ssa: Option<SsaId>,
        info: CallSiteInfo,
        iid: InstId,
        tail_call: bool,
    ) -> Self {
        // Unassigned roles stay undef; the environment registers are always threaded through.
        let mut parameters = Vec::with_capacity(CC_REG_PARAM_COUNT + info.stack_parameter_count());
        for i in 0..CC_REG_PARAM_COUNT {
            let ty = if i == CcReg::Fp as usize || i == CcReg::Thread as usize {
                Ty::Ptr
            } else {
                Ty::Tagged
            };
            parameters.push(lw.nm.undef(ty));
        }
        // Only the pool pointer is threaded through explicitly; the emitter fills the thread and
        // frame registers at the call site.
        parameters[CcReg::Pp as usize] = lw.pp();
        Self {
            lw,
            ssa,
            info,
            iid,
            tail_call,
            parameters,
            gc_descs: Vec::new(),
        }
    }

    pub(crate) fn set_reg(&mut self, reg: CcReg, val: ValueIdx) {
        self.parameters[reg as usize] = val;
    }

    /// Append one stack parameter. Stack parameters must be in the tagged representation.
    pub(crate) fn add_stack_parameter(&mut self, val: ValueIdx) {
        assert_eq!(self.lw.nm.ty_of(val), Ty::Tagged);
        self.parameters.push(val);
        assert!(
            self.parameters.len() - CC_REG_PARAM_COUNT <= self.info.stack_parameter_count(),
            "more stack parameters than the call site declares"
        );
    }

    /// Move the top `argc` staged arguments into the stack-parameter area. Arguments were pushed
    /// first-to-last, so popping yields them in reverse: the receiver of an instance call ends up
    /// at stack position `argc - 1`.
    pub(crate) fn add_staged_arguments(&mut self, argc: usize) -> Result<(), LowerError> {
        for _ in 0..argc {
            let v = self.lw.pushed_args.pop().ok_or_else(|| {
                LowerError::Internal("call consumes more arguments than were staged".into())
            })?;
            self.add_stack_parameter(v);
        }
        Ok(())
    }

    pub(crate) fn stack_parameter(&self, i: usize) -> ValueIdx {
        self.parameters[CC_REG_PARAM_COUNT + i]
    }

    /// Emit the call. Returns the call's defined value, or `None` for tail calls.
    pub(crate) fn build_call(mut self) -> Result<Option<ValueIdx>, LowerError> {
        assert_eq!(
            self.parameters.len() - CC_REG_PARAM_COUNT,
            self.info.stack_parameter_count()
        );
        if matches!(self.info.target(), CallTarget::CodeObject) {
            assert!(
                !self.lw.nm.is_undef(self.parameters[CcReg::Code as usize]),
                "code-object call without a code value"
            );
        }

        let bid = self.lw.current();
        let try_region = self.lw.fg.block(bid).try_region();
        let handler = if self.tail_call {
            None
        } else {
            try_region.and_then(|t| self.lw.fg.catch_entry(t))
        };

        let patchid = self.lw.next_patch_point();

        // The GC root set: everything live across the call, except constants (rematerialised
        // instead) and everything for tail calls (the frame is gone).
        let mut gc_roots = Vec::new();
        if !self.tail_call {
            let live = iter_set(self.lw.liveness.call_out(self.iid)).collect::<Vec<_>>();
            for ssa in live {
                let desc = self.lw.blocks[bid]
                    .vals
                    .get(&ssa)
                    .cloned()
                    .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?;
                match desc {
                    ValueDesc::Const { def, .. } => {
                        // The cached value dies with the call.
                        self.lw.blocks[bid]
                            .vals
                            .insert(ssa, ValueDesc::Const { def, cached: None });
                    }
                    ValueDesc::Value(v) => {
                        self.gc_descs.push((ssa, gc_roots.len()));
                        gc_roots.push(v);
                    }
                }
            }
        }

        // Snapshot the handler's live-ins before the call mutates the value map.
        let mut exc_live_in = HashMap::new();
        if let Some(handler) = handler {
            let live = iter_set(self.lw.liveness.live_in(handler)).collect::<Vec<_>>();
            for ssa in live {
                let mut desc = self.lw.blocks[bid]
                    .vals
                    .get(&ssa)
                    .cloned()
                    .ok_or(LowerError::UndefinedValue(ssa.to_usize()))?;
                if let ValueDesc::Const { cached, .. } = &mut desc {
                    *cached = None;
                }
                exc_live_in.insert(ssa, desc);
            }
        }

        // The exceptional edge leaves from wherever the calling block's translation had reached
        // when the call was emitted, not from the continuation the call is about to create.
        let pre_call_cont = self.lw.blocks[bid]
            .continuation
            .expect("calling block has no native block");

        let args = mem::take(&mut self.parameters);
        let mut continuation = None;
        let edges = if let Some(handler) = handler {
            let catch_nb = self.lw.ensure_native_block(handler)?;
            let label = match self.ssa {
                Some(ssa) => format!("cont{ssa}"),
                None => "cont".to_owned(),
            };
            let cont = self.lw.nm.append_block(&label);
            continuation = Some(cont);
            Some((cont, catch_nb))
        } else {
            None
        };
        let statepoint =
            self.lw
                .nm
                .build_statepoint(patchid, self.info.instruction_size(), args, gc_roots, edges);
        if self.tail_call {
            self.lw.nm.build_tail_ret();
        }

        // Forward the snapshot along the exceptional edge.
        if let Some(handler) = handler {
            let entry = ExceptionLiveIn {
                vals: exc_live_in,
                from: pre_call_cont,
            };
            if self.lw.blocks[handler].started {
                // The handler is already translated (and terminated): insert the merge phis
                // before its terminator.
                let saved = self.lw.nm.cursor();
                let catch_nb = self.lw.blocks[handler].native.unwrap();
                self.lw.nm.position_before_terminator(catch_nb);
                self.lw.merge_exception_live_in(&entry, handler)?;
                self.lw.nm.set_cursor(saved);
            } else {
                self.lw.blocks[handler].exception_entries.push(entry);
            }
        }

        // Normal control resumes in the continuation block.
        if let Some(cont) = continuation {
            self.lw.nm.position_at_end(cont);
            self.lw.set_current_continuation(cont);
        }

        let call_value = if self.tail_call {
            None
        } else {
            for &(ssa, idx) in &self.gc_descs {
                let rel = self.lw.nm.build_gc_relocate(statepoint, idx);
                self.lw.blocks[bid].vals.insert(ssa, ValueDesc::Value(rel));
            }
            Some(self.lw.nm.build_gc_result(statepoint))
        };

        self.info.set_patchid(patchid);
        self.info.set_is_tailcall(self.tail_call);
        self.info
            .set_try_region(try_region.map(|t| u32::try_from(t.to_usize()).unwrap()));
        self.lw.smaps.submit(self.info)?;
        Ok(call_value)
    }
}
