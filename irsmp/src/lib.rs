//! Call-site metadata records produced by the lowering engine.
//!
//! Every call the engine lowers is wrapped in a patch point. The record for a patch point is the
//! "file format" boundary handed to the later metadata-emission stage, which turns these into
//! deoptimisation and GC tables. The ordering contract matters: the index of a GC root in the
//! call's root set must correspond bit-exactly with the index the relocation accessor is queried
//! with, and patch ids must be unique within a function.

use std::collections::HashSet;
use thiserror::Error;

/// An error arising when recording call-site metadata.
#[derive(Debug, Error)]
pub enum StackMapError {
    /// A record with this patch id has already been submitted. The engine allocates patch ids
    /// monotonically, so a duplicate means internal state has been corrupted.
    #[error("overlapping submission for patch id {0}")]
    DuplicatePatchId(u64),
}

/// How the machine-code patcher should locate the target of a lowered call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallTarget {
    /// An absolute reference to a code object (e.g. a runtime entry read off the thread).
    CodeObject,
    /// A target addressed relative to the start of the code region.
    CodeRelative(i64),
    /// The target address is in the numbered convention register at call time.
    Register(u8),
}

/// The metadata for one patch point.
///
/// Created by the per-operation lowering with the statically known fields filled in; the call
/// resolver sets the patch id, try-region and tail-call flag just before submission. After
/// submission a record is immutable.
#[derive(Debug)]
pub struct CallSiteInfo {
    target: CallTarget,
    deopt_id: u64,
    source_pos: u32,
    stack_parameter_count: usize,
    /// An estimate, in bytes, of the patchable instruction sequence at the call site.
    instruction_size: usize,
    try_region: Option<u32>,
    is_tailcall: bool,
    patchid: u64,
}

impl CallSiteInfo {
    pub fn new(
        target: CallTarget,
        deopt_id: u64,
        source_pos: u32,
        stack_parameter_count: usize,
        instruction_size: usize,
    ) -> Self {
        Self {
            target,
            deopt_id,
            source_pos,
            stack_parameter_count,
            instruction_size,
            try_region: None,
            is_tailcall: false,
            patchid: 0,
        }
    }

    pub fn set_patchid(&mut self, patchid: u64) {
        self.patchid = patchid;
    }

    pub fn set_try_region(&mut self, try_region: Option<u32>) {
        self.try_region = try_region;
    }

    pub fn set_is_tailcall(&mut self, is_tailcall: bool) {
        self.is_tailcall = is_tailcall;
    }

    pub fn target(&self) -> CallTarget {
        self.target
    }

    pub fn deopt_id(&self) -> u64 {
        self.deopt_id
    }

    pub fn source_pos(&self) -> u32 {
        self.source_pos
    }

    pub fn stack_parameter_count(&self) -> usize {
        self.stack_parameter_count
    }

    pub fn instruction_size(&self) -> usize {
        self.instruction_size
    }

    pub fn try_region(&self) -> Option<u32> {
        self.try_region
    }

    pub fn is_tailcall(&self) -> bool {
        self.is_tailcall
    }

    pub fn patchid(&self) -> u64 {
        self.patchid
    }
}

/// The per-function registry of call-site records.
///
/// Records are kept in submission order, which for the lowering engine is also ascending patch-id
/// order.
pub struct StackMapTable {
    recs: Vec<CallSiteInfo>,
    seen: HashSet<u64>,
}

impl StackMapTable {
    pub fn new() -> Self {
        Self {
            recs: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `info`. Each patch id may be submitted exactly once.
    pub fn submit(&mut self, info: CallSiteInfo) -> Result<(), StackMapError> {
        if !self.seen.insert(info.patchid()) {
            return Err(StackMapError::DuplicatePatchId(info.patchid()));
        }
        self.recs.push(info);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallSiteInfo> {
        self.recs.iter()
    }

    pub fn get(&self, patchid: u64) -> Option<&CallSiteInfo> {
        self.recs.iter().find(|r| r.patchid() == patchid)
    }
}

impl Default for StackMapTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(patchid: u64) -> CallSiteInfo {
        let mut info = CallSiteInfo::new(CallTarget::CodeRelative(0), 3, 7, 2, 4);
        info.set_patchid(patchid);
        info
    }

    #[test]
    fn submission_order_preserved() {
        let mut t = StackMapTable::new();
        t.submit(dummy(0)).unwrap();
        t.submit(dummy(1)).unwrap();
        t.submit(dummy(2)).unwrap();
        let ids = t.iter().map(|r| r.patchid()).collect::<Vec<_>>();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(t.get(1).unwrap().deopt_id(), 3);
    }

    #[test]
    fn duplicate_patchid_rejected() {
        let mut t = StackMapTable::new();
        t.submit(dummy(4)).unwrap();
        assert!(matches!(
            t.submit(dummy(4)),
            Err(StackMapError::DuplicatePatchId(4))
        ));
    }
}
