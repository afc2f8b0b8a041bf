//! The liveness oracle.
//!
//! Liveness is computed by the upstream optimiser, not here: this module only holds the
//! precomputed answers the engine queries. Two kinds of set exist: per-block live-in sets, and
//! per-call live-out sets ("call live-out": the SSA ids that survive a particular call site and
//! must therefore be treated as GC roots across it).

use crate::ssa_ir::{BlockId, SsaId};
use std::collections::HashMap;
use vob::Vob;

/// Identifies one instruction: its block and its position within the block.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct InstId {
    pub bid: BlockId,
    pub iidx: usize,
}

impl InstId {
    pub fn new(bid: BlockId, iidx: usize) -> Self {
        Self { bid, iidx }
    }
}

/// Precomputed liveness for one function.
pub struct Liveness {
    num_ssa: usize,
    live_ins: HashMap<BlockId, Vob>,
    call_outs: HashMap<InstId, Vob>,
    /// Returned for blocks/calls with no recorded set.
    empty: Vob,
}

impl Liveness {
    /// `num_ssa` is the number of SSA ids the function defines; all sets are sized to it.
    pub fn new(num_ssa: usize) -> Self {
        Self {
            num_ssa,
            live_ins: HashMap::new(),
            call_outs: HashMap::new(),
            empty: Vob::from_elem(false, num_ssa),
        }
    }

    pub fn set_live_in(&mut self, bid: BlockId, ids: &[SsaId]) {
        let set = self
            .live_ins
            .entry(bid)
            .or_insert_with(|| Vob::from_elem(false, self.num_ssa));
        for id in ids {
            set.set(id.to_usize(), true);
        }
    }

    pub fn set_call_out(&mut self, iid: InstId, ids: &[SsaId]) {
        let set = self
            .call_outs
            .entry(iid)
            .or_insert_with(|| Vob::from_elem(false, self.num_ssa));
        for id in ids {
            set.set(id.to_usize(), true);
        }
    }

    /// The SSA ids live on entry to `bid`.
    pub fn live_in(&self, bid: BlockId) -> &Vob {
        self.live_ins.get(&bid).unwrap_or(&self.empty)
    }

    /// The SSA ids live immediately after the call at `iid`.
    pub fn call_out(&self, iid: InstId) -> &Vob {
        self.call_outs.get(&iid).unwrap_or(&self.empty)
    }
}

/// Iterate the members of a liveness set as [SsaId]s.
pub(crate) fn iter_set(set: &Vob) -> impl Iterator<Item = SsaId> + '_ {
    set.iter_set_bits(..).map(|i| SsaId::new(i).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_default_to_empty() {
        let lv = Liveness::new(4);
        let bid = BlockId::new(0).unwrap();
        assert_eq!(lv.live_in(bid).iter_set_bits(..).count(), 0);
        assert_eq!(lv.call_out(InstId::new(bid, 3)).iter_set_bits(..).count(), 0);
    }

    #[test]
    fn recorded_sets_round_trip() {
        let mut lv = Liveness::new(8);
        let bid = BlockId::new(1).unwrap();
        let ids = [SsaId::new(2).unwrap(), SsaId::new(5).unwrap()];
        lv.set_live_in(bid, &ids);
        assert_eq!(iter_set(lv.live_in(bid)).collect::<Vec<_>>(), ids);
    }
}
