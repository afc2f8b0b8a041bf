//! Internal two-way diamonds.
//!
//! Some single IR operations expand into a conditional: two native arms that rejoin and produce
//! one value. The [DiamondResolver] owns the three native blocks of such an expansion and, on
//! [DiamondResolver::end], shifts the enclosing block's continuation to the join block so that
//! later merges see the right predecessor edge.

use super::Lowerer;
use crate::{backend::BlockIdx, ssa_ir::SsaId, LowerError};
use crate::backend::ValueIdx;

pub(crate) struct DiamondResolver {
    left: BlockIdx,
    right: BlockIdx,
    join: BlockIdx,
    left_val: Option<ValueIdx>,
    right_val: Option<ValueIdx>,
}

impl DiamondResolver {
    /// `ssa` is the id the expansion defines, used only for block labels.
    pub(crate) fn new(lw: &mut Lowerer, ssa: SsaId) -> Self {
        let left = lw.nm.append_block(&format!("diamond{ssa}_left"));
        let right = lw.nm.append_block(&format!("diamond{ssa}_right"));
        let join = lw.nm.append_block(&format!("diamond{ssa}_join"));
        Self {
            left,
            right,
            join,
            left_val: None,
            right_val: None,
        }
    }

    /// Branch on `cond` (true: left arm, false: right arm). `cond` must already have been built
    /// at the current cursor.
    pub(crate) fn build_cmp(&mut self, lw: &mut Lowerer, cond: ValueIdx) {
        lw.nm.build_cond_br(cond, self.left, self.right);
    }

    pub(crate) fn build_left<F>(&mut self, lw: &mut Lowerer, f: F) -> Result<(), LowerError>
    where
        F: FnOnce(&mut Lowerer) -> Result<ValueIdx, LowerError>,
    {
        lw.nm.position_at_end(self.left);
        self.left_val = Some(f(lw)?);
        lw.nm.build_br(self.join);
        Ok(())
    }

    pub(crate) fn build_right<F>(&mut self, lw: &mut Lowerer, f: F) -> Result<(), LowerError>
    where
        F: FnOnce(&mut Lowerer) -> Result<ValueIdx, LowerError>,
    {
        lw.nm.position_at_end(self.right);
        self.right_val = Some(f(lw)?);
        lw.nm.build_br(self.join);
        Ok(())
    }

    /// Join the arms: emit the merging phi, leave the cursor at the join block and make it the
    /// enclosing block's continuation.
    pub(crate) fn end(self, lw: &mut Lowerer) -> ValueIdx {
        lw.nm.position_at_end(self.join);
        let l = self.left_val.expect("left arm not built");
        let r = self.right_val.expect("right arm not built");
        let phi = lw.nm.build_phi(lw.nm.ty_of(l));
        lw.nm.add_incoming(phi, l, self.left);
        lw.nm.add_incoming(phi, r, self.right);
        lw.set_current_continuation(self.join);
        phi
    }
}
