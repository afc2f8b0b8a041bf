//! The native output module.
//!
//! This models the external code-generation backend the engine lowers into: an LLVM-like typed
//! SSA module with explicit basic blocks, an insertion cursor, phi nodes, and a "statepoint"
//! calling convention (a call wrapper that carries a GC root set, plus post-call relocation and
//! result accessors). Instructions live in one arena ([NativeModule::vals]) and blocks hold
//! ordered lists of arena indices; everything downstream of here (register allocation,
//! scheduling, actual encoding) is somebody else's problem.
//!
//! The module also owns the two constant-materialisation sources: the pooled-object table and
//! the fixed per-thread slots for common objects.

use crate::ssa_ir::{BinOp, Obj, Predicate};
use crate::LowerError;
use indexmap::IndexSet;
use smallvec::SmallVec;
use std::fmt;
use typed_index_collections::TiVec;

/// Objects on the heap are referenced through tagged pointers; subtract this before dereferencing.
pub const HEAP_OBJECT_TAG: i32 = 1;
/// Small integers are stored shifted left by this many bits, low bit zero.
pub const SMI_TAG_SIZE: i64 = 1;
pub const SMI_TAG_MASK: i64 = 1;
/// The class id of small integers.
pub const SMI_CID: i64 = 1;
/// Byte offset of the class-id field within an object header.
pub const OBJ_CLASS_ID_OFFSET: i32 = 4;
/// Byte offset of the first element of the pooled-object table.
pub const POOL_DATA_OFFSET: i32 = 16;

/// The tagged encoding of the small integer `v`.
pub fn raw_smi(v: i64) -> i64 {
    v << SMI_TAG_SIZE
}

/// The fixed per-thread slot holding `obj`, for the few objects the backend recognises.
pub fn thread_slot(obj: &Obj) -> Option<i32> {
    match obj {
        Obj::Null => Some(72),
        Obj::True => Some(80),
        Obj::False => Some(88),
        _ => None,
    }
}

/// A native value type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ty {
    /// The generic tagged-pointer representation: the only type the collector traces.
    Tagged,
    /// An untagged raw pointer.
    Ptr,
    /// An integer of the given bit width; `Int(1)` is boolean.
    Int(u32),
    Float,
    Double,
    /// A statepoint or landing-pad token.
    Token,
    Void,
}

impl Ty {
    /// The native integer width.
    pub fn intptr() -> Ty {
        Ty::Int(64)
    }

    pub fn boolean() -> Ty {
        Ty::Int(1)
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Tagged => write!(f, "tagged"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Int(w) => write!(f, "i{w}"),
            Ty::Float => write!(f, "float"),
            Ty::Double => write!(f, "double"),
            Ty::Token => write!(f, "token"),
            Ty::Void => write!(f, "void"),
        }
    }
}

/// A cast operator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CastKind {
    IntToPtr,
    PtrToInt,
    ZExt,
    Trunc,
}

impl fmt::Display for CastKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CastKind::IntToPtr => "inttoptr",
            CastKind::PtrToInt => "ptrtoint",
            CastKind::ZExt => "zext",
            CastKind::Trunc => "trunc",
        };
        write!(f, "{s}")
    }
}

// Index types for the value arena and block list.

/// An index into [NativeModule::vals].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ValueIdx(u32);

impl From<usize> for ValueIdx {
    fn from(v: usize) -> Self {
        Self(u32::try_from(v).unwrap())
    }
}

impl From<ValueIdx> for usize {
    fn from(v: ValueIdx) -> Self {
        usize::try_from(v.0).unwrap()
    }
}

impl fmt::Display for ValueIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An index into [NativeModule::blocks].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct BlockIdx(u32);

impl From<usize> for BlockIdx {
    fn from(v: usize) -> Self {
        Self(u32::try_from(v).unwrap())
    }
}

impl From<BlockIdx> for usize {
    fn from(v: BlockIdx) -> Self {
        usize::try_from(v.0).unwrap()
    }
}

/// A native instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    /// A function parameter. Not a member of any block.
    Param { index: usize, ty: Ty },
    ConstInt { ty: Ty, val: i64 },
    ConstDouble { val: f64 },
    ConstFloat { val: f32 },
    Undef { ty: Ty },
    Phi {
        ty: Ty,
        incomings: SmallVec<[(ValueIdx, BlockIdx); 2]>,
    },
    Cast {
        kind: CastKind,
        val: ValueIdx,
        ty: Ty,
    },
    BinOp {
        op: BinOp,
        lhs: ValueIdx,
        rhs: ValueIdx,
    },
    ICmp {
        pred: Predicate,
        lhs: ValueIdx,
        rhs: ValueIdx,
    },
    /// A byte-offset address computation.
    Gep { base: ValueIdx, offset: ValueIdx },
    Load { ptr: ValueIdx, ty: Ty },
    Store { ptr: ValueIdx, val: ValueIdx },
    /// The root-set-aware call wrapper. With `edges` set this is the exceptional (invoke) form
    /// and terminates its block.
    Statepoint {
        patchid: u64,
        instruction_size: usize,
        args: Vec<ValueIdx>,
        gc_roots: Vec<ValueIdx>,
        /// `(normal, unwind)` destinations for the invoke form.
        edges: Option<(BlockIdx, BlockIdx)>,
    },
    /// Read back the (possibly moved) `index`th root of `statepoint` after the call.
    GcRelocate {
        statepoint: ValueIdx,
        index: usize,
    },
    /// The call's return value.
    GcResult { statepoint: ValueIdx },
    /// The exception-landing construct at the head of a handler block.
    LandingPad,
    /// The thrown object, read off a landing pad.
    ExceptionObject { pad: ValueIdx },
    /// The stack-trace object, read off a landing pad.
    ExceptionData { pad: ValueIdx },
    Br { dest: BlockIdx },
    CondBr {
        cond: ValueIdx,
        true_dest: BlockIdx,
        false_dest: BlockIdx,
    },
    Ret { val: ValueIdx },
    /// Return after a tail call; the callee's frame has replaced ours.
    TailRet,
    /// Unreachable; placed after calls that cannot return.
    Trap,
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Br { .. }
                | Inst::CondBr { .. }
                | Inst::Ret { .. }
                | Inst::TailRet
                | Inst::Trap
                | Inst::Statepoint { edges: Some(_), .. }
        )
    }
}

/// A native basic block: a label and an ordered list of arena indices.
#[derive(Debug)]
pub struct NativeBlock {
    label: String,
    insts: Vec<ValueIdx>,
}

impl NativeBlock {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn insts(&self) -> &[ValueIdx] {
        &self.insts
    }
}

/// The emission cursor: a block plus an optional fixed position within it (`None` = append).
#[derive(Copy, Clone, Debug)]
pub struct Cursor {
    bb: BlockIdx,
    at: Option<usize>,
}

/// The module under construction.
pub struct NativeModule {
    blocks: TiVec<BlockIdx, NativeBlock>,
    vals: TiVec<ValueIdx, Inst>,
    params: Vec<ValueIdx>,
    prologue: BlockIdx,
    pool: IndexSet<Obj>,
    cursor: Option<Cursor>,
    sealed: bool,
}

impl NativeModule {
    /// Create a module for a function whose parameters have the given types (calling-convention
    /// registers first, then the stack-parameter area).
    pub fn new(param_tys: &[Ty]) -> Self {
        let mut vals = TiVec::new();
        let mut params = Vec::with_capacity(param_tys.len());
        for (index, ty) in param_tys.iter().enumerate() {
            params.push(vals.push_and_get_key(Inst::Param { index, ty: *ty }));
        }
        let mut blocks = TiVec::new();
        let prologue = blocks.push_and_get_key(NativeBlock {
            label: "prologue".to_owned(),
            insts: Vec::new(),
        });
        Self {
            blocks,
            vals,
            params,
            prologue,
            pool: IndexSet::new(),
            cursor: None,
            sealed: false,
        }
    }

    pub fn prologue(&self) -> BlockIdx {
        self.prologue
    }

    pub fn param(&self, index: usize) -> ValueIdx {
        self.params[index]
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    pub fn inst(&self, v: ValueIdx) -> &Inst {
        &self.vals[v]
    }

    pub fn block(&self, bb: BlockIdx) -> &NativeBlock {
        &self.blocks[bb]
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    pub fn append_block(&mut self, label: &str) -> BlockIdx {
        assert!(!self.sealed);
        self.blocks.push_and_get_key(NativeBlock {
            label: label.to_owned(),
            insts: Vec::new(),
        })
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<Cursor>) {
        self.cursor = cursor;
    }

    pub fn position_at_end(&mut self, bb: BlockIdx) {
        self.cursor = Some(Cursor { bb, at: None });
    }

    /// Position the cursor immediately before `bb`'s terminator.
    pub fn position_before_terminator(&mut self, bb: BlockIdx) {
        let n = self.blocks[bb].insts.len();
        assert!(n > 0 && self.vals[self.blocks[bb].insts[n - 1]].is_terminator());
        self.cursor = Some(Cursor {
            bb,
            at: Some(n - 1),
        });
    }

    /// Is `bb` ended by a terminator?
    pub fn is_terminated(&self, bb: BlockIdx) -> bool {
        self.blocks[bb]
            .insts
            .last()
            .is_some_and(|v| self.vals[*v].is_terminator())
    }

    fn push_inst(&mut self, inst: Inst) -> ValueIdx {
        assert!(!self.sealed);
        let cursor = self.cursor.expect("no emission cursor");
        let v = self.vals.push_and_get_key(inst);
        match cursor.at {
            None => {
                assert!(
                    !self.is_terminated(cursor.bb),
                    "emission after terminator in {}",
                    self.blocks[cursor.bb].label
                );
                self.blocks[cursor.bb].insts.push(v);
            }
            Some(at) => {
                self.blocks[cursor.bb].insts.insert(at, v);
                self.cursor = Some(Cursor {
                    bb: cursor.bb,
                    at: Some(at + 1),
                });
            }
        }
        v
    }

    /// The type of the value `v`.
    pub fn ty_of(&self, v: ValueIdx) -> Ty {
        match &self.vals[v] {
            Inst::Param { ty, .. }
            | Inst::ConstInt { ty, .. }
            | Inst::Undef { ty }
            | Inst::Phi { ty, .. }
            | Inst::Cast { ty, .. }
            | Inst::Load { ty, .. } => *ty,
            Inst::ConstDouble { .. } => Ty::Double,
            Inst::ConstFloat { .. } => Ty::Float,
            Inst::BinOp { lhs, .. } => self.ty_of(*lhs),
            Inst::ICmp { .. } => Ty::boolean(),
            Inst::Gep { .. } => Ty::Ptr,
            Inst::Statepoint { .. } | Inst::LandingPad => Ty::Token,
            Inst::GcRelocate { .. }
            | Inst::GcResult { .. }
            | Inst::ExceptionObject { .. }
            | Inst::ExceptionData { .. } => Ty::Tagged,
            Inst::Store { .. }
            | Inst::Br { .. }
            | Inst::CondBr { .. }
            | Inst::Ret { .. }
            | Inst::TailRet
            | Inst::Trap => Ty::Void,
        }
    }

    // Constants.

    pub fn const_int(&mut self, ty: Ty, val: i64) -> ValueIdx {
        debug_assert!(matches!(ty, Ty::Int(_) | Ty::Tagged));
        self.push_inst(Inst::ConstInt { ty, val })
    }

    /// A tagged immediate (e.g. an encoded small integer).
    pub fn const_tagged(&mut self, val: i64) -> ValueIdx {
        self.const_int(Ty::Tagged, val)
    }

    pub fn const_intptr(&mut self, val: i64) -> ValueIdx {
        self.const_int(Ty::intptr(), val)
    }

    pub fn const_double(&mut self, val: f64) -> ValueIdx {
        self.push_inst(Inst::ConstDouble { val })
    }

    pub fn undef(&mut self, ty: Ty) -> ValueIdx {
        // Undef values are block-less operands, not emitted instructions.
        assert!(!self.sealed);
        self.vals.push_and_get_key(Inst::Undef { ty })
    }

    pub fn is_undef(&self, v: ValueIdx) -> bool {
        matches!(self.vals[v], Inst::Undef { .. })
    }

    // Instruction builders. All emit at the cursor.

    pub fn build_phi(&mut self, ty: Ty) -> ValueIdx {
        self.push_inst(Inst::Phi {
            ty,
            incomings: SmallVec::new(),
        })
    }

    pub fn add_incoming(&mut self, phi: ValueIdx, val: ValueIdx, from: BlockIdx) {
        debug_assert_eq!(self.ty_of(phi), self.ty_of(val));
        match &mut self.vals[phi] {
            Inst::Phi { incomings, .. } => incomings.push((val, from)),
            _ => panic!("add_incoming on non-phi"),
        }
    }

    pub fn phi_incomings(&self, phi: ValueIdx) -> &[(ValueIdx, BlockIdx)] {
        match &self.vals[phi] {
            Inst::Phi { incomings, .. } => incomings,
            _ => panic!("phi_incomings on non-phi"),
        }
    }

    pub fn build_cast(&mut self, kind: CastKind, val: ValueIdx, ty: Ty) -> ValueIdx {
        self.push_inst(Inst::Cast { kind, val, ty })
    }

    pub fn build_binop(&mut self, op: BinOp, lhs: ValueIdx, rhs: ValueIdx) -> ValueIdx {
        debug_assert_eq!(self.ty_of(lhs), self.ty_of(rhs));
        self.push_inst(Inst::BinOp { op, lhs, rhs })
    }

    pub fn build_icmp(&mut self, pred: Predicate, lhs: ValueIdx, rhs: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::ICmp { pred, lhs, rhs })
    }

    /// A pointer to `base + offset` where `offset` is in bytes.
    pub fn build_gep(&mut self, base: ValueIdx, offset: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::Gep { base, offset })
    }

    pub fn build_load(&mut self, ptr: ValueIdx, ty: Ty) -> ValueIdx {
        self.push_inst(Inst::Load { ptr, ty })
    }

    pub fn build_store(&mut self, val: ValueIdx, ptr: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::Store { ptr, val })
    }

    pub fn build_br(&mut self, dest: BlockIdx) -> ValueIdx {
        self.push_inst(Inst::Br { dest })
    }

    pub fn build_cond_br(
        &mut self,
        cond: ValueIdx,
        true_dest: BlockIdx,
        false_dest: BlockIdx,
    ) -> ValueIdx {
        debug_assert_eq!(self.ty_of(cond), Ty::boolean());
        self.push_inst(Inst::CondBr {
            cond,
            true_dest,
            false_dest,
        })
    }

    pub fn build_ret(&mut self, val: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::Ret { val })
    }

    pub fn build_tail_ret(&mut self) -> ValueIdx {
        self.push_inst(Inst::TailRet)
    }

    pub fn build_trap(&mut self) -> ValueIdx {
        self.push_inst(Inst::Trap)
    }

    pub fn build_statepoint(
        &mut self,
        patchid: u64,
        instruction_size: usize,
        args: Vec<ValueIdx>,
        gc_roots: Vec<ValueIdx>,
        edges: Option<(BlockIdx, BlockIdx)>,
    ) -> ValueIdx {
        self.push_inst(Inst::Statepoint {
            patchid,
            instruction_size,
            args,
            gc_roots,
            edges,
        })
    }

    /// The relocated value of the `index`th GC root of `statepoint`. The index correspondence
    /// with the root set passed to [Self::build_statepoint] is load-bearing.
    pub fn build_gc_relocate(&mut self, statepoint: ValueIdx, index: usize) -> ValueIdx {
        match &self.vals[statepoint] {
            Inst::Statepoint { gc_roots, .. } => assert!(index < gc_roots.len()),
            _ => panic!("gc_relocate on non-statepoint"),
        }
        self.push_inst(Inst::GcRelocate { statepoint, index })
    }

    pub fn build_gc_result(&mut self, statepoint: ValueIdx) -> ValueIdx {
        debug_assert!(matches!(self.vals[statepoint], Inst::Statepoint { .. }));
        self.push_inst(Inst::GcResult { statepoint })
    }

    pub fn build_landing_pad(&mut self) -> ValueIdx {
        self.push_inst(Inst::LandingPad)
    }

    pub fn build_exception_object(&mut self, pad: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::ExceptionObject { pad })
    }

    pub fn build_exception_data(&mut self, pad: ValueIdx) -> ValueIdx {
        self.push_inst(Inst::ExceptionData { pad })
    }

    // The pooled-object table.

    /// Find or add `obj` in the pooled-object table, returning its element index.
    pub fn pool_find_or_add(&mut self, obj: &Obj) -> usize {
        match self.pool.get_index_of(obj) {
            Some(i) => i,
            None => self.pool.insert_full(obj.clone()).0,
        }
    }

    /// The byte offset of pool element `index` from the constant-pool pointer.
    pub fn pool_element_offset(index: usize) -> i32 {
        POOL_DATA_OFFSET + i32::try_from(index).unwrap() * 8
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Seal the module: no further emission. Every block must be terminated.
    pub fn finalize(&mut self) -> Result<(), LowerError> {
        for (bb, block) in self.blocks.iter_enumerated() {
            if !self.is_terminated(bb) {
                return Err(LowerError::Internal(format!(
                    "unterminated native block {}",
                    block.label
                )));
            }
        }
        self.cursor = None;
        self.sealed = true;
        Ok(())
    }
}

impl fmt::Display for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.params {
            writeln!(f, "param {p}: {}", self.ty_of(*p))?;
        }
        for block in &self.blocks {
            writeln!(f, "{}:", block.label)?;
            for v in &block.insts {
                let inst = &self.vals[*v];
                match self.ty_of(*v) {
                    Ty::Void => writeln!(f, "  {}", self.display_inst(inst))?,
                    ty => writeln!(f, "  {v}: {ty} = {}", self.display_inst(inst))?,
                }
            }
        }
        Ok(())
    }
}

impl NativeModule {
    fn display_inst(&self, inst: &Inst) -> String {
        match inst {
            Inst::Param { index, .. } => format!("param {index}"),
            Inst::ConstInt { val, .. } => format!("const {val}"),
            Inst::ConstDouble { val } => format!("const {val}"),
            Inst::ConstFloat { val } => format!("const {val}"),
            Inst::Undef { .. } => "undef".to_owned(),
            Inst::Phi { incomings, .. } => {
                let parts = incomings
                    .iter()
                    .map(|(v, bb)| format!("[{v}, {}]", self.blocks[*bb].label))
                    .collect::<Vec<_>>();
                format!("phi {}", parts.join(", "))
            }
            Inst::Cast { kind, val, ty } => format!("{kind} {val} to {ty}"),
            Inst::BinOp { op, lhs, rhs } => format!("{op} {lhs}, {rhs}"),
            Inst::ICmp { pred, lhs, rhs } => format!("icmp {pred:?} {lhs}, {rhs}"),
            Inst::Gep { base, offset } => format!("gep {base}, {offset}"),
            Inst::Load { ptr, .. } => format!("load {ptr}"),
            Inst::Store { ptr, val } => format!("store {val}, {ptr}"),
            Inst::Statepoint {
                patchid,
                args,
                gc_roots,
                edges,
                ..
            } => {
                let args = args.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                let roots = gc_roots.iter().map(|v| v.to_string()).collect::<Vec<_>>();
                let mut s = format!(
                    "statepoint id={patchid} args=[{}] roots=[{}]",
                    args.join(", "),
                    roots.join(", ")
                );
                if let Some((normal, unwind)) = edges {
                    s.push_str(&format!(
                        " to {} unwind {}",
                        self.blocks[*normal].label, self.blocks[*unwind].label
                    ));
                }
                s
            }
            Inst::GcRelocate { statepoint, index } => format!("gcrelocate {statepoint}, {index}"),
            Inst::GcResult { statepoint } => format!("gcresult {statepoint}"),
            Inst::LandingPad => "landingpad".to_owned(),
            Inst::ExceptionObject { pad } => format!("exception {pad}"),
            Inst::ExceptionData { pad } => format!("exceptiondata {pad}"),
            Inst::Br { dest } => format!("br {}", self.blocks[*dest].label),
            Inst::CondBr {
                cond,
                true_dest,
                false_dest,
            } => format!(
                "condbr {cond}, {}, {}",
                self.blocks[*true_dest].label, self.blocks[*false_dest].label
            ),
            Inst::Ret { val } => format!("ret {val}"),
            Inst::TailRet => "tailret".to_owned(),
            Inst::Trap => "trap".to_owned(),
        }
    }
}
