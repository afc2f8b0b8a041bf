//! The input IR: a control-flow graph of SSA instructions.
//!
//! This is the form the upstream optimiser hands to the lowering engine. Blocks refer to one
//! another by [BlockId] and values by [SsaId]; there are no back-pointers. Each block carries its
//! ordered predecessor list (successors are implied by the terminator), an optional try-region id
//! and, for exception handlers, the `is_handler` flag.
//!
//! Abbreviations used throughout the crate:
//!
//!  * `bid`: a [BlockId].
//!  * `fg`: the name conventionally given to a shared [Function] instance.
//!  * `iidx`: the position of an instruction within its block.
//!  * `nm`: the native output module (see [crate::backend]).

use crate::LowerError;
use std::collections::HashMap;
use std::fmt;
use typed_index_collections::TiVec;

fn index_overflow(typ: &str) -> LowerError {
    LowerError::LimitExceeded(format!("index overflow: {typ}"))
}

// Generate common methods for 32-bit index types.
macro_rules! index_32bit {
    ($struct:ident) => {
        #[allow(dead_code)]
        impl $struct {
            pub fn new(v: usize) -> Result<Self, LowerError> {
                u32::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(Self)
            }

            pub fn to_usize(self) -> usize {
                usize::try_from(self.0).unwrap()
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **DO NOT USE INTERNALLY as this can `panic`!** Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(v: $struct) -> Self {
                v.to_usize()
            }
        }

        impl fmt::Display for $struct {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Generate common methods for 16-bit index types.
macro_rules! index_16bit {
    ($struct:ident) => {
        #[allow(dead_code)]
        impl $struct {
            pub fn new(v: usize) -> Result<Self, LowerError> {
                u16::try_from(v)
                    .map_err(|_| index_overflow(stringify!($struct)))
                    .map(Self)
            }

            pub fn to_usize(self) -> usize {
                usize::from(self.0)
            }
        }

        impl From<usize> for $struct {
            /// Required for TiVec. **DO NOT USE INTERNALLY as this can `panic`!** Instead, use
            /// [Self::new].
            fn from(v: usize) -> Self {
                Self::new(v).unwrap()
            }
        }

        impl From<$struct> for usize {
            fn from(v: $struct) -> Self {
                v.to_usize()
            }
        }

        impl fmt::Display for $struct {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// A basic block index into [Function::blocks].
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct BlockId(u32);
index_32bit!(BlockId);

/// The stable identifier of a value defined exactly once in the IR.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SsaId(u32);
index_32bit!(SsaId);

/// A try-region id. Blocks inside a `try` scope carry one; the function maps each to its handler
/// block.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct TryRegionId(u16);
index_16bit!(TryRegionId);

/// An integer comparison predicate. Signed where it matters.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    Equal,
    NotEqual,
    SignedGreater,
    SignedGreaterEqual,
    SignedLess,
    SignedLessEqual,
}

/// An integer binary operator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    AShr,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::AShr => "ashr",
        };
        write!(f, "{s}")
    }
}

/// The machine representation an IR value was computed in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rep {
    /// The generic tagged-pointer representation.
    Tagged,
    /// A native-word untagged integer.
    Word,
    Int32,
    Int64,
    Float,
    Double,
}

/// A heap object referenced by a constant definition.
///
/// A few common objects are recognised by the backend and can be read off a fixed per-thread
/// slot; everything else goes through the pooled-object table.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Obj {
    Null,
    True,
    False,
    /// A boxed small integer. Needs no pointer tracking: it is encoded in the tagged word itself.
    Smi(i64),
    /// An interned string object.
    Str(String),
    /// A code object, identified by symbol name (used for stubs and tail-call targets).
    Code(String),
}

/// An unboxed numeric constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NumConst {
    /// A small integer; lowered to a tagged immediate.
    Smi(i64),
    Double(f64),
}

/// The two constant definition kinds the lazy materialiser understands (see
/// [crate::lower::ValueDesc]).
#[derive(Clone, Debug, PartialEq)]
pub enum ConstDef {
    Num(NumConst),
    Obj(Obj),
}

/// A runtime entry: a leaf function the generated code calls through a per-thread table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RuntimeEntry {
    Throw,
    ReThrow,
    StackOverflow,
}

impl RuntimeEntry {
    /// The byte offset of this entry's code object within the thread structure.
    pub fn thread_offset(self) -> i32 {
        match self {
            RuntimeEntry::Throw => 104,
            RuntimeEntry::ReThrow => 112,
            RuntimeEntry::StackOverflow => 120,
        }
    }
}

/// An SSA instruction.
///
/// Only the operations the lowering engine supports are represented; anything else must be
/// rejected upstream or via [crate::LowerError::Unsupported]. Value-producing instructions name
/// their destination [SsaId] explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    /// Define `dst` as an unboxed numeric constant. Materialised lazily on first read.
    NumConst { dst: SsaId, val: NumConst },
    /// Define `dst` as a heap-object constant. Materialised lazily on first read.
    ObjConst { dst: SsaId, obj: Obj },
    /// Read the `index`th declared stack parameter.
    Param { dst: SsaId, index: usize },
    /// An explicit dataflow merge. `inputs` has one entry per predecessor, in predecessor-list
    /// order.
    Phi {
        dst: SsaId,
        rep: Rep,
        inputs: Vec<SsaId>,
    },
    BinOp {
        dst: SsaId,
        op: BinOp,
        lhs: SsaId,
        rhs: SsaId,
    },
    Cmp {
        dst: SsaId,
        pred: Predicate,
        lhs: SsaId,
        rhs: SsaId,
    },
    BoolNegate { dst: SsaId, val: SsaId },
    /// Load `rep`-typed data at `base + offset` (byte offset; `base` is a tagged pointer).
    LoadField {
        dst: SsaId,
        base: SsaId,
        offset: i32,
        rep: Rep,
    },
    StoreField {
        base: SsaId,
        offset: i32,
        val: SsaId,
    },
    /// Load the class id of `obj`, smi-tagged. If `maybe_smi`, the object may be a tagged small
    /// integer and the lowering must test for that inline.
    LoadClassId {
        dst: SsaId,
        obj: SsaId,
        maybe_smi: bool,
    },
    /// The thrown object, readable only inside a handler block.
    ExceptionObject { dst: SsaId },
    /// The stack-trace object, readable only inside a handler block.
    StackTraceObject { dst: SsaId },
    /// Stage a call argument. Consumed, last-pushed-first, by the next call.
    PushArg { val: SsaId },
    /// A direct call to a statically known function, patched code-relative.
    StaticCall {
        dst: SsaId,
        target: i64,
        argc: usize,
        deopt_id: u64,
        source_pos: u32,
    },
    /// A call dispatched through the inline-cache registers; the target register holds the
    /// initial stub.
    InstanceCall {
        dst: SsaId,
        ic_data: Obj,
        argc: usize,
        deopt_id: u64,
        source_pos: u32,
    },
    /// A call to a leaf runtime entry through the per-thread table.
    RuntimeCall {
        dst: SsaId,
        entry: RuntimeEntry,
        argc: usize,
        deopt_id: u64,
        source_pos: u32,
    },
    /// Throw the staged exception object. Control does not return.
    Throw { deopt_id: u64, source_pos: u32 },
    /// Re-throw the staged exception and stack-trace objects. Control does not return.
    ReThrow { deopt_id: u64, source_pos: u32 },
    /// Transfer this frame to another code object. No live-out state survives.
    TailCall { code: Obj },
    Goto { target: BlockId },
    Branch {
        cond: SsaId,
        true_target: BlockId,
        false_target: BlockId,
    },
    Return { val: SsaId },
    /// Computed goto. The engine does not lower this.
    IndirectGoto { target: SsaId },
}

impl Inst {
    /// Does this instruction end its block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Inst::Goto { .. }
                | Inst::Branch { .. }
                | Inst::Return { .. }
                | Inst::TailCall { .. }
                | Inst::Throw { .. }
                | Inst::ReThrow { .. }
                | Inst::IndirectGoto { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Inst::NumConst { .. } => "NumConst",
            Inst::ObjConst { .. } => "ObjConst",
            Inst::Param { .. } => "Param",
            Inst::Phi { .. } => "Phi",
            Inst::BinOp { .. } => "BinOp",
            Inst::Cmp { .. } => "Cmp",
            Inst::BoolNegate { .. } => "BoolNegate",
            Inst::LoadField { .. } => "LoadField",
            Inst::StoreField { .. } => "StoreField",
            Inst::LoadClassId { .. } => "LoadClassId",
            Inst::ExceptionObject { .. } => "ExceptionObject",
            Inst::StackTraceObject { .. } => "StackTraceObject",
            Inst::PushArg { .. } => "PushArg",
            Inst::StaticCall { .. } => "StaticCall",
            Inst::InstanceCall { .. } => "InstanceCall",
            Inst::RuntimeCall { .. } => "RuntimeCall",
            Inst::Throw { .. } => "Throw",
            Inst::ReThrow { .. } => "ReThrow",
            Inst::TailCall { .. } => "TailCall",
            Inst::Goto { .. } => "Goto",
            Inst::Branch { .. } => "Branch",
            Inst::Return { .. } => "Return",
            Inst::IndirectGoto { .. } => "IndirectGoto",
        }
    }
}

/// One CFG node.
#[derive(Debug)]
pub struct Block {
    /// Ordered predecessor list. Exceptional edges are *not* recorded here: a handler's
    /// predecessor list is empty and its incoming values arrive from virtual predecessors (see
    /// [crate::lower]).
    preds: Vec<BlockId>,
    try_region: Option<TryRegionId>,
    is_handler: bool,
    insts: Vec<Inst>,
}

impl Block {
    pub fn new(preds: Vec<BlockId>, try_region: Option<TryRegionId>, is_handler: bool) -> Self {
        Self {
            preds,
            try_region,
            is_handler,
            insts: Vec::new(),
        }
    }

    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    pub fn preds(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn try_region(&self) -> Option<TryRegionId> {
        self.try_region
    }

    pub fn is_handler(&self) -> bool {
        self.is_handler
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }
}

/// A function's flow graph, as supplied by the upstream optimiser.
#[derive(Debug)]
pub struct Function {
    name: String,
    blocks: TiVec<BlockId, Block>,
    /// The number of declared stack parameters.
    num_params: usize,
    /// try-region id -> handler block.
    catch_entries: HashMap<TryRegionId, BlockId>,
    /// The visitation order the driver uses (reverse postorder, computed upstream). When absent,
    /// insertion order is used.
    visit_order: Option<Vec<BlockId>>,
}

impl Function {
    pub fn new(name: &str, num_params: usize) -> Self {
        Self {
            name: name.to_owned(),
            blocks: TiVec::new(),
            num_params,
            catch_entries: HashMap::new(),
            visit_order: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    pub fn push_block(&mut self, block: Block) -> Result<BlockId, LowerError> {
        let bid = BlockId::new(self.blocks.len())?;
        if block.is_handler() {
            let tri = block.try_region().ok_or_else(|| {
                LowerError::Internal(format!("handler block {bid} has no try-region"))
            })?;
            self.catch_entries.insert(tri, bid);
        }
        self.blocks.push(block);
        Ok(bid)
    }

    pub fn block(&self, bid: BlockId) -> &Block {
        &self.blocks[bid]
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// The handler block registered for `tri`, if any.
    pub fn catch_entry(&self, tri: TryRegionId) -> Option<BlockId> {
        self.catch_entries.get(&tri).copied()
    }

    pub fn set_visit_order(&mut self, order: Vec<BlockId>) {
        self.visit_order = Some(order);
    }

    /// The order the driver translates blocks in.
    pub fn visit_order(&self) -> Vec<BlockId> {
        match &self.visit_order {
            Some(o) => o.clone(),
            None => self.blocks.keys().collect(),
        }
    }
}
