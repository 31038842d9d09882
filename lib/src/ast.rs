/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The structured-control-flow tree ("region/if/loop/op" AST, after
//! McConnell's tree-based code optimization scheme) and the per-shader
//! compile session that owns every arena used by the passes.
//!
//! The tree is a strict forest: every node has exactly one owning incoming
//! edge (child / rest / phi / loop_phi), established by the builders.
//! `parent` and `target` are non-owning back-references, stored as plain
//! arena indices.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::bytecode::{
  AluRecord, CfKind, IsaCaps, TexRecord, VtxRecord, RESERVED_TEMP_GPRS,
};
use crate::data_structures::{
  ChunkIx, ConstraintIx, EdgeIx, GroupIx, NodeIx, PrioQueue, SortedMap,
  SortedSet, VarIx,
};
use crate::interface::ShaderStats;
use crate::vars::{
  AffinityChunk, AffinityEdge, ChunkGroup, Color, RcConstraint, VarDesc,
};

/// Operand vector of a node.  Four inline slots cover everything but the
/// widest fetch operand lists and merged group vectors.
pub type VarVec = SmallVec<[Option<VarIx>; 4]>;

//=============================================================================
// Node classification

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeType {
  Region,
  Depart,
  Repeat,
  If,
  List,
  Op,
  Group,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeSubtype {
  None,
  /// Subtype for the root list node.
  Root,
  Phi,
  Copy,
  AluClause,
  AluGroup,
  AluInst,
  TexInst,
  VtxInst,
  CfInst,
  LoopRegion,
  IfElseRegion,
  LoopBreak,
  LoopContinue,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpClass {
  Generic,
  CfExport,
  CfStreamout,
}

/// Which ALU issue slots an instruction may occupy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AluSlots {
  Vector,
  Trans,
  Any,
}

impl AluSlots {
  pub fn allows_vector(self) -> bool {
    self != AluSlots::Trans
  }
  pub fn allows_trans(self) -> bool {
    self != AluSlots::Vector
  }
}

//=============================================================================
// AST node

pub struct AstNode {
  pub kind: NodeType,
  pub subtype: NodeSubtype,
  pub op_class: OpClass,

  // Flags
  /// Inputs/outputs must land in channels of one shared register.
  pub reg_constraint: bool,
  /// Part of a reduction/interp cluster that must stay contiguous.
  pub four_slots: bool,
  /// ALU clamp output modifier.
  pub clamp_dst: bool,
  /// Original channels must not change (CUBE, INTERP_*).
  pub chan_constraint: bool,
  /// Removable MOV if input and output coalesce.
  pub copy_hint: bool,
  /// Copy inserted to split a live interval.
  pub split_copy: bool,
  /// Split copy around a four-slot ALU group (cheaper to leave uncoalesced
  /// than a fetch/export split).
  pub group_split: bool,
  pub dead: bool,
  /// Executes even with no live outputs (KILL, SET_GRADIENTS, MOVA).
  pub keep_alive: bool,
  /// Last group of an ALU clause; the next group starts a new clause.
  pub clause_split: bool,

  // Tree links
  pub parent: Option<NodeIx>,
  pub child: Option<NodeIx>,
  pub rest: Option<NodeIx>,
  pub phi: Option<NodeIx>,
  pub loop_phi: Option<NodeIx>,

  // Region bookkeeping
  pub label: u32,
  pub repeat_count: u32,
  pub depart_count: u32,

  // Depart/repeat bookkeeping
  pub target: Option<NodeIx>,
  pub depart_number: u32,
  pub repeat_number: u32,

  // Dataflow
  pub ins: VarVec,
  pub outs: VarVec,
  /// Control-flow dependency (active mask for CF, predicate for ALU).
  pub flow_dep: Option<VarIx>,

  pub vars_defined: SortedSet<VarIx>,
  pub vars_used: SortedSet<VarIx>,
  pub vars_live: Option<SortedSet<VarIx>>,
  pub vars_live_after: Option<SortedSet<VarIx>>,

  // Payload
  pub alu: Option<AluRecord>,
  pub tex: Option<TexRecord>,
  pub vtx: Option<VtxRecord>,
  pub cf: Option<CfKind>,

  pub alu_allowed_slots: AluSlots,
  pub const_ins_count: u32,

  // Scheduling
  pub min_prio: u32,
  pub max_prio: u32,
}

impl AstNode {
  pub fn new(kind: NodeType) -> Self {
    Self {
      kind,
      subtype: NodeSubtype::None,
      op_class: OpClass::Generic,
      reg_constraint: false,
      four_slots: false,
      clamp_dst: false,
      chan_constraint: false,
      copy_hint: false,
      split_copy: false,
      group_split: false,
      dead: false,
      keep_alive: false,
      clause_split: false,
      parent: None,
      child: None,
      rest: None,
      phi: None,
      loop_phi: None,
      label: 0,
      repeat_count: 0,
      depart_count: 0,
      target: None,
      depart_number: 0,
      repeat_number: 0,
      ins: SmallVec::new(),
      outs: SmallVec::new(),
      flow_dep: None,
      vars_defined: SortedSet::empty(),
      vars_used: SortedSet::empty(),
      vars_live: None,
      vars_live_after: None,
      alu: None,
      tex: None,
      vtx: None,
      cf: None,
      alu_allowed_slots: AluSlots::Any,
      const_ins_count: 0,
      min_prio: 0,
      max_prio: 0,
    }
  }

  pub fn is_alu_like(&self) -> bool {
    self.subtype == NodeSubtype::AluInst || self.subtype == NodeSubtype::Copy
  }
}

//=============================================================================
// Compile session

/// Everything one shader compilation owns: the tree, the variable table, the
/// coalescing queues.  Torn down as a unit when the pass finishes, success or
/// failure.
pub struct OptSession {
  pub caps: IsaCaps,

  pub nodes: Vec<AstNode>,
  pub vars: Vec<VarDesc>,
  pub constraints: Vec<RcConstraint>,
  pub edges: Vec<AffinityEdge>,
  pub chunks: Vec<AffinityChunk>,
  pub groups: Vec<ChunkGroup>,

  /// (reg, chan, index) -> variable.
  var_lookup: FxHashMap<u64, VarIx>,

  pub edge_queue: PrioQueue<EdgeIx>,
  pub chunk_queue: PrioQueue<ChunkIx>,
  pub chunk_groups: PrioQueue<GroupIx>,

  pub root: NodeIx,

  pub next_temp: u32,
  pub max_slots: usize,
  pub temp_gprs: u32,

  /// Highest GPR holding shader inputs; uses of higher never-defined GPRs
  /// are undefined values, not inputs.
  pub last_input_gpr: Option<u32>,

  pub last_color: Color,
  pub enable_last_color_update: bool,

  /// Fetch-instruction count per virtual scheduling level.
  pub fetch_levels: SortedMap<u32, u32>,

  pub stats: [ShaderStats; 2],

  /// Live sets match the current tree (cleared whenever the tree is
  /// reordered); dump output gates on this.
  pub liveness_correct: bool,
}

impl OptSession {
  pub fn new(caps: IsaCaps, last_input_gpr: Option<u32>) -> Self {
    let mut s = Self {
      caps,
      nodes: vec![],
      vars: vec![],
      constraints: vec![],
      edges: vec![],
      chunks: vec![],
      groups: vec![],
      var_lookup: FxHashMap::default(),
      edge_queue: PrioQueue::empty(),
      chunk_queue: PrioQueue::empty(),
      chunk_groups: PrioQueue::empty(),
      root: NodeIx::new(0),
      next_temp: 1,
      max_slots: caps.max_slots,
      temp_gprs: RESERVED_TEMP_GPRS,
      last_input_gpr,
      last_color: 0,
      enable_last_color_update: true,
      fetch_levels: SortedMap::empty(),
      stats: [ShaderStats::default(), ShaderStats::default()],
      liveness_correct: false,
    };
    s.root = s.new_node(NodeType::List);
    s.nodes[s.root.index()].subtype = NodeSubtype::Root;
    s
  }

  //---------------------------------------------------------------------------
  // Arena access

  #[inline(always)]
  pub fn node(&self, ix: NodeIx) -> &AstNode {
    &self.nodes[ix.index()]
  }

  #[inline(always)]
  pub fn node_mut(&mut self, ix: NodeIx) -> &mut AstNode {
    &mut self.nodes[ix.index()]
  }

  #[inline(always)]
  pub fn var(&self, ix: VarIx) -> &VarDesc {
    &self.vars[ix.index()]
  }

  #[inline(always)]
  pub fn var_mut(&mut self, ix: VarIx) -> &mut VarDesc {
    &mut self.vars[ix.index()]
  }

  pub fn constraint(&self, ix: ConstraintIx) -> &RcConstraint {
    &self.constraints[ix.index()]
  }

  pub fn constraint_mut(&mut self, ix: ConstraintIx) -> &mut RcConstraint {
    &mut self.constraints[ix.index()]
  }

  pub fn edge(&self, ix: EdgeIx) -> &AffinityEdge {
    &self.edges[ix.index()]
  }

  pub fn chunk(&self, ix: ChunkIx) -> &AffinityChunk {
    &self.chunks[ix.index()]
  }

  pub fn chunk_mut(&mut self, ix: ChunkIx) -> &mut AffinityChunk {
    &mut self.chunks[ix.index()]
  }

  pub fn group(&self, ix: GroupIx) -> &ChunkGroup {
    &self.groups[ix.index()]
  }

  pub fn new_node(&mut self, kind: NodeType) -> NodeIx {
    let ix = NodeIx::new(self.nodes.len() as u32);
    self.nodes.push(AstNode::new(kind));
    ix
  }

  //---------------------------------------------------------------------------
  // Variable table

  fn pack_var_key(reg: u32, chan: i8, index: u32) -> u64 {
    ((index as u64) << 40) | ((reg as u64) << 4) | ((chan + 1) as u64)
  }

  /// Variable for a syntactic (reg, chan, index) triple, created on first
  /// reference.
  pub fn get_var(&mut self, reg: u32, chan: i8, index: u32) -> VarIx {
    let key = Self::pack_var_key(reg, chan, index);
    if let Some(&v) = self.var_lookup.get(&key) {
      return v;
    }
    let ix = VarIx::new(self.vars.len() as u32);
    self.vars.push(VarDesc::new(reg, chan, index));
    self.var_lookup.insert(key, ix);
    ix
  }

  /// Fresh SSA temporary, not tied to any source register.
  pub fn create_temp_var(&mut self) -> VarIx {
    use crate::vars::REG_TEMP;
    let reg = self.next_temp | REG_TEMP;
    self.next_temp += 1;
    let ix = VarIx::new(self.vars.len() as u32);
    let mut v = VarDesc::new(reg, -1, 0);
    v.temp = true;
    self.vars.push(v);
    self.var_lookup.insert(Self::pack_var_key(reg, -1, 0), ix);
    ix
  }

  pub fn num_vars(&self) -> usize {
    self.vars.len()
  }

  /// Drop a provably def-less and use-less variable from the lookup table.
  pub fn prune_var(&mut self, v: VarIx) {
    let (reg, chan, index) = {
      let vd = self.var(v);
      (vd.reg, vd.chan, vd.index)
    };
    self.var_lookup.remove(&Self::pack_var_key(reg, chan, index));
    self.var_mut(v).dead = true;
  }

  //---------------------------------------------------------------------------
  // Tree link helpers.  These only establish links; the builders are
  // responsible for keeping the one-owner discipline.

  pub fn set_child(&mut self, parent: NodeIx, child: NodeIx) {
    self.node_mut(parent).child = Some(child);
    self.node_mut(child).parent = Some(parent);
  }

  pub fn set_rest(&mut self, prev: NodeIx, next: NodeIx) {
    self.node_mut(prev).rest = Some(next);
    self.node_mut(next).parent = Some(prev);
  }

  /// Append a fresh list node after `cur` and return it.
  pub fn append_list(&mut self, cur: NodeIx) -> NodeIx {
    let l = self.new_node(NodeType::List);
    self.set_rest(cur, l);
    l
  }

  /// Start a fresh list as the child of `parent` and return it.
  pub fn start_list(&mut self, parent: NodeIx) -> NodeIx {
    let l = self.new_node(NodeType::List);
    self.set_child(parent, l);
    l
  }

  //---------------------------------------------------------------------------
  // Constraints

  /// Attach a register or bank-swizzle constraint over `comps`.
  pub fn add_constraint(
    &mut self, comps: Vec<Option<VarIx>>, bank_swizzle: bool,
  ) -> ConstraintIx {
    let ix = ConstraintIx::new(self.constraints.len() as u32);
    self.constraints.push(RcConstraint { comps, fixed: 0, r_color: 0 });
    for comp in self.constraints[ix.index()].comps.clone() {
      if let Some(v) = comp {
        if bank_swizzle {
          self.var_mut(v).bs_constraint = Some(ix);
        } else {
          self.var_mut(v).constraint = Some(ix);
        }
      }
    }
    ix
  }

  //---------------------------------------------------------------------------
  // Interference bookkeeping

  /// Clear interference data before recomputing liveness.
  pub fn reset_interferences(&mut self) {
    for v in &mut self.vars {
      v.interferences.clear();
    }
    self.liveness_correct = false;
  }

  /// Record pairwise interference among every live, non-dead variable.
  /// The stored relation stays irreflexive: a variable is never added to its
  /// own set.
  pub fn mark_interferences(&mut self, live: &SortedSet<VarIx>) {
    let mut alive = SortedSet::with_capacity(live.card());
    for &v in live.iter() {
      if !self.var(v).dead {
        alive.insert(v);
      }
    }
    for &v in alive.iter() {
      let vd = self.var_mut(v);
      vd.interferences.add_set(&alive);
      vd.interferences.remove(v);
    }
  }
}
