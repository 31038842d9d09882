/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Post scheduling of ALU clauses: a bottom-up greedy cycle scheduler.
//!
//! Working from the clause's live-out set, the scheduler repeatedly selects
//! every pending instruction whose result is no longer needed by anything
//! still pending (its remaining-use count is zero), then greedily packs the
//! ready set into one VLIW group: vector slot matching the output channel if
//! pinned, any free vector slot otherwise, trans slot as a fallback.  A
//! candidate joins the group only if the group stays within the literal
//! budget and the bank-swizzle read-port constraints (an exhaustive but
//! pruned backtracking search over per-slot swizzles).  After the group
//! fills, interference against the currently-allocated registers can evict
//! members back to the pending list (four-slot groups atomically), and
//! clause-local values are recolored in place instead.  Coalesced copies
//! (source and destination share a color) are elided on the fly.
//!
//! Every speculative step (swizzle reservation, register map update) is a
//! snapshot/restore of a small state struct, so failed attempts roll back to
//! the exact prior state.

use log::debug;

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::bytecode::{
  alloc_kcache_line, alu_group_literals, AluSrcSel, KcacheBanks,
  MAX_ALU_SLOTS_PER_CLAUSE, MAX_GROUP_LITERALS,
};
use crate::coloring::recolor_local;
use crate::data_structures::{NodeIx, SortedMap, SortedSet, VarIx};
use crate::vars::{color_chan, Color};

//=============================================================================
// Bank-swizzle state

/// A value occupying a GPR read port: the variable itself, or its whole
/// chunk (chunk members share a location by construction).
#[derive(Clone, Copy, PartialEq, Eq)]
enum PortVal {
  Var(VarIx),
  Chunk(crate::data_structures::ChunkIx),
}

/// Read-port reservations for the group being assembled: three GPR read
/// cycles of four channels each, plus two constant-pair ports.  Cheap to
/// copy, which is what makes the backtracking rollback-exact.
#[derive(Clone, Copy)]
struct CbsState {
  cycle_var: [[Option<PortVal>; 4]; 3],
  cpair: [u64; 2],
  bs_slots: [Option<NodeIx>; 5],
}

impl CbsState {
  fn new() -> Self {
    Self { cycle_var: [[None; 4]; 3], cpair: [0; 2], bs_slots: [None; 5] }
  }

  fn reset_gpr(&mut self) {
    self.cycle_var = [[None; 4]; 3];
  }

  fn reset_const(&mut self) {
    self.cpair = [0; 2];
  }

  fn reserve_cpair(&mut self, cpair: u64) -> bool {
    for q in 0..2 {
      if self.cpair[q] == cpair {
        return true;
      } else if self.cpair[q] == 0 {
        self.cpair[q] = cpair;
        return true;
      }
    }
    false
  }

  fn reserve_gpr(&mut self, cycle: usize, chan: usize, vv: PortVal) -> bool {
    match self.cycle_var[cycle][chan] {
      None => {
        self.cycle_var[cycle][chan] = Some(vv);
        true
      }
      Some(cur) => cur == vv,
    }
  }
}

/// Bank swizzle element for a vector slot.
fn cbs_vec(bs: u8, i: usize) -> usize {
  debug_assert!(bs < 6);
  match i {
    0 => (bs >> 1) as usize,
    1 => {
      if bs >= 3 {
        ((bs - 3) >> 1) as usize
      } else {
        ((bs + 3) >> 1) as usize
      }
    }
    2 => {
      if bs >= 3 {
        (5 - bs) as usize
      } else {
        (2 - bs) as usize
      }
    }
    _ => unreachable!(),
  }
}

/// Bank swizzle element for the scalar (trans) slot.
fn cbs_scl(bs: u8, i: usize) -> usize {
  debug_assert!(bs < 4);
  if bs != 0 {
    if (bs - 1) as usize == i {
      1
    } else {
      2
    }
  } else {
    2 - i
  }
}

fn cpair_key(sel: AluSrcSel, chan: u8) -> u64 {
  match sel {
    AluSrcSel::Kcache { bank, addr } => {
      (((bank as u64) << 40) | ((addr as u64) << 1) | ((chan >> 1) as u64)) + 1
    }
    _ => unreachable!(),
  }
}

#[derive(Clone, Copy, PartialEq)]
enum CbsRes {
  Const,
  Gpr,
  All,
}

impl CbsRes {
  fn has_const(self) -> bool {
    self != CbsRes::Gpr
  }
  fn has_gpr(self) -> bool {
    self != CbsRes::Const
  }
}

//=============================================================================
// Scheduler context

struct SchedCtx {
  kc_sets: KcacheBanks,

  alu_slot_count: u32,
  group_inst_count: u32,

  /// Pending instructions, keyed by original position to keep them ordered.
  instructions: SortedMap<u32, NodeIx>,
  /// Instructions whose results have no remaining pending uses.
  ready_inst: SortedMap<u32, NodeIx>,

  live: SortedSet<VarIx>,
  use_count: SortedMap<VarIx, i32>,
  reg_map: SortedMap<Color, VarIx>,
  reg_map_save: SortedMap<Color, VarIx>,

  clause_node: NodeIx,
  /// Slot assignment: [0]/[1] alternate as the group under construction,
  /// [2] stages one candidate.
  slots: [[Option<NodeIx>; 5]; 3],
  out_list: Option<NodeIx>,

  locals: SortedSet<VarIx>,
  globals: SortedSet<VarIx>,

  idx: [u32; 5],
  free_slots: u32,
  restart: bool,

  curgroup: usize,
  empty_count: u32,

  count: i32,

  literal: [u32; MAX_GROUP_LITERALS],
  nliteral: usize,

  cbs: CbsState,
}

fn clear_interferences(s: &mut OptSession, v: VarIx) {
  let neighbours = s.var(v).interferences.clone();
  for &n in neighbours.iter() {
    s.var_mut(n).interferences.remove(v);
  }
  s.var_mut(v).interferences.clear();
}

fn update_counts(
  uc: &mut SortedMap<VarIx, i32>, vars: &[Option<VarIx>], delta: i32,
) {
  for v in vars.iter().flatten() {
    let d = uc.get(*v).unwrap_or(0) + delta;
    debug_assert!(d >= 0);
    uc.set(*v, d);
  }
}

fn port_val(s: &OptSession, v: VarIx) -> PortVal {
  match s.var(v).chunk {
    Some(c) => PortVal::Chunk(c),
    None => PortVal::Var(v),
  }
}

//=============================================================================
// Bank-swizzle checking

/// Try to reserve the const/GPR read ports of `n` under bank swizzle `bs`.
/// On failure the reservation state is restored exactly.
fn cbs_try_slot(
  s: &OptSession, cbs: &mut CbsState, n: NodeIx, bs: u8, scalar: bool,
  res: CbsRes,
) -> bool {
  let saved = *cbs;
  let node = s.node(n);
  let alu = node.alu.as_ref().unwrap();

  if res.has_const() && node.const_ins_count > 0 {
    if scalar && node.const_ins_count > 2 {
      return false;
    }
    for (q, slot) in node.ins.iter().enumerate() {
      if slot.is_none() {
        let src = alu.src[q];
        if src.sel.is_kcache() {
          if !cbs.reserve_cpair(cpair_key(src.sel, src.chan)) {
            *cbs = saved;
            return false;
          }
        }
      }
    }
  }

  if res.has_gpr() {
    debug_assert!(!alu.bank_swizzle_force || alu.bank_swizzle == bs);
    debug_assert!(bs < if scalar { 4 } else { 6 });

    let mut vv0: Option<PortVal> = None;
    for (q, slot) in node.ins.iter().enumerate() {
      let v = match slot {
        Some(v) => *v,
        None => continue,
      };
      let vv = port_val(s, v);
      let swz;
      if scalar {
        swz = cbs_scl(bs, q);
        if swz < node.const_ins_count as usize {
          *cbs = saved;
          return false;
        }
      } else {
        swz = cbs_vec(bs, q);
        if q == 0 {
          vv0 = Some(vv);
        } else if q == 1 && Some(vv) == vv0 {
          continue;
        }
      }

      let chan = color_chan(s.var(v).color) as usize;
      if !cbs.reserve_gpr(swz, chan, vv) {
        *cbs = saved;
        return false;
      }
    }
  }
  true
}

/// Re-reserve the ports of every already accepted slot.
fn cbs_init(s: &OptSession, ctx: &mut SchedCtx) -> bool {
  for q in 0..s.max_slots {
    if let Some(n) = ctx.slots[ctx.curgroup][q] {
      let bs = s.node(n).alu.as_ref().unwrap().bank_swizzle;
      if !cbs_try_slot(s, &mut ctx.cbs, n, bs, q == 4, CbsRes::All) {
        debug_assert!(false, "re-reserving accepted slots failed");
        return false;
      }
    }
  }
  true
}

/// Add slot `slot` of the staging group to the bank-swizzle reservation,
/// searching over swizzle combinations of all modifiable slots if the fast
/// path fails.  Returns false (state restored) if no combination works.
fn cbs_add_slot(
  s: &mut OptSession, ctx: &mut SchedCtx, curgroup: usize, slot: usize,
) -> bool {
  let n = ctx.slots[curgroup][slot].unwrap();
  let scalar = slot == 4;
  let swz_cnt: u8 = if scalar { 4 } else { 6 };
  let max_slots = s.max_slots;

  // Check/reserve const ports first.
  if !cbs_try_slot(s, &mut ctx.cbs, n, 0, scalar, CbsRes::Const) {
    return false;
  }

  ctx.cbs.bs_slots[slot] = Some(n);

  // Fast path: find a swizzle for the new slot only.
  let forced = s.node(n).alu.as_ref().unwrap().bank_swizzle_force;
  if forced {
    let bs = s.node(n).alu.as_ref().unwrap().bank_swizzle;
    if cbs_try_slot(s, &mut ctx.cbs, n, bs, scalar, CbsRes::Gpr) {
      return true;
    }
  } else {
    for bs in 0..swz_cnt {
      if cbs_try_slot(s, &mut ctx.cbs, n, bs, scalar, CbsRes::Gpr) {
        s.node_mut(n).alu.as_mut().unwrap().bank_swizzle = bs;
        return true;
      }
    }
  }

  // Prepare to search all combinations.
  let mut bss = [0u8; 5];
  let mut cs_first_modifiable: i32 = -1;
  let mut cs_last_modifiable: i32 = -1;
  for q in (0..max_slots).rev() {
    bss[q] = 0;
    if let Some(sn) = ctx.cbs.bs_slots[q] {
      let alu = s.node(sn).alu.as_ref().unwrap();
      if alu.bank_swizzle_force {
        bss[q] = alu.bank_swizzle;
      } else {
        if cs_last_modifiable == -1 {
          cs_last_modifiable = q as i32;
        }
        cs_first_modifiable = q as i32;
      }
    }
  }

  // Reinit reservations for the slots with forced swizzles.
  ctx.cbs.reset_gpr();
  for q in 0..max_slots {
    if let Some(sn) = ctx.cbs.bs_slots[q] {
      if s.node(sn).alu.as_ref().unwrap().bank_swizzle_force {
        let ok = cbs_try_slot(s, &mut ctx.cbs, sn, bss[q], q == 4, CbsRes::Gpr);
        debug_assert!(ok, "forced swizzles must be reservable");
      }
    }
  }

  // All forced: nothing left to search.
  if cs_first_modifiable == -1 {
    return true;
  }

  let mut cs = cs_first_modifiable;
  let mut result = false;
  let mut finished = false;
  let mut backtrack = false;

  while !finished {
    if backtrack {
      // Reinit the reservations of the slots before |cs|.
      ctx.cbs.reset_gpr();
      for q in 0..cs as usize {
        if let Some(sn) = ctx.cbs.bs_slots[q] {
          let ok =
            cbs_try_slot(s, &mut ctx.cbs, sn, bss[q], q == 4, CbsRes::Gpr);
          debug_assert!(ok);
        }
      }
    }

    loop {
      let csu = cs as usize;
      let sn = ctx.cbs.bs_slots[csu].unwrap();
      let fits = !backtrack
        && cbs_try_slot(s, &mut ctx.cbs, sn, bss[csu], csu == 4, CbsRes::Gpr);

      if !fits {
        // Try the next swizzle for this slot.
        bss[csu] += 1;
        backtrack = false;

        if bss[csu] >= if csu == 4 { 4 } else { 6 } {
          if cs == cs_first_modifiable {
            finished = true;
            break;
          }
          bss[csu] = 0;

          // Back to the previous modifiable slot.
          backtrack = true;
          cs -= 1;
          while cs > cs_first_modifiable
            && !ctx.cbs.bs_slots[cs as usize].map_or(false, |n| {
              !s.node(n).alu.as_ref().unwrap().bank_swizzle_force
            })
          {
            cs -= 1;
          }
          break;
        }
      } else {
        // Swizzle fits; on to the next modifiable slot.
        cs += 1;
        while cs < cs_last_modifiable
          && !ctx.cbs.bs_slots[cs as usize].map_or(false, |n| {
            !s.node(n).alu.as_ref().unwrap().bank_swizzle_force
          })
        {
          cs += 1;
        }
        if cs > cs_last_modifiable {
          result = true;
          finished = true;
          break;
        }
      }
    }
  }

  if result {
    for q in cs_first_modifiable..=cs_last_modifiable {
      if let Some(sn) = ctx.cbs.bs_slots[q as usize] {
        s.node_mut(sn).alu.as_mut().unwrap().bank_swizzle = bss[q as usize];
      }
    }
    true
  } else {
    ctx.cbs.bs_slots[slot] = None;
    false
  }
}

//=============================================================================
// Clause setup

/// Mark chunks fully local to this clause: every member is defined here and
/// none is live across the clause boundary.  Such chunks may be recolored
/// freely during scheduling.
fn sched_check_chunks_types(
  s: &mut OptSession, vars: &SortedSet<VarIx>, globals: &SortedSet<VarIx>,
) {
  let mut processed = SortedSet::<crate::data_structures::ChunkIx>::empty();
  for &v in vars.iter() {
    if s.var(v).dead {
      continue;
    }
    let c = match s.var(v).chunk {
      Some(c) => c,
      None => continue,
    };
    if s.chunk(c).local || !processed.insert(c) {
      continue;
    }
    let chunk_vars = s.chunk(c).vars.clone();
    if vars.contains_set(&chunk_vars) && !globals.intersects(&chunk_vars) {
      s.chunk_mut(c).local = true;
      debug!("local chunk: {:?}", c);
    }
  }
}

fn sched_map_live_outs(s: &OptSession, ctx: &mut SchedCtx) {
  let live_after = s.node(ctx.clause_node).vars_live_after.as_ref().unwrap();
  for &v in live_after.iter() {
    let vd = s.var(v);
    if vd.special || vd.undefined {
      continue;
    }
    debug_assert!(vd.color != 0);
    if vd.chunk.is_some() {
      ctx.reg_map.set(vd.color, v);
      debug!("mapping outs: {:?} @ {}", v, vd.color);
    }
  }
}

/// Build the operand vectors of a four-slot group node from its members.
fn create_group_iovecs(s: &mut OptSession, g: NodeIx) {
  debug_assert!(s.node(g).subtype == NodeSubtype::AluGroup);
  if !s.node(g).ins.is_empty() {
    return;
  }

  let mut ins: Vec<Option<VarIx>> = vec![];
  let mut outs: Vec<Option<VarIx>> = vec![];
  let mut l = s.node(g).child;
  while let Some(lx) = l {
    if let Some(n) = s.node(lx).child {
      outs.extend_from_slice(&s.node(n).outs);
      ins.extend_from_slice(&s.node(n).ins);
    }
    l = s.node(lx).rest;
  }
  let gn = s.node_mut(g);
  gn.ins = ins.into();
  gn.outs = outs.into();
}

fn sched_select_live_instructions(s: &mut OptSession, ctx: &mut SchedCtx) {
  let clause_node = ctx.clause_node;
  let mut c = s.node(clause_node).child;
  debug_assert!(c.map_or(true, |c| s.node(c).kind == NodeType::List));
  let mut i: u32 = 0;

  s.node_mut(clause_node).vars_defined.clear();

  while let Some(cx) = c {
    if let Some(child) = s.node(cx).child {
      if s.node(child).dead {
        c = s.node(cx).rest;
        continue;
      }

      if s.node(child).kind == NodeType::Group {
        create_group_iovecs(s, child);
      }

      let ins = s.node(child).ins.clone();
      update_counts(&mut ctx.use_count, &ins, 1);
      i += 1;
      ctx.instructions.set(i, child);

      let outs = s.node(child).outs.clone();
      s.node_mut(clause_node).vars_defined.add_opt_slice(&outs);
    }
    c = s.node(cx).rest;
  }
}

fn sched_init_local_var(s: &mut OptSession, v: VarIx) {
  debug!("local var: {:?}", v);

  // Interferences are recomputed during scheduling.
  clear_interferences(s, v);

  // A local var in a chunk means a local chunk; unfix its members so the
  // whole chunk can be recolored.
  if let Some(c) = s.var(v).chunk {
    for &v2 in s.chunk(c).vars.clone().iter() {
      s.var_mut(v2).fixed = false;
    }
  }
}

//=============================================================================
// Ready set selection

fn sched_select_ready_instructions(s: &mut OptSession, ctx: &mut SchedCtx) {
  let mut i = ctx.instructions.card() as i32 - 1;
  while i >= 0 {
    let (index, n) = ctx.instructions.nth(i as usize);

    // Keep the scan window bounded for very long clauses.
    if ctx.instructions.card() as i32 - i > 128 && !ctx.ready_inst.is_empty() {
      break;
    }

    // All uses of a result must be scheduled (bottom-up) before its
    // definition becomes ready.
    let mut skip = false;
    for v in s.node(n).outs.clone().iter().flatten() {
      if ctx.use_count.get(*v).unwrap_or(0) != 0 {
        skip = true;
        break;
      }
    }
    if skip {
      i -= 1;
      continue;
    }

    // A copy whose source and destination were coalesced into one location
    // is a no-op: elide it instead of scheduling it.
    if s.node(n).subtype == NodeSubtype::Copy {
      let iv = s.node(n).ins[0].unwrap();
      let ov = s.node(n).outs[0].unwrap();

      if !ctx.live.contains(ov) {
        i -= 1;
        continue;
      }

      if s.var(iv).color == s.var(ov).color {
        let outs = s.node(n).outs.clone();
        if !ctx.live.remove_opt_slice(&outs) {
          i -= 1;
          continue;
        }

        let ins = s.node(n).ins.clone();
        update_counts(&mut ctx.use_count, &ins, -1);
        ctx.live.add_opt_slice(&ins);

        debug!("copy coalesced @ {} : {:?} <= {:?}", s.var(iv).color, ov, iv);

        if let Some(v) = ctx.reg_map.get(s.var(ov).color) {
          if v == ov
            || (s.var(v).chunk == s.var(ov).chunk && s.var(v).chunk.is_some())
          {
            ctx.reg_map.set(s.var(iv).color, iv);
          }
        }

        ctx.instructions.remove(index);
        ctx.count -= 1;
        i -= 1;
        continue;
      }
    }

    ctx.ready_inst.set(index, n);
    ctx.instructions.remove(index);
    i -= 1;
  }
}

//=============================================================================
// Group finalization

/// Append the accepted group to the output list (prepending, since we build
/// the clause bottom-up).
fn sched_add_group(s: &mut OptSession, ctx: &mut SchedCtx) {
  let max_slots = s.max_slots;
  let mut last = true;
  let mut contains_group = false;

  for j in (0..max_slots).rev() {
    if let Some(c) = ctx.slots[ctx.curgroup][j] {
      // The computed swizzle survives into the bytecode builder.
      s.node_mut(c).alu.as_mut().unwrap().bank_swizzle_force = true;

      if !s.node(c).four_slots {
        s.node_mut(c).alu.as_mut().unwrap().last = last;
        last = false;

        let nl = s.new_node(NodeType::List);
        if let Some(head) = ctx.out_list {
          s.set_rest(nl, head);
        }
        ctx.out_list = Some(nl);
        s.set_child(nl, c);

        ctx.slots[ctx.curgroup][j] = None;
      } else {
        contains_group = true;
      }
    }
  }

  if contains_group {
    let nl = s.new_node(NodeType::List);
    if let Some(head) = ctx.out_list {
      s.set_rest(nl, head);
    }
    ctx.out_list = Some(nl);

    let member = ctx.slots[ctx.curgroup][0].unwrap();
    let out_group = s.node(s.node(member).parent.unwrap()).parent.unwrap();

    if let Some(p) = s.node(out_group).parent {
      s.node_mut(p).child = None;
      s.node_mut(out_group).parent = None;
    }
    s.set_child(nl, out_group);

    let mut c = s.node(out_group).child;
    let mut last_list = None;
    while let Some(cx) = c {
      if let Some(inst) = s.node(cx).child {
        s.node_mut(inst).alu.as_mut().unwrap().last = false;
      }
      last_list = Some(cx);
      c = s.node(cx).rest;
    }

    let final_inst = s.node(last_list.unwrap()).child.unwrap();
    s.node_mut(final_inst).alu.as_mut().unwrap().last = last;
  }
}

/// Check/allocate kcache sets for the current group.
fn sched_alloc_kcache(s: &OptSession, ctx: &mut SchedCtx) -> bool {
  let nsets = s.caps.kcache_sets();
  let mut kcache = ctx.kc_sets;

  for q in 0..s.max_slots {
    if let Some(c) = ctx.slots[ctx.curgroup][q] {
      if s.node(c).const_ins_count == 0 {
        continue;
      }
      let alu = s.node(c).alu.as_ref().unwrap();
      for (w, slot) in s.node(c).ins.iter().enumerate() {
        if slot.is_some() {
          continue;
        }
        if let AluSrcSel::Kcache { bank, addr } = alu.src[w].sel {
          if !alloc_kcache_line(&mut kcache, nsets, bank, addr >> 4) {
            return false;
          }
        }
      }
    }
  }

  ctx.kc_sets = kcache;
  true
}

/// Mark the current group as the first of a new clause (thinking bottom-up:
/// the last group of the previous one).
fn sched_set_split(s: &mut OptSession, ctx: &SchedCtx) {
  for j in (0..s.max_slots).rev() {
    if let Some(c) = ctx.slots[ctx.curgroup][j] {
      s.node_mut(c).clause_split = true;
      return;
    }
  }
  debug_assert!(false, "split requested for an empty group");
}

/// Instruction count and kcache clause limits; set the clause-split flag
/// when exceeded.
fn sched_check_clause_limits(s: &mut OptSession, ctx: &mut SchedCtx) {
  let literal_slot_count =
    if ctx.nliteral > 0 { ((ctx.nliteral + 1) >> 1) as u32 } else { 0 };

  let mut split = false;
  if !sched_alloc_kcache(s, ctx) {
    split = true;
  } else {
    ctx.alu_slot_count += ctx.group_inst_count + literal_slot_count;
    if ctx.alu_slot_count > MAX_ALU_SLOTS_PER_CLAUSE {
      split = true;
    }
  }

  if split {
    sched_set_split(s, ctx);
    ctx.kc_sets = KcacheBanks::default();
    ctx.alu_slot_count = ctx.group_inst_count + literal_slot_count;
    let ok = sched_alloc_kcache(s, ctx);
    debug_assert!(ok, "kcache allocation into a fresh clause failed");
  }
}

fn sched_process_selected_group(s: &mut OptSession, ctx: &mut SchedCtx) {
  // A four-slot group updates liveness as a unit.
  if let Some(first) = ctx.slots[ctx.curgroup][0] {
    if s.node(first).four_slots {
      let g = s.node(s.node(first).parent.unwrap()).parent.unwrap();
      debug_assert!(s.node(g).subtype == NodeSubtype::AluGroup);

      let ins = s.node(g).ins.clone();
      let outs = s.node(g).outs.clone();
      update_counts(&mut ctx.use_count, &ins, -1);
      ctx.live.remove_opt_slice(&outs);
      ctx.live.add_opt_slice(&ins);
    }
  }

  ctx.group_inst_count = 0;

  for j in 0..s.max_slots {
    if let Some(c) = ctx.slots[ctx.curgroup][j] {
      ctx.group_inst_count += 1;

      if !s.node(c).alu.as_ref().unwrap().dst.write {
        s.node_mut(c).alu.as_mut().unwrap().dst.chan = (j & 3) as u8;
      }

      if !s.node(c).four_slots {
        let ins = s.node(c).ins.clone();
        let outs = s.node(c).outs.clone();
        update_counts(&mut ctx.use_count, &ins, -1);
        ctx.live.remove_opt_slice(&outs);
        ctx.live.add_opt_slice(&ins);

        if let Some(p) = s.node(c).parent {
          s.node_mut(p).child = None;
        }
        s.node_mut(c).parent = None;
      }
    }
  }
}

/// Check the interferences introduced by the group's definitions against the
/// currently allocated registers.  Fixed-color collisions evict the
/// instruction back to the pending list (whole four-slot groups at once);
/// clause-local values are recolored in place instead.
fn sched_check_interferences(s: &mut OptSession, ctx: &mut SchedCtx) -> bool {
  let max_slots = s.max_slots;
  ctx.restart = false;

  ctx.reg_map_save.copy_from(&ctx.reg_map);

  // After its definition (bottom-up: from here upwards) a variable is no
  // longer live, and its location is reusable.
  for j in 0..max_slots {
    if let Some(c) = ctx.slots[ctx.curgroup][j] {
      if let Some(v) = s.node(c).outs.get(0).copied().flatten() {
        let is_local =
          s.var(v).chunk.map_or(true, |ch| s.chunk(ch).local);
        if is_local {
          // Not fixed: recolor using the interferences seen so far.
          let ok = recolor_local(s, v);
          debug_assert!(ok, "local recoloring failed");
        } else if let Some(v2) = ctx.reg_map.get(s.var(v).color) {
          if v2 != v && s.var(v2).chunk != s.var(v).chunk {
            debug_assert!(false, "conflicting global mapping");
          } else {
            ctx.reg_map.remove(s.var(v).color);
          }
        }
      }
    }
  }

  // A first use (bottom-up) makes the variable live: its fixed location
  // must be free, or the consuming instruction cannot go in this group.
  let mut inst_cnt = 0i32;
  let mut intf4 = false;
  let mut grp4: Option<NodeIx> = None;

  'slots: for j in 0..max_slots {
    let c = match ctx.slots[ctx.curgroup][j] {
      Some(c) => c,
      None => continue,
    };
    inst_cnt += 1;

    for v in s.node(c).ins.clone().iter().flatten() {
      let v = *v;
      let mut intf = false;

      // Locals are recolored when their definitions get scheduled, so
      // they can always be made conflict-free.
      if ctx.locals.contains(v) {
        continue;
      }

      if let Some(v2) = ctx.reg_map.get(s.var(v).color) {
        if v2 != v
          && (s.var(v).pin_reg || s.var(v).chunk.is_some())
          && s.var(v).chunk != s.var(v2).chunk
        {
          debug!("interference {:?} {:?} @ {}", v, v2, s.var(v).color);
          intf = true;
        }
      } else if s.var(v).chunk.map_or(false, |ch| !s.chunk(ch).local) {
        ctx.reg_map.set(s.var(v).color, v);
      }

      if intf {
        if s.node(c).four_slots {
          // Discarding one lane of a four-slot group discards all four.
          intf4 = true;
          let mut g = s.node(c).parent.unwrap();
          while s.node(g).subtype != NodeSubtype::AluGroup {
            g = s.node(g).parent.unwrap();
          }
          grp4 = Some(g);
          break 'slots;
        }

        let outs = s.node(c).outs.clone();
        ctx.live.add_opt_slice(&outs);

        ctx.instructions.set(ctx.idx[j], c);
        ctx.ready_inst.remove(ctx.idx[j]);
        ctx.count += 1;
        ctx.slots[ctx.curgroup][j] = None;

        ctx.free_slots |= 1 << j;
        inst_cnt -= 1;
        ctx.restart = true;
        break;
      }
    }
  }

  if intf4 {
    let grp4 = grp4.unwrap();
    debug!("four-slot interference, evicting group");

    ctx.instructions.set(ctx.idx[0], grp4);
    ctx.ready_inst.remove(ctx.idx[0]);
    ctx.count += 1;
    ctx.free_slots |= 0xF;

    let outs = s.node(grp4).outs.clone();
    ctx.live.add_opt_slice(&outs);

    for j in 0..4 {
      debug_assert!(ctx.slots[ctx.curgroup][j].is_some());
      ctx.slots[ctx.curgroup][j] = None;
      inst_cnt -= 1;
    }

    ctx.restart = true;
  }

  if inst_cnt == 0 {
    debug!("empty group, restarting");
    ctx.empty_count += 1;
    if ctx.empty_count >= 5 {
      // No progress: give up on optimizing this shader.
      return false;
    }
    ctx.restart = true;
  }

  if ctx.restart {
    ctx.reg_map.copy_from(&ctx.reg_map_save);
  }
  true
}

//=============================================================================
// Clause scheduling

fn post_schedule_alu(s: &mut OptSession, clause_node: NodeIx) -> bool {
  if s.node(clause_node).child.is_none() {
    return true;
  }

  let mut ctx = SchedCtx {
    kc_sets: KcacheBanks::default(),
    alu_slot_count: 0,
    group_inst_count: 0,
    instructions: SortedMap::empty(),
    ready_inst: SortedMap::empty(),
    live: s
      .node(clause_node)
      .vars_live_after
      .clone()
      .unwrap_or_else(SortedSet::empty),
    use_count: SortedMap::empty(),
    reg_map: SortedMap::empty(),
    reg_map_save: SortedMap::empty(),
    clause_node,
    slots: [[None; 5]; 3],
    out_list: None,
    locals: SortedSet::empty(),
    globals: s.node(clause_node).vars_live.clone().unwrap_or_else(SortedSet::empty),
    idx: [0; 5],
    free_slots: 0,
    restart: false,
    curgroup: 0,
    empty_count: 0,
    count: 0,
    literal: [0; MAX_GROUP_LITERALS],
    nliteral: 0,
    cbs: CbsState::new(),
  };

  if let Some(after) = &s.node(clause_node).vars_live_after {
    let after = after.clone();
    ctx.globals.add_set(&after);
  }

  sched_map_live_outs(s, &mut ctx);
  sched_select_live_instructions(s, &mut ctx);
  {
    let defined = s.node(clause_node).vars_defined.clone();
    let globals = ctx.globals.clone();
    sched_check_chunks_types(s, &defined, &globals);
  }

  ctx.count = ctx.instructions.card() as i32;

  // Clause-local values may be recolored freely while scheduling.
  for &v in s.node(clause_node).vars_defined.clone().iter() {
    let global = s
      .var(v)
      .chunk
      .map_or(false, |c| !s.chunk(c).local)
      || ctx.globals.contains(v);
    if !global && ctx.locals.insert(v) {
      sched_init_local_var(s, v);
    }
  }

  debug!("{} instructions selected", ctx.count);

  let max_slots = s.max_slots;
  let mut contains_kill = false;
  let mut result = true;

  while ctx.count != 0 {
    ctx.cbs.reset_gpr();
    ctx.cbs.reset_const();
    ctx.nliteral = 0;

    if ctx.restart {
      if !cbs_init(s, &mut ctx) {
        result = false;
        break;
      }
      for q in 0..max_slots {
        if let Some(c) = ctx.slots[ctx.curgroup][q] {
          let alu = s.node(c).alu.as_ref().unwrap().clone();
          let ok =
            alu_group_literals(&mut ctx.literal, &mut ctx.nliteral, &alu);
          debug_assert!(ok, "kept slots exceed the literal budget");
        } else {
          ctx.cbs.bs_slots[q] = None;
        }
      }
    } else {
      ctx.cbs.bs_slots = [None; 5];
      contains_kill = false;
      ctx.free_slots = (1 << max_slots) - 1;
      ctx.slots[ctx.curgroup] = [None; 5];
      ctx.idx = [0; 5];

      sched_select_ready_instructions(s, &mut ctx);

      if ctx.ready_inst.is_empty() {
        if ctx.count != 0 {
          // Pending instructions but nothing ready: a cycle in the
          // bookkeeping.  Fall back to the original bytecode.
          debug_assert!(false, "no ready instructions with work pending");
          result = false;
          break;
        } else {
          continue;
        }
      }
    }

    // Select instructions for the current group, bottom-up (highest pending
    // position first).  A four-slot group counts as one instruction.
    for i in (0..ctx.ready_inst.card() as i32).rev() {
      let (index, n) = ctx.ready_inst.nth(i as usize);

      ctx.slots[2] = [None; 5];

      let kill = s
        .node(n)
        .alu
        .as_ref()
        .map_or(false, |a| a.op.is_kill());

      // Kill instructions never share a group with anything else.
      if kill {
        if !contains_kill && ctx.free_slots != (1 << max_slots) - 1 {
          continue;
        }
      } else if contains_kill {
        continue;
      }

      if s.node(n).kind == NodeType::Group {
        if !ctx.free_slots & 0x0F != 0 {
          continue;
        }
        let mut j = 0;
        let mut c = s.node(n).child;
        while let Some(cx) = c {
          if let Some(inst) = s.node(cx).child {
            ctx.slots[2][j] = Some(inst);
            j += 1;
          }
          c = s.node(cx).rest;
        }
        debug_assert!(j == 4);
        ctx.idx[0] = index;
      } else {
        let out = s.node(n).outs[0];
        let mut chan: i32 = -1;

        let free_choice = out.is_none()
          || s.node(n).keep_alive
          || out.map_or(false, |o| s.var(o).dead);
        if !free_choice {
          let rc = s.var(out.unwrap()).color;
          debug_assert!(rc != 0);
          chan = color_chan(rc) as i32;
        }

        let mut slot: i32 = -1;

        // Vector slot first.
        if s.node(n).alu_allowed_slots.allows_vector() {
          if chan >= 0 {
            if ctx.free_slots & (1 << chan) != 0 {
              slot = chan;
            }
          } else {
            let mut sl = 0;
            while sl < 4 && ctx.free_slots & (1 << sl) == 0 {
              sl += 1;
            }
            if sl < 4 {
              slot = sl;
            }
          }
        }

        // Trans slot as a fallback.
        if slot == -1
          && s.node(n).alu_allowed_slots.allows_trans()
          && ctx.free_slots & 0x10 != 0
        {
          slot = 4;
        }

        if slot == -1 {
          continue;
        }

        if slot < 4 {
          chan = slot;
        }
        if chan != -1 {
          s.node_mut(n).alu.as_mut().unwrap().dst.chan = chan as u8;
        }

        ctx.slots[2][slot as usize] = Some(n);
        if kill {
          contains_kill = true;
        }
        // Remember where to put the instruction back if the group evicts it.
        ctx.idx[slot as usize] = index;
      }

      // Literal budget.
      let saved_nliteral = ctx.nliteral;
      let mut rejected = false;
      for j in 0..max_slots {
        if let Some(c) = ctx.slots[2][j] {
          let alu = s.node(c).alu.as_ref().unwrap().clone();
          if !alu_group_literals(&mut ctx.literal, &mut ctx.nliteral, &alu) {
            rejected = true;
            break;
          }
        }
      }

      // Bank swizzle.
      if !rejected {
        let saved_cbs = ctx.cbs;
        for q in 0..max_slots {
          if ctx.slots[2][q].is_some() && !cbs_add_slot(s, &mut ctx, 2, q) {
            rejected = true;
            break;
          }
        }
        if rejected {
          ctx.cbs = saved_cbs;
        }
      }

      if rejected {
        ctx.nliteral = saved_nliteral;
        continue;
      }

      // All checks passed: commit into the group.
      for j in 0..max_slots {
        if let Some(c) = ctx.slots[2][j] {
          ctx.slots[ctx.curgroup][j] = Some(c);
          ctx.slots[2][j] = None;
          ctx.free_slots &= !(1 << j);
        }
      }

      ctx.ready_inst.remove(index);
      ctx.count -= 1;

      if ctx.free_slots == 0 {
        break;
      }
    }

    if !sched_check_interferences(s, &mut ctx) {
      return false;
    }
    if ctx.restart {
      continue;
    }
    ctx.empty_count = 0;

    // If a vector slot freed up and the trans instruction fits there,
    // prefer the vector slot.
    if let Some(t) = ctx.slots[ctx.curgroup][4] {
      let slot = s.node(t).alu.as_ref().unwrap().dst.chan as usize;
      if ctx.slots[ctx.curgroup][slot].is_none()
        && s.node(t).alu_allowed_slots.allows_vector()
      {
        ctx.slots[ctx.curgroup][slot] = Some(t);
        ctx.slots[ctx.curgroup][4] = None;
        debug!("moving inst from trans to {}", slot);
      }
    }

    sched_process_selected_group(s, &mut ctx);
    sched_check_clause_limits(s, &mut ctx);

    let live = ctx.live.clone();
    s.mark_interferences(&live);

    sched_add_group(s, &mut ctx);

    ctx.curgroup = 1 - ctx.curgroup;
  }

  s.node_mut(clause_node).child = ctx.out_list;
  if let Some(head) = ctx.out_list {
    s.node_mut(head).parent = Some(clause_node);
  }
  result
}

fn post_schedule_node(s: &mut OptSession, node: NodeIx) -> bool {
  if s.node(node).subtype == NodeSubtype::AluClause {
    if !post_schedule_alu(s, node) {
      return false;
    }
  } else {
    let (child, rest) = {
      let n = s.node(node);
      (n.child, n.rest)
    };
    if let Some(r) = rest {
      if !post_schedule_node(s, r) {
        return false;
      }
    }
    if let Some(c) = child {
      if !post_schedule_node(s, c) {
        return false;
      }
    }
  }
  true
}

/// Schedule every ALU clause of the shader.  Returns false if any clause
/// could not be scheduled; the caller falls back to the original bytecode.
pub fn post_schedule(s: &mut OptSession) -> bool {
  let root = s.root;
  post_schedule_node(s, root)
}
