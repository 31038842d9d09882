/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! SSA construction over the structured tree.  No dominance frontiers: the
//! region/if/loop structure says exactly where values merge, so trivial phis
//! are placed at every if join and region join (plus loop phis at loop
//! headers), and a single top-down renaming walk threads the current
//! variable-to-index mapping through the tree.  Depart and repeat edges get a
//! private copy of the mapping, whose only lasting effect is writing the
//! matching phi operand of the target region.

use rustc_hash::FxHashMap;

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::bytecode::MAX_GPRS;
use crate::data_structures::{NodeIx, SortedMap, VarIx};
use crate::parse::set_constraint;
use crate::vars::REG_PR;

type Renames = SortedMap<VarIx, u32>;

//=============================================================================
// Defined-variable sets

fn variables_defined(s: &mut OptSession, node: NodeIx) {
  s.node_mut(node).vars_defined.clear();

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    variables_defined(s, c);
  }
  if let Some(r) = rest {
    variables_defined(s, r);
  }

  let kind = s.node(node).kind;
  if (kind == NodeType::Depart || kind == NodeType::Repeat) && child.is_some() {
    let target = s.node(node).target.unwrap();
    let child_defined = s.node(child.unwrap()).vars_defined.clone();
    s.node_mut(target).vars_defined.add_set(&child_defined);
  } else if kind == NodeType::Op {
    let outs = s.node(node).outs.clone();
    let n = s.node_mut(node);
    n.vars_defined.clear();
    n.vars_defined.add_opt_slice(&outs);
  } else {
    let outs = s.node(node).outs.clone();
    {
      let n = s.node_mut(node);
      n.vars_defined.clear();
      n.vars_defined.add_opt_slice(&outs);
    }
    if let Some(c) = child {
      let set = s.node(c).vars_defined.clone();
      s.node_mut(node).vars_defined.add_set(&set);
    }
    if let Some(r) = rest {
      let set = s.node(r).vars_defined.clone();
      s.node_mut(node).vars_defined.add_set(&set);
    }

    // Clause-local values (the predicate, and the reserved scratch GPRs)
    // never escape an ALU clause.
    if s.node(node).subtype == NodeSubtype::AluClause {
      let temp_gprs = s.temp_gprs;
      let locals: Vec<VarIx> = s
        .node(node)
        .vars_defined
        .iter()
        .copied()
        .filter(|&v| {
          let vd = s.var(v);
          vd.reg == REG_PR
            || (vd.reg < MAX_GPRS && vd.reg >= MAX_GPRS - temp_gprs)
        })
        .collect();
      for v in locals {
        s.node_mut(node).vars_defined.remove(v);
      }
    }
  }
}

//=============================================================================
// Phi insertion

/// Build a list of trivial phis, one per variable defined under `node`, each
/// with `count` operands all naming the variable itself.
fn phi_make_trivials(
  s: &mut OptSession, node: NodeIx, count: usize,
) -> Option<NodeIx> {
  let defined: Vec<VarIx> = s.node(node).vars_defined.iter().copied().collect();
  let mut start: Option<NodeIx> = None;
  let mut l: Option<NodeIx> = None;

  for v in defined {
    let p = s.new_node(NodeType::Op);
    {
      let n = s.node_mut(p);
      n.subtype = NodeSubtype::Phi;
      n.outs = vec![Some(v)].into();
      n.ins = vec![Some(v); count].into();
    }

    let list = match l {
      Some(prev) => s.append_list(prev),
      None => s.new_node(NodeType::List),
    };
    l = Some(list);
    s.set_child(list, p);
    if start.is_none() {
      start = Some(list);
    }
  }
  start
}

fn insert_phi(s: &mut OptSession, node: NodeIx) {
  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    insert_phi(s, c);
  }
  if let Some(r) = rest {
    insert_phi(s, r);
  }

  match s.node(node).kind {
    NodeType::If => {
      let phi = phi_make_trivials(s, node, 2);
      s.node_mut(node).phi = phi;
    }
    NodeType::Region => {
      let departs = s.node(node).depart_count as usize;
      let phi = phi_make_trivials(s, node, departs);
      s.node_mut(node).phi = phi;
      let repeats = s.node(node).repeat_count as usize;
      if repeats > 0 {
        let loop_phi = phi_make_trivials(s, node, repeats + 1);
        s.node_mut(node).loop_phi = loop_phi;
      }
    }
    _ => {}
  }
}

//=============================================================================
// Renaming

struct SsaState {
  /// Monotonic definition counter per physical (reg, chan) location.
  def_count: FxHashMap<VarIx, u32>,
}

fn rename_var(s: &mut OptSession, var: VarIx, new_index: u32) -> VarIx {
  let (reg, chan) = {
    let v = s.var(var);
    (v.reg, v.chan)
  };
  let new_var = s.get_var(reg, chan, new_index);
  // Carry the flags of the base variable.
  let (dead, temp, pin_chan, pin_reg, special, undefined) = {
    let v = s.var(var);
    (v.dead, v.temp, v.pin_chan, v.pin_reg, v.special, v.undefined)
  };
  {
    let v = s.var_mut(new_var);
    v.dead = dead;
    v.temp = temp;
    v.pin_chan = pin_chan;
    v.pin_reg = pin_reg;
    v.special = special;
    v.undefined = undefined;
  }
  new_var
}

fn add_use(s: &mut OptSession, v: VarIx, node: NodeIx) {
  s.var_mut(v).uses.insert(node);
}

fn rename_def(
  s: &mut OptSession, st: &mut SsaState, var: VarIx, renames: &mut Renames,
  node: NodeIx,
) -> VarIx {
  let i = st.def_count.get(&var).copied().unwrap_or(0) + 1;
  st.def_count.insert(var, i);
  renames.set(var, i);
  let new_var = rename_var(s, var, i);
  s.var_mut(new_var).def = Some(node);
  new_var
}

fn ssa_rename_use(
  s: &mut OptSession, var: VarIx, renames: &Renames,
) -> VarIx {
  let new_index = renames.get(var).unwrap_or(0);
  rename_var(s, var, new_index)
}

fn rename_phi_operand(
  s: &mut OptSession, n: usize, phi: NodeIx, renames: &Renames,
) {
  debug_assert!(n - 1 < s.node(phi).ins.len());
  let v = s.node(phi).ins[n - 1].unwrap();
  let i = renames.get(v).unwrap_or(0);
  let v = rename_var(s, v, i);
  add_use(s, v, phi);
  s.node_mut(phi).ins[n - 1] = Some(v);
}

fn ssa_ins(s: &mut OptSession, node: NodeIx, renames: &Renames) {
  let ins = s.node(node).ins.clone();
  for (i, slot) in ins.iter().enumerate() {
    if let Some(vi) = slot {
      let vi = ssa_rename_use(s, *vi, renames);
      add_use(s, vi, node);
      s.node_mut(node).ins[i] = Some(vi);
    }
  }
}

fn ssa_outs(
  s: &mut OptSession, st: &mut SsaState, node: NodeIx, renames: &mut Renames,
) {
  let outs = s.node(node).outs.clone();
  for (i, slot) in outs.iter().enumerate() {
    if let Some(v) = slot {
      debug_assert!(s.var(*v).index == 0);
      let v = rename_def(s, st, *v, renames, node);
      s.node_mut(node).outs[i] = Some(v);
    }
  }
}

/// All instructions of the hardware issue cycle ending at `node` (which
/// carries the `last` flag), gathered by walking backwards through the
/// sibling lists and through any four-slot group node on the way.
fn gather_cycle_insts(s: &OptSession, node: NodeIx) -> Vec<NodeIx> {
  let mut ii = vec![node];
  let own_list = s.node(node).parent.unwrap();
  let mut c = s.node(own_list).parent;
  let mut last_group: Option<NodeIx> = None;
  let mut level = 0;

  while let Some(cx) = c {
    if s.node(cx).child.is_none() || s.node(cx).subtype == NodeSubtype::AluClause
    {
      break;
    }
    let child = s.node(cx).child.unwrap();
    if s.node(child).alu.is_some() {
      if !s.node(child).alu.as_ref().unwrap().last {
        ii.push(child);
      } else {
        break;
      }
    } else if s.node(child).subtype == NodeSubtype::AluGroup {
      if Some(child) != last_group && level == 0 {
        level += 1;
        last_group = Some(child);
        // Jump to the last list inside the group.
        let mut gl = s.node(child).child.unwrap();
        while let Some(r) = s.node(gl).rest {
          gl = r;
        }
        c = Some(gl);
        continue;
      } else {
        level -= 1;
      }
    }
    c = s.node(cx).parent;
  }

  ii
}

fn ssa_walk(
  s: &mut OptSession, st: &mut SsaState, node: Option<NodeIx>,
  renames: &mut Renames,
) {
  let node = match node {
    Some(n) => n,
    None => return,
  };

  if let Some(fd) = s.node(node).flow_dep {
    let fd = ssa_rename_use(s, fd, renames);
    s.node_mut(node).flow_dep = Some(fd);
  }

  match s.node(node).kind {
    NodeType::Region => {
      let mut p = s.node(node).loop_phi;
      while let Some(px) = p {
        let phi = match s.node(px).child {
          Some(phi) => phi,
          None => break,
        };
        rename_phi_operand(s, 1, phi, renames);
        let out = s.node(phi).outs[0].unwrap();
        let out = rename_def(s, st, out, renames, phi);
        s.node_mut(phi).outs[0] = Some(out);
        p = s.node(px).rest;
      }

      let child = s.node(node).child;
      ssa_walk(s, st, child, renames);

      let mut p = s.node(node).phi;
      while let Some(px) = p {
        let phi = match s.node(px).child {
          Some(phi) => phi,
          None => break,
        };
        let out = s.node(phi).outs[0].unwrap();
        let out = rename_def(s, st, out, renames, phi);
        s.node_mut(phi).outs[0] = Some(out);
        p = s.node(px).rest;
      }
    }

    NodeType::If => {
      let mut p = s.node(node).phi;
      while let Some(px) = p {
        let phi = match s.node(px).child {
          Some(phi) => phi,
          None => break,
        };
        rename_phi_operand(s, 1, phi, renames);
        p = s.node(px).rest;
      }

      ssa_ins(s, node, renames);
      ssa_outs(s, st, node, renames);
      let child = s.node(node).child;
      ssa_walk(s, st, child, renames);

      let mut p = s.node(node).phi;
      while let Some(px) = p {
        let phi = match s.node(px).child {
          Some(phi) => phi,
          None => break,
        };
        rename_phi_operand(s, 2, phi, renames);
        let out = s.node(phi).outs[0].unwrap();
        let out = rename_def(s, st, out, renames, phi);
        s.node_mut(phi).outs[0] = Some(out);
        p = s.node(px).rest;
      }
    }

    NodeType::Depart => {
      let mut new_renames = renames.clone();
      let child = s.node(node).child;
      ssa_walk(s, st, child, &mut new_renames);
      ssa_ins(s, node, renames);
      ssa_outs(s, st, node, renames);

      if let Some(target) = s.node(node).target {
        let depart_number = s.node(node).depart_number as usize;
        let mut p = s.node(target).phi;
        while let Some(px) = p {
          let phi = match s.node(px).child {
            Some(phi) => phi,
            None => break,
          };
          rename_phi_operand(s, depart_number, phi, &new_renames);
          p = s.node(px).rest;
        }
      }
    }

    NodeType::Repeat => {
      let mut new_renames = renames.clone();
      let child = s.node(node).child;
      ssa_walk(s, st, child, &mut new_renames);
      ssa_ins(s, node, renames);
      ssa_outs(s, st, node, renames);

      if let Some(target) = s.node(node).target {
        let repeat_number = s.node(node).repeat_number as usize;
        let mut p = s.node(target).loop_phi;
        while let Some(px) = p {
          let phi = match s.node(px).child {
            Some(phi) => phi,
            None => break,
          };
          rename_phi_operand(s, repeat_number + 1, phi, &new_renames);
          p = s.node(px).rest;
        }
      }
    }

    NodeType::List => {
      let child = s.node(node).child;
      ssa_walk(s, st, child, renames);
      let rest = s.node(node).rest;
      ssa_walk(s, st, rest, renames);
    }

    NodeType::Group => {
      let child = s.node(node).child;
      ssa_walk(s, st, child, renames);
    }

    NodeType::Op => {
      if s.node(node).is_alu_like() {
        // ALU groups execute as one step: all of the cycle's reads happen
        // before any of its writes commit.  Rename at the cycle's closing
        // instruction only.
        if s.node(node).alu.as_ref().unwrap().last {
          let insts = gather_cycle_insts(s, node);
          for &i in insts.iter() {
            ssa_ins(s, i, renames);
          }
          for &i in insts.iter().rev() {
            ssa_outs(s, st, i, renames);
          }
        }
      } else {
        ssa_ins(s, node, renames);
        ssa_outs(s, st, node, renames);

        if s.node(node).reg_constraint {
          set_constraint(s, node, true);
          set_constraint(s, node, false);
        }
      }
    }
  }
}

//=============================================================================
// Entry point

pub fn build_ssa(s: &mut OptSession) {
  let root = s.root;
  variables_defined(s, root);
  insert_phi(s, root);
  let mut st = SsaState { def_count: FxHashMap::default() };
  let mut renames = Renames::empty();
  ssa_walk(s, &mut st, Some(root), &mut renames);
}
