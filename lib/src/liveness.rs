/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Liveness analysis: one bottom-up post-order traversal computing, per node,
//! the live set before and after it, marking dead code on the way, and
//! recording pairwise interference whenever execution crosses a
//! synchronization boundary.  Instructions issued within one ALU cycle do not
//! interfere with each other's outputs (the hardware commits a whole group at
//! once), so the boundary for ALU code is the cycle's closing instruction,
//! not every instruction.
//!
//! Loop bodies are walked twice: once to seed the region's entry live set,
//! then again with the loop-carried values added, which is exactly the fixed
//! point for reducible single-header loops.

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::data_structures::{NodeIx, SortedSet, VarIx};

type Live = SortedSet<VarIx>;

//=============================================================================
// Helpers over phi lists

fn update_ins_liveness(s: &mut OptSession, node: NodeIx) {
  let dead = s.node(node).dead;
  let ins = s.node(node).ins.clone();
  for v in ins.iter().flatten() {
    if !dead {
      s.var_mut(*v).dead = false;
    }
  }
}

/// Kill the outputs of a phi list: a phi whose result is not live is dead.
fn outs_dead(s: &mut OptSession, node: NodeIx, live: &mut Live) {
  let (rest, child) = {
    let n = s.node(node);
    (n.rest, n.child)
  };
  if let Some(r) = rest {
    outs_dead(s, r, live);
  }
  if let Some(c) = child {
    outs_dead(s, c, live);
  }

  if !s.node(node).outs.is_empty() {
    let outs = s.node(node).outs.clone();
    if !live.remove_opt_slice(&outs) {
      s.node_mut(node).dead = true;
    } else {
      s.node_mut(node).dead = false;
      update_ins_liveness(s, node);
    }
  }
}

/// Revive the `n`-th operand of every live phi in the list: values flow into
/// a phi only along the branch edge being taken.
fn live_phi_branch(s: &mut OptSession, node: NodeIx, live: &mut Live, n: usize) {
  if s.node(node).dead {
    return;
  }
  let (rest, child) = {
    let nd = s.node(node);
    (nd.rest, nd.child)
  };
  if let Some(r) = rest {
    live_phi_branch(s, r, live, n);
  }
  if let Some(c) = child {
    live_phi_branch(s, c, live, n);
  }
  if !s.node(node).ins.is_empty() {
    if let Some(v) = s.node(node).ins[n - 1] {
      live.insert(v);
    }
  }
}

//=============================================================================
// The traversal

fn node_liveness(s: &mut OptSession, node: NodeIx, live: &mut Live) {
  if let Some(phi) = s.node(node).phi {
    outs_dead(s, phi, live);
  }

  // Entering the node from below: a synchronization boundary unless we are
  // in the middle of an ALU issue cycle.
  let at_cycle_boundary = {
    let n = s.node(node);
    n.kind != NodeType::List
      && (!n.is_alu_like() || n.alu.as_ref().unwrap().last)
  };
  if at_cycle_boundary {
    s.mark_interferences(live);
  }

  {
    let n = s.node_mut(node);
    if let Some(set) = &mut n.vars_live_after {
      set.copy_from(live);
    } else {
      n.vars_live_after = Some(live.clone());
    }
  }

  let kind = s.node(node).kind;

  if kind == NodeType::Depart {
    let target = s.node(node).target.unwrap();
    match &s.node(target).vars_live_after {
      Some(set) => {
        let set = set.clone();
        live.copy_from(&set);
      }
      None => live.clear(),
    }
    if let Some(phi) = s.node(target).phi {
      let n = s.node(node).depart_number as usize;
      live_phi_branch(s, phi, live, n);
    }
  }

  if kind == NodeType::If {
    if let Some(phi) = s.node(node).phi {
      live_phi_branch(s, phi, live, 2);
    }
  }

  if kind == NodeType::Repeat {
    let target = s.node(node).target.unwrap();
    if s.node(target).loop_phi.is_some() {
      match &s.node(target).vars_live {
        Some(set) => {
          let set = set.clone();
          live.copy_from(&set);
        }
        None => live.clear(),
      }
      let loop_phi = s.node(target).loop_phi.unwrap();
      let n = s.node(node).repeat_number as usize;
      live_phi_branch(s, loop_phi, live, n + 1);
    }
  }

  if let Some(rest) = s.node(node).rest {
    node_liveness(s, rest, live);
  }

  if let Some(child) = s.node(node).child {
    if s.node(child).kind == NodeType::Region {
      if let Some(set) = &mut s.node_mut(child).vars_live {
        set.clear();
      }
    }
    node_liveness(s, child, live);
  }

  if kind == NodeType::If {
    let after = s.node(node).vars_live_after.as_ref().unwrap().clone();
    live.add_set(&after);
    if let Some(phi) = s.node(node).phi {
      live_phi_branch(s, phi, live, 1);
    }
  }

  if kind == NodeType::Op {
    if !s.node(node).outs.is_empty() && !s.node(node).keep_alive {
      let outs = s.node(node).outs.clone();
      let mut alive = false;
      for o in outs.iter().flatten() {
        if !live.remove(*o) {
          s.var_mut(*o).dead = true;
        } else {
          alive = true;
          s.var_mut(*o).dead = false;
        }
      }
      s.node_mut(node).dead = !alive;
    }

    if !s.node(node).dead && !s.node(node).ins.is_empty() {
      let ins = s.node(node).ins.clone();
      live.add_opt_slice(&ins);
    }
  } else if kind == NodeType::If && !s.node(node).ins.is_empty() {
    let ins = s.node(node).ins.clone();
    live.add_opt_slice(&ins);
  }

  if let Some(loop_phi) = s.node(node).loop_phi {
    outs_dead(s, loop_phi, live);

    {
      let n = s.node_mut(node);
      if let Some(set) = &mut n.vars_live {
        set.copy_from(live);
      } else {
        n.vars_live = Some(live.clone());
      }
    }

    // Second pass over the loop body, now with the loop-carried values in
    // the live set.
    if let Some(child) = s.node(node).child {
      node_liveness(s, child, live);
    }

    outs_dead(s, loop_phi, live);
    live_phi_branch(s, loop_phi, live, 1);
  }

  // Four-slot groups: if every lane is dead the whole group dies; if the
  // group must still execute, dead lanes lose their destination write but
  // keep consuming their inputs.
  let in_four_slot_group = s.node(node).four_slots
    && s
      .node(node)
      .parent
      .and_then(|p| s.node(p).parent)
      .map_or(false, |pp| s.node(pp).subtype == NodeSubtype::AluGroup);
  if in_four_slot_group {
    let mut n = Some(s.node(node).parent.unwrap());
    let mut alive = false;
    while let Some(nx) = n {
      if let Some(c) = s.node(nx).child {
        if s.node(c).four_slots && !s.node(c).dead {
          alive = true;
          break;
        }
      }
      n = s.node(nx).rest;
    }
    if alive {
      let mut n = Some(s.node(node).parent.unwrap());
      while let Some(nx) = n {
        if let Some(c) = s.node(nx).child {
          if s.node(c).dead && s.node(c).four_slots {
            s.node_mut(c).dead = false;
            if let Some(alu) = &mut s.node_mut(c).alu {
              alu.dst.write = false;
            }
            s.node_mut(c).outs[0] = None;

            let outs = s.node(c).outs.clone();
            live.remove_opt_slice(&outs);
            let ins = s.node(c).ins.clone();
            live.add_opt_slice(&ins);
          }
        }
        n = s.node(nx).rest;
      }
    } else {
      let group = s.node(s.node(node).parent.unwrap()).parent.unwrap();
      s.node_mut(group).dead = true;
    }
  }

  if let Some(fd) = s.node(node).flow_dep {
    if !s.node(node).dead {
      live.insert(fd);
    }
  }

  // Leaving the node upwards: another boundary for everything but plain ALU
  // instructions.
  let leaving_boundary = {
    let n = s.node(node);
    n.kind != NodeType::List && !n.is_alu_like()
  };
  if leaving_boundary {
    s.mark_interferences(live);
  }

  {
    let n = s.node_mut(node);
    if let Some(set) = &mut n.vars_live {
      set.copy_from(live);
    } else {
      n.vars_live = Some(live.clone());
    }
  }
}

//=============================================================================
// Entry point

pub fn liveness(s: &mut OptSession) {
  let mut live = Live::empty();
  let root = s.root;
  node_liveness(s, root, &mut live);
  s.liveness_correct = true;
}
