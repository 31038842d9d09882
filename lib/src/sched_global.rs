/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Global scheduling: compute a coarse scheduling priority per node with two
//! tree walks, then rebuild each region's body by dequeueing blocks in
//! priority order.  The first (bottom-up) walk assigns min_prio, rounding
//! fetch instructions up to virtual "levels" of at most 16 fetches so that
//! texture/vertex loads spread out instead of clustering; the second walk
//! back-propagates fetch dependencies into max_prio, which says how far an
//! instruction's result can be delayed.  The rebuild turns runs of adjacent
//! ALU blocks into fresh provisional clauses; the clause scheduler repacks
//! them properly later.

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::data_structures::{NodeIx, PrioQueue, SortedMap};

pub const PRIO_STEP: u32 = 1;
pub const PRIO_BLOCKSTEP: u32 = 1 << 16;

/// Fetches per virtual level before spilling to the next one.
const FETCHES_PER_LEVEL: u32 = 16;

//=============================================================================
// Used-variable sets

fn gs_collect_vars_usage(s: &mut OptSession, node: NodeIx) {
  s.node_mut(node).vars_used.clear();

  let (child, rest, phi, loop_phi) = {
    let n = s.node(node);
    (n.child, n.rest, n.phi, n.loop_phi)
  };

  if let Some(c) = child {
    gs_collect_vars_usage(s, c);
    let set = s.node(c).vars_used.clone();
    s.node_mut(node).vars_used.add_set(&set);
  }
  if let Some(r) = rest {
    gs_collect_vars_usage(s, r);
    let set = s.node(r).vars_used.clone();
    s.node_mut(node).vars_used.add_set(&set);
  }
  if let Some(p) = loop_phi {
    gs_collect_vars_usage(s, p);
    let set = s.node(p).vars_used.clone();
    s.node_mut(node).vars_used.add_set(&set);
  }
  if let Some(p) = phi {
    gs_collect_vars_usage(s, p);
    let set = s.node(p).vars_used.clone();
    s.node_mut(node).vars_used.add_set(&set);
  }

  let ins = s.node(node).ins.clone();
  s.node_mut(node).vars_used.add_opt_slice(&ins);
  if let Some(fd) = s.node(node).flow_dep {
    s.node_mut(node).vars_used.insert(fd);
  }
}

//=============================================================================
// Priorities

fn prio_subtype(s: &OptSession, node: NodeIx) -> NodeSubtype {
  match s.node(node).subtype {
    st @ (NodeSubtype::AluInst
    | NodeSubtype::CfInst
    | NodeSubtype::TexInst
    | NodeSubtype::VtxInst
    | NodeSubtype::Phi) => st,
    NodeSubtype::Copy | NodeSubtype::AluGroup => NodeSubtype::AluInst,
    _ => NodeSubtype::None,
  }
}

fn is_structural(s: &OptSession, node: NodeIx) -> bool {
  let n = s.node(node);
  n.kind == NodeType::Region
    || n.kind == NodeType::If
    || n.subtype == NodeSubtype::AluGroup
}

fn gs_calc_min_prio(s: &mut OptSession, node: NodeIx) -> u32 {
  if s.node(node).dead {
    return 0;
  }

  let mut max_child_prio: u32 = 0;

  let (phi, rest, child) = {
    let n = s.node(node);
    (n.phi, n.rest, n.child)
  };
  if let Some(p) = phi {
    max_child_prio = max_child_prio.max(gs_calc_min_prio(s, p));
  }
  if let Some(r) = rest {
    max_child_prio = max_child_prio.max(gs_calc_min_prio(s, r));
  }
  if let Some(c) = child {
    max_child_prio = max_child_prio.max(gs_calc_min_prio(s, c));
  }

  let mut pri = max_child_prio;

  let outs = s.node(node).outs.clone();
  for v in outs.iter().flatten() {
    let vd = s.var(*v);
    if !vd.dead && vd.prio > pri {
      pri = vd.prio;
    }
  }

  if s.node(node).kind != NodeType::List {
    let st = s.node(node).subtype;
    if st == NodeSubtype::TexInst || st == NodeSubtype::VtxInst {
      // Round up to the next fetch level with room left.
      pri = (pri - pri % PRIO_BLOCKSTEP) + PRIO_BLOCKSTEP;
      let mut lvl = pri / PRIO_BLOCKSTEP;
      loop {
        let d = s.fetch_levels.get(lvl).unwrap_or(0);
        if d == FETCHES_PER_LEVEL {
          lvl += 1;
          pri += PRIO_BLOCKSTEP;
          continue;
        }
        s.fetch_levels.set(lvl, d + 1);
        break;
      }
    } else {
      pri += PRIO_STEP;
    }
  }

  s.node_mut(node).min_prio = pri;

  let min_prio = pri;
  for v in outs.iter().flatten() {
    let vd = s.var_mut(*v);
    if !vd.dead && vd.prio < min_prio {
      vd.prio = min_prio;
    }
  }

  let ins = s.node(node).ins.clone();
  for v in ins.iter().flatten() {
    let vd = s.var_mut(*v);
    if !vd.dead && vd.prio < pri {
      vd.prio = pri;
    }
  }

  let kind = s.node(node).kind;
  if kind == NodeType::Depart || kind == NodeType::Repeat {
    if let Some(live) = s.node(node).vars_live.clone() {
      for &v in live.iter() {
        let vd = s.var_mut(v);
        if !vd.dead && vd.prio < pri {
          vd.prio = pri;
        }
      }
    }
  }

  if let Some(lp) = s.node(node).loop_phi {
    // Loop phis see both the entry and the back edge; iterate once more so
    // the body's uses raise the loop-carried priorities.
    gs_calc_min_prio(s, lp);
    if let Some(c) = s.node(node).child {
      gs_calc_min_prio(s, c);
    }
    gs_calc_min_prio(s, lp);
  }

  if is_structural(s, node) {
    s.node_mut(node).min_prio = max_child_prio;
    let min_prio = max_child_prio;
    for &v in s.node(node).vars_used.clone().iter() {
      let vd = s.var_mut(v);
      if vd.prio < min_prio {
        vd.prio = min_prio;
      }
    }
  }

  if let Some(fd) = s.node(node).flow_dep {
    let min_prio = s.node(node).min_prio;
    let vd = s.var_mut(fd);
    if vd.prio < min_prio {
      vd.prio = min_prio;
    }
  }

  max_child_prio.max(s.node(node).min_prio)
}

fn gs_calc_max_prio(s: &mut OptSession, node: NodeIx) {
  if s.node(node).kind != NodeType::List {
    let st = prio_subtype(s, node);
    let alu = st == NodeSubtype::AluInst;
    let fetch = st == NodeSubtype::TexInst || st == NodeSubtype::VtxInst;
    let mut fetch_dep = false;
    let mut pri = u32::MAX;

    if let Some(fd) = s.node(node).flow_dep {
      let vd = s.var(fd);
      if !vd.dead && vd.prio < pri {
        pri = vd.prio;
      }
    }

    if !s.node(node).ins.is_empty() {
      let ins = s.node(node).ins.clone();
      for v in ins.iter().flatten() {
        let vd = s.var(*v);
        if !vd.dead {
          if vd.prio < pri {
            pri = vd.prio;
          }
          fetch_dep |= vd.fetch_dep;
        }
      }
    } else if !s.node(node).vars_used.is_empty() && is_structural(s, node) {
      for &v in s.node(node).vars_used.clone().iter() {
        let vd = s.var(v);
        if !vd.dead && vd.prio < pri {
          pri = vd.prio;
        }
      }
    }

    if !fetch_dep || !alu {
      pri = s.node(node).min_prio;
      if fetch {
        fetch_dep = true;
      }
    } else {
      pri -= 1;
    }

    s.node_mut(node).max_prio = pri;

    let outs = s.node(node).outs.clone();
    for v in outs.iter().flatten() {
      let vd = s.var_mut(*v);
      if !vd.dead {
        vd.prio = pri;
        vd.fetch_dep = fetch_dep;
      }
    }
  }

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    gs_calc_max_prio(s, c);
  }
  if let Some(r) = rest {
    gs_calc_max_prio(s, r);
  }
}

//=============================================================================
// Block reordering

fn is_block(s: &OptSession, node: NodeIx) -> bool {
  let n = s.node(node);
  matches!(
    n.kind,
    NodeType::Op
      | NodeType::Region
      | NodeType::If
      | NodeType::Repeat
      | NodeType::Depart
  ) || n.subtype == NodeSubtype::AluGroup
}

fn gs_enqueue_blocks(
  s: &mut OptSession, blocks: &mut PrioQueue<NodeIx>, node: NodeIx,
) {
  if is_block(s, node) {
    let parent = s.node(node).parent.unwrap();
    s.node_mut(parent).child = None;
    if !s.node(node).dead {
      let prio = s.node(node).max_prio;
      blocks.enqueue(prio as u64, node);
    }
    return;
  }

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(r) = rest {
    gs_enqueue_blocks(s, blocks, r);
  }
  if let Some(c) = child {
    gs_enqueue_blocks(s, blocks, c);
  }
}

/// Rebuild a flat list from the priority queue of blocks.  Runs of adjacent
/// ALU blocks become fresh provisional clauses; instructions sharing a
/// min_prio are tentatively grouped, to be repacked by the clause scheduler.
fn gs_create_list(
  s: &mut OptSession, blocks: &PrioQueue<NodeIx>,
) -> Option<NodeIx> {
  let mut list: Option<NodeIx> = None;
  let mut clause: Option<NodeIx> = None;
  let mut lc: Option<NodeIx> = None;
  let mut last_alu = false;
  let mut last_alu_prio: u32 = 0;
  let mut nalu: usize = 0;

  for q in 0..blocks.card() {
    let (_, n) = blocks.nth(q);
    let st = s.node(n).subtype;
    let alu = st == NodeSubtype::AluInst
      || st == NodeSubtype::AluGroup
      || st == NodeSubtype::Copy;

    if alu {
      if st == NodeSubtype::AluInst || st == NodeSubtype::Copy {
        let min_prio = s.node(n).min_prio;
        let new_group =
          min_prio != last_alu_prio || nalu == s.max_slots - 1;
        if new_group {
          s.node_mut(n).alu.as_mut().unwrap().last = true;
          nalu = 0;
        } else {
          s.node_mut(n).alu.as_mut().unwrap().last = false;
        }
        last_alu_prio = min_prio;
        nalu += 1;
      } else {
        last_alu_prio = 0;
      }

      if !last_alu {
        // Start a new ALU clause.
        let cl = s.new_node(NodeType::Group);
        s.node_mut(cl).subtype = NodeSubtype::AluClause;
        clause = Some(cl);

        let outer = s.new_node(NodeType::List);
        if let Some(head) = list {
          s.set_rest(outer, head);
        }
        list = Some(outer);
        s.set_child(outer, cl);
        lc = Some(s.new_node(NodeType::List));
      } else {
        let inner = s.new_node(NodeType::List);
        s.set_rest(inner, lc.unwrap());
        lc = Some(inner);
      }
    } else {
      if last_alu {
        let cl = clause.unwrap();
        s.set_child(cl, lc.unwrap());
        clause = None;
      }

      let outer = s.new_node(NodeType::List);
      if let Some(head) = list {
        s.set_rest(outer, head);
      }
      list = Some(outer);
      lc = list;
    }

    s.set_child(lc.unwrap(), n);
    last_alu = alu;
  }

  if last_alu {
    let cl = clause.unwrap();
    s.set_child(cl, lc.unwrap());
  }

  list
}

fn gs_schedule_node(s: &mut OptSession, node: NodeIx) {
  let mut blocks = PrioQueue::<NodeIx>::empty();
  let child = s.node(node).child.unwrap();
  gs_enqueue_blocks(s, &mut blocks, child);

  for q in (0..blocks.card()).rev() {
    let (_, n) = blocks.nth(q);
    let structural = matches!(
      s.node(n).kind,
      NodeType::Region | NodeType::Repeat | NodeType::Depart | NodeType::If
    );
    if s.node(n).child.is_some() && structural {
      gs_schedule_node(s, n);
    }
  }

  let list = gs_create_list(s, &blocks);
  s.node_mut(node).child = list;
  if let Some(l) = list {
    s.node_mut(l).parent = Some(node);
  }
}

//=============================================================================
// Entry point

pub fn gs_schedule(s: &mut OptSession) {
  let root = s.root;
  gs_collect_vars_usage(s, root);

  s.fetch_levels.clear();
  gs_calc_min_prio(s, root);
  s.fetch_levels.clear();

  gs_calc_max_prio(s, root);

  gs_schedule_node(s, root);
}
