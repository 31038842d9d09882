/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Second pass of tree construction: rewrite the raw jump/loop records left
//! by `parse` into structured nodes.  A one-armed conditional becomes an If;
//! an if/else pattern becomes a Region with two numbered Departs; a loop
//! becomes a Region with a Repeat; loop breaks and continues become Departs
//! and Repeats targeting the enclosing loop region.  Jump targets are matched
//! by scanning forward for the record with the target address.
//!
//! The raw ELSE/POP/LOOP_END records stay in the tree as inert ops (they
//! define the active mask for SSA purposes); emission rebuilds the real
//! control flow from the structured nodes and ignores them.

use log::debug;

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::bytecode::CfKind;
use crate::data_structures::NodeIx;
use crate::vars::REG_AM;

fn find_cf_by_addr(
  s: &OptSession, mut list: Option<NodeIx>, addr: u32,
) -> Option<NodeIx> {
  while let Some(lx) = list {
    debug_assert!(s.node(lx).kind == NodeType::List);
    if let Some(c) = s.node(lx).child {
      if s.node(c).cf.is_some() && s.node(c).label == addr {
        return Some(c);
      }
    }
    list = s.node(lx).rest;
  }
  None
}

fn jump_target(kind: &CfKind) -> Option<(u32, u32)> {
  match kind {
    CfKind::Jump { target, pop_count } => Some((*target, *pop_count)),
    _ => None,
  }
}

//=============================================================================
// Conditionals

fn convert_cf_if(s: &mut OptSession, root: NodeIx) {
  let (target, pop_count) = jump_target(s.node(root).cf.as_ref().unwrap())
    .expect("convert_cf_if on a non-jump node");
  let without_else = pop_count > 0;
  let list = s.node(root).parent.unwrap();
  debug_assert!(s.node(list).kind == NodeType::List);

  debug!("converting if @ {}", s.node(root).label);

  let scan = s.node(list).rest;
  let end = find_cf_by_addr(s, scan, target).expect("if: target not found");

  let is_else = matches!(s.node(end).cf, Some(CfKind::Else { .. }));
  let am = s.get_var(REG_AM, 0, 0);

  if !without_else && is_else {
    // Two-armed conditional: region with two departs, the true arm inside
    // the inner depart, the else arm as its sibling.
    let n_else_list = s.node(end).parent.unwrap();
    let else_target = match s.node(end).cf {
      Some(CfKind::Else { target, .. }) => target,
      _ => unreachable!(),
    };
    let join = find_cf_by_addr(s, Some(n_else_list), else_target)
      .expect("if: else join not found");
    let end_list = s.node(join).parent.unwrap();

    let region = s.new_node(NodeType::Region);
    let depart = s.new_node(NodeType::Depart);
    let depart2 = s.new_node(NodeType::Depart);

    {
      let label = s.node(root).label;
      let r = s.node_mut(region);
      r.label = label;
      r.subtype = NodeSubtype::IfElseRegion;
    }

    let true_branch = s.node(list).rest;
    if true_branch != Some(n_else_list) {
      let tb = true_branch.unwrap();
      s.set_child(depart2, tb);
    }

    // Cut before the else arm and before the join.
    let before_else = s.node(n_else_list).parent.unwrap();
    s.node_mut(before_else).rest = None;
    let before_end = s.node(end_list).parent.unwrap();
    s.node_mut(before_end).rest = None;

    // The region replaces the jump in its list; the join follows the region.
    s.set_child(list, region);
    s.set_rest(list, end_list);

    // if-node owns the true-arm depart.
    s.set_child(root, depart2);

    // The region's depart wraps [if, else-op, false arm].
    let dlist = s.new_node(NodeType::List);
    s.node_mut(depart).child = Some(dlist);
    s.node_mut(dlist).parent = Some(depart);
    s.set_child(dlist, root);
    s.set_child(region, depart);

    s.set_rest(dlist, n_else_list);

    {
      let r = s.node_mut(region);
      r.depart_count = 2;
    }
    s.node_mut(depart).depart_number = 1;
    s.node_mut(depart2).depart_number = 2;
    s.node_mut(depart).target = Some(region);
    s.node_mut(depart2).target = Some(region);

    {
      let n = s.node_mut(root);
      n.kind = NodeType::If;
      n.outs = vec![Some(am)].into();
      n.flow_dep = Some(am);
    }

    let else_op = s.node(n_else_list).child.unwrap();
    {
      let n = s.node_mut(else_op);
      n.outs = vec![Some(am)].into();
      n.flow_dep = Some(am);
    }
  } else {
    // One-armed conditional: the jump node becomes the If, its child is the
    // guarded block.
    let true_branch = s.node(list).rest.unwrap();
    s.set_child(root, true_branch);

    let end_list = s.node(end).parent.unwrap();
    let before_end = s.node(end_list).parent.unwrap();
    s.node_mut(before_end).rest = None;
    s.set_rest(list, end_list);

    let n = s.node_mut(root);
    n.kind = NodeType::If;
    n.outs = vec![Some(am)].into();
    n.flow_dep = Some(am);
  }
}

//=============================================================================
// Loops

fn convert_cf_loop(s: &mut OptSession, root: NodeIx) {
  let target = match s.node(root).cf {
    Some(CfKind::LoopStart { target }) => target,
    _ => unreachable!(),
  };
  let list = s.node(root).parent.unwrap();
  debug_assert!(s.node(list).kind == NodeType::List);

  // The loop-start target is the first record after the loop end.
  let scan = s.node(list).rest;
  let after = find_cf_by_addr(s, scan, target).expect("loop: end not found");
  let end_list = s.node(after).parent.unwrap();
  {
    let loop_end_list = s.node(end_list).parent.unwrap();
    let le = s.node(loop_end_list).child.unwrap();
    debug_assert!(matches!(s.node(le).cf, Some(CfKind::LoopEnd { .. })));
  }

  let repeat = s.new_node(NodeType::Repeat);
  {
    let n = s.node_mut(root);
    n.kind = NodeType::Region;
    n.subtype = NodeSubtype::LoopRegion;
    n.repeat_count = 1;
  }
  s.set_child(root, repeat);
  s.node_mut(repeat).repeat_number = 1;
  s.node_mut(repeat).target = Some(root);

  // Loop body: everything after the loop-start's list, through the loop-end
  // record.
  let body = s.node(list).rest.unwrap();
  s.set_child(repeat, body);

  let before_end = s.node(end_list).parent.unwrap();
  s.node_mut(before_end).rest = None;
  s.set_rest(list, end_list);
}

/// Topmost list node of the innermost structural block containing `node`.
fn find_block_start(s: &OptSession, node: NodeIx) -> NodeIx {
  let mut prev = node;
  let mut cur = s.node(node).parent.unwrap();
  loop {
    match s.node(cur).kind {
      NodeType::Region | NodeType::If | NodeType::Depart | NodeType::Repeat => {
        return prev
      }
      _ => {}
    }
    prev = cur;
    cur = s.node(cur).parent.unwrap();
  }
}

fn convert_loop_ops(s: &mut OptSession, node: NodeIx, brk: bool) {
  // Find the enclosing loop region.  It may not exist yet if the enclosing
  // loop has not been converted; this node is revisited afterwards.
  let mut p = s.node(node).parent;
  while let Some(px) = p {
    if s.node(px).repeat_count != 0 {
      break;
    }
    p = s.node(px).parent;
  }
  let region = match p {
    Some(r) => r,
    None => return,
  };
  debug_assert!(s.node(region).kind == NodeType::Region);

  let am = s.get_var(REG_AM, 0, 0);
  {
    let n = s.node_mut(node);
    n.target = Some(region);
    n.outs = vec![Some(am)].into();
    n.flow_dep = Some(am);
  }

  if brk {
    s.node_mut(region).depart_count += 1;
    let num = s.node(region).depart_count;
    let n = s.node_mut(node);
    n.kind = NodeType::Depart;
    n.subtype = NodeSubtype::LoopBreak;
    n.depart_number = num;
  } else {
    s.node_mut(region).repeat_count += 1;
    let num = s.node(region).repeat_count;
    let n = s.node_mut(node);
    n.kind = NodeType::Repeat;
    n.subtype = NodeSubtype::LoopContinue;
    n.repeat_number = num;
  }

  // Wrap the block leading up to this node under it, so the depart/repeat
  // terminates its block.
  let block = find_block_start(s, node);
  let own_list = s.node(node).parent.unwrap();
  if block == own_list || block == node {
    return;
  }

  let before_own = s.node(own_list).parent.unwrap();
  let block_parent = s.node(block).parent.unwrap();

  s.node_mut(node).child = Some(block);
  s.node_mut(before_own).rest = None;
  s.node_mut(block_parent).child = Some(node);
  s.node_mut(node).parent = Some(block_parent);
  s.node_mut(block).parent = Some(node);
}

//=============================================================================
// Driver

fn convert_cf_node(s: &mut OptSession, root: Option<NodeIx>) {
  let root = match root {
    Some(r) => r,
    None => return,
  };

  if s.node(root).kind == NodeType::List {
    let rest = s.node(root).rest;
    convert_cf_node(s, rest);
  }

  let child = s.node(root).child;
  if child.is_some() {
    convert_cf_node(s, child);
  }

  if s.node(root).cf.is_some() && s.node(root).kind == NodeType::Op {
    let kind = s.node(root).cf.as_ref().unwrap().clone();
    match kind {
      CfKind::LoopStart { .. } => {
        convert_cf_loop(s, root);
        let body = s.node(root).child;
        convert_cf_node(s, body);
      }
      CfKind::Jump { .. } => convert_cf_if(s, root),
      CfKind::LoopBreak { .. } => convert_loop_ops(s, root, true),
      CfKind::LoopContinue { .. } => convert_loop_ops(s, root, false),
      _ => {}
    }
  }
}

/// Rewrite raw jump/loop records into structured regions, in place.
pub fn convert_cf(s: &mut OptSession) {
  let root = s.root;
  convert_cf_node(s, Some(root));
}
