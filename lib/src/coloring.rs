/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Register allocation: greedy first-fit coloring over the tree, then
//! affinity-chunk coalescing in the style of Hack's SSA register allocation.
//! Move-related variables (split copies, phi webs, plain copies) are linked
//! by weighted affinity edges; edges are processed by descending cost,
//! uniting variables into chunks when no interference results.  Chunks whose
//! members share a register constraint are bundled into groups of up to four
//! and recolored as a unit, trying base registers and channel permutations
//! and keeping the permutation that preserves the most affinity cost.
//!
//! Every speculative recoloring is built on set_color/rollback_colors so a
//! failed attempt restores the exact prior state.

use log::debug;

use crate::ast::{NodeSubtype, OptSession};
use crate::bytecode::MAX_GPRS;
use crate::data_structures::{
  ChunkIx, EdgeIx, GroupIx, NodeIx, SortedSet, UnionFind, VarIx,
};
use crate::vars::{
  color_chan, color_reg, regchan_key, AffinityChunk, AffinityEdge, ChunkGroup,
  Color, AE_CONSTRAINT_COST, AE_CSPLIT_COST, AE_INPUT_COST, AE_PHI_COST,
  AE_SPLIT_COST, MAX_COLOR,
};

//=============================================================================
// Value equality (copies of the same value may share a location)

/// True if the two variables provably hold the same value.
fn value_equal_cb(s: &OptSession, v1: VarIx, v2: VarIx) -> bool {
  if v1 == v2 {
    return true;
  }
  let h1 = s.var(v1).value_hint;
  let h2 = s.var(v2).value_hint;
  h1 == Some(v2) || h2 == Some(v1) || (h1 == h2 && h1.is_some())
}

/// Like `value_equal_cb`, but once either side is fixed the values must also
/// be in the same chunk to be interchangeable.
fn value_equal(s: &OptSession, v1: VarIx, v2: VarIx) -> bool {
  if (s.var(v1).fixed || s.var(v2).fixed) && s.var(v1).chunk != s.var(v2).chunk
  {
    return false;
  }
  value_equal_cb(s, v1, v2)
}

fn interference(s: &OptSession, v1: VarIx, v2: VarIx) -> bool {
  !value_equal_cb(s, v1, v2) && s.var(v1).interferences.contains(v2)
}

fn vec_vars_count(s: &OptSession, comps: &[Option<VarIx>]) -> u64 {
  comps
    .iter()
    .flatten()
    .filter(|&&v| !s.var(v).dead)
    .count() as u64
}

//=============================================================================
// Affinity edges

pub fn add_affinity_edge(
  s: &mut OptSession, v1: Option<VarIx>, v2: Option<VarIx>, cost: u64,
) {
  let (v1, v2) = match (v1, v2) {
    (Some(a), Some(b)) => (a, b),
    _ => return,
  };
  if s.var(v1).dead {
    return;
  }

  let mut cost = cost;
  if let Some(c) = s.var(v1).constraint {
    cost += AE_CONSTRAINT_COST * vec_vars_count(s, &s.constraint(c).comps);
  }
  if let Some(c) = s.var(v2).constraint {
    cost += AE_CONSTRAINT_COST * vec_vars_count(s, &s.constraint(c).comps);
  }
  if s.var(v1).fixed {
    cost += AE_INPUT_COST;
  }
  if s.var(v2).fixed {
    cost += AE_INPUT_COST;
  }

  let e = EdgeIx::new(s.edges.len() as u32);
  s.edges.push(AffinityEdge { cost, v1, v2 });
  s.edge_queue.enqueue(cost, e);
  s.var_mut(v1).aff_edges.insert(e);
  s.var_mut(v2).aff_edges.insert(e);
}

/// Affinity edges from a phi: each operand wants the result's location.
fn build_phi_edges(s: &mut OptSession, node: NodeIx) {
  if s.node(node).dead {
    return;
  }
  let out = s.node(node).outs[0];
  let ins = s.node(node).ins.clone();
  for v in ins.iter().flatten() {
    if s.var(*v).dead {
      continue;
    }
    if s.var(*v).special {
      break;
    }
    add_affinity_edge(s, Some(*v), out, AE_PHI_COST);
  }
}

/// Affinity edge from a live-range split copy: source and destination want
/// to coalesce so the copy disappears.
fn build_split_copy_edge(s: &mut OptSession, node: NodeIx) {
  if s.node(node).dead {
    return;
  }
  let src = s.node(node).ins[0];
  let dst = s.node(node).outs[0];
  if let Some(v) = src {
    if s.var(v).special {
      return;
    }
  }
  let cost =
    if s.node(node).group_split { AE_CSPLIT_COST } else { AE_SPLIT_COST };
  add_affinity_edge(s, src, dst, cost);
}

fn build_affinity_edges(s: &mut OptSession, node: NodeIx) {
  if s.node(node).dead {
    return;
  }
  let (child, rest, phi, loop_phi) = {
    let n = s.node(node);
    (n.child, n.rest, n.phi, n.loop_phi)
  };
  if let Some(c) = child {
    build_affinity_edges(s, c);
  }
  if let Some(r) = rest {
    build_affinity_edges(s, r);
  }
  if let Some(p) = phi {
    build_affinity_edges(s, p);
  }
  if let Some(p) = loop_phi {
    build_affinity_edges(s, p);
  }

  match s.node(node).subtype {
    NodeSubtype::Phi => build_phi_edges(s, node),
    NodeSubtype::Copy if s.node(node).split_copy => {
      build_split_copy_edge(s, node)
    }
    _ => {}
  }
}

//=============================================================================
// Chunk interference

fn chunks_vars_interference(s: &OptSession, c1: ChunkIx, c2: ChunkIx) -> bool {
  for &v1 in s.chunk(c1).vars.iter() {
    for &v2 in s.chunk(c2).vars.iter() {
      if interference(s, v1, v2) {
        return true;
      }
    }
  }
  false
}

/// Can the two sets of constraint-neighbour chunks be mapped onto `ncomp`
/// channels together?  A bounded backtracking search; the component count is
/// at most 4, so the recursion is shallow.
fn chunk_sets_mappable(
  s: &OptSession, mut s1: SortedSet<ChunkIx>, mut s2: SortedSet<ChunkIx>,
  mut ncomp: usize,
) -> bool {
  debug_assert!(s1.card() <= ncomp && s2.card() <= ncomp);

  if s1.card() + s2.card() <= ncomp {
    return true;
  }
  if s1.card() > s2.card() {
    std::mem::swap(&mut s1, &mut s2);
  }

  // Shared chunks occupy one channel on both sides.
  let mut q = 0;
  while q < s1.card() {
    let c = s1.nth(q);
    if s2.contains(c) {
      s1.remove(c);
      s2.remove(c);
      ncomp -= 1;
    } else {
      q += 1;
    }
  }

  if s1.card() == 0 {
    return true;
  }

  let mut max_v = 0usize;
  let mut max_mask = 0u32;
  let mut max_q: Option<ChunkIx> = None;

  let mut q = 0;
  while q < s1.card() {
    let c = s1.nth(q);
    let mut mv = 0usize;
    let mut mask = 0u32;

    for (w, &c2) in s2.iter().enumerate() {
      if chunks_vars_interference(s, c, c2) {
        mask |= 1 << w;
        mv += 1;
      }
    }

    if mv == 0 {
      s1.remove(c);
      continue;
    } else if mv == s2.card() {
      if ncomp > s2.card() {
        s1.remove(c);
        ncomp -= 1;
        continue;
      } else {
        return false;
      }
    } else if mv > max_v {
      max_v = mv;
      max_mask = mask;
      max_q = Some(c);
    }
    q += 1;
  }

  if max_v > 0 {
    let c = max_q.unwrap();
    for (q, &c2) in s2.clone().iter().enumerate() {
      if max_mask & (1 << q) == 0 {
        // Assume c and c2 map to the same channel; check the remainder
        // recursively.  This path is expected to be hit very rarely.
        if s1.card() + s2.card() - 1 <= ncomp {
          return true;
        }
        let mut sn1 = s1.clone();
        let mut sn2 = s2.clone();
        sn1.remove(c);
        sn2.remove(c2);
        if chunk_sets_mappable(s, sn1, sn2, ncomp - 1) {
          return true;
        }
      }
    }
  }
  true
}

fn constraints_compatible(s: &OptSession, v1: VarIx, v2: VarIx) -> bool {
  let mut s1 = SortedSet::<ChunkIx>::empty();
  let mut s2 = SortedSet::<ChunkIx>::empty();

  let c1 = s.var(v1).constraint.unwrap();
  for v in s.constraint(c1).comps.iter().flatten() {
    if let Some(ch) = s.var(*v).chunk {
      if Some(ch) != s.var(v1).chunk {
        s1.insert(ch);
      }
    }
  }
  let c2 = s.var(v2).constraint.unwrap();
  for v in s.constraint(c2).comps.iter().flatten() {
    if let Some(ch) = s.var(*v).chunk {
      if Some(ch) != s.var(v2).chunk {
        s2.insert(ch);
      }
    }
  }

  chunk_sets_mappable(s, s1, s2, 3)
}

fn chunks_interference(s: &OptSession, c1: ChunkIx, c2: ChunkIx) -> bool {
  debug_assert!(c1 != c2);
  if chunks_vars_interference(s, c1, c2) {
    return true;
  }

  for &v1 in s.chunk(c1).vars.iter() {
    if s.var(v1).constraint.is_none() {
      continue;
    }
    for &v2 in s.chunk(c2).vars.iter() {
      if s.var(v2).constraint.is_some() && !constraints_compatible(s, v1, v2) {
        return true;
      }
    }
  }
  false
}

//=============================================================================
// Chunk construction

fn create_var_chunk(s: &mut OptSession, v: VarIx) -> ChunkIx {
  let ix = ChunkIx::new(s.chunks.len() as u32);
  s.chunks.push(AffinityChunk::for_var(v));
  s.var_mut(v).chunk = Some(ix);
  ix
}

/// Merge the chunk of `e.v2` into the chunk of `e.v1`.
fn unify_chunks(s: &mut OptSession, e: EdgeIx) {
  let (v1, v2, cost) = {
    let e = s.edge(e);
    (e.v1, e.v2, e.cost)
  };
  let c1 = s.var(v1).chunk.unwrap();
  let c2 = s.var(v2).chunk.unwrap();

  if c1 != c2 {
    let moved: Vec<VarIx> = s.chunk(c2).vars.iter().copied().collect();
    for v in &moved {
      s.var_mut(*v).chunk = Some(c1);
    }
    let (c2_vars, c2_cost) = {
      let c = s.chunk(c2);
      (c.vars.clone(), c.cost)
    };
    let chunk = s.chunk_mut(c1);
    chunk.vars.add_set(&c2_vars);
    chunk.cost += c2_cost + cost;
    s.chunk_mut(c2).vars.clear();
  } else {
    s.chunk_mut(c1).cost += cost;
  }
}

fn build_chunks(s: &mut OptSession) {
  // Every edge endpoint gets a singleton chunk first.
  for q in (0..s.edge_queue.card()).rev() {
    let (_, e) = s.edge_queue.nth(q);
    let (v1, v2) = {
      let e = s.edge(e);
      (e.v1, e.v2)
    };
    if s.var(v1).chunk.is_none() {
      create_var_chunk(s, v1);
    }
    if s.var(v2).chunk.is_none() {
      create_var_chunk(s, v2);
    }
  }

  // Process edges from most to least expensive, merging whenever the union
  // stays interference-free.  The union-find mirrors chunk membership and
  // answers the same-class question cheaply.
  let mut uf = UnionFind::<VarIx>::new(s.num_vars());
  for c in &s.chunks {
    let mut it = c.vars.iter();
    if let Some(&first) = it.next() {
      for &v in it {
        uf.union(first, v);
      }
    }
  }

  for q in (0..s.edge_queue.card()).rev() {
    let (_, e) = s.edge_queue.nth(q);
    let (v1, v2, _) = {
      let ed = s.edge(e);
      (ed.v1, ed.v2, ed.cost)
    };
    let c1 = s.var(v1).chunk.unwrap();
    let c2 = s.var(v2).chunk.unwrap();
    if uf.in_same_class(v1, v2) {
      debug_assert!(c1 == c2);
      let cost = s.edge(e).cost;
      s.chunk_mut(c1).cost += cost;
    } else if !chunks_interference(s, c1, c2) {
      uf.union(v1, v2);
      unify_chunks(s, e);
    }
  }
}

fn build_chunks_queue(s: &mut OptSession) {
  let mut chunks = SortedSet::<ChunkIx>::empty();

  for i in 0..s.num_vars() {
    let v = VarIx::new(i as u32);
    if let Some(c) = s.var(v).chunk {
      if chunks.insert(c) {
        let cost = s.chunk(c).cost;
        s.chunk_queue.enqueue(cost, c);
      }
    }
  }

  // Bundle chunks that share a register constraint into groups of up to
  // four, anchored at the constrained variable with the most affinity cost
  // at stake.
  for q in (0..s.chunk_queue.card()).rev() {
    let (_, c) = s.chunk_queue.nth(q);
    if s.chunk(c).group.is_some() {
      continue;
    }

    let mut max_v: Option<VarIx> = None;
    let mut max_constraint_cost: i64 = -1;

    for &v in s.chunk(c).vars.clone().iter() {
      if let Some(rc) = s.var(v).constraint {
        let mut constraint_cost: i64 = 0;
        for v2 in s.constraint(rc).comps.iter().flatten() {
          if let Some(ch) = s.var(*v2).chunk {
            if s.chunk(ch).group.is_none() {
              constraint_cost += s.chunk(ch).cost as i64;
            }
          }
        }
        if constraint_cost > max_constraint_cost {
          max_constraint_cost = constraint_cost;
          max_v = Some(v);
        }
      }
    }

    let g = GroupIx::new(s.groups.len() as u32);
    if let Some(max_v) = max_v {
      let rc = s.var(max_v).constraint.unwrap();
      let comps = s.constraint(rc).comps.clone();
      let mut member_chunks: Vec<ChunkIx> = vec![];
      let mut cost = 0u64;
      for v2 in comps.iter().flatten() {
        if let Some(ch) = s.var(*v2).chunk {
          if chunks.remove(ch) && !member_chunks.contains(&ch) {
            member_chunks.push(ch);
            cost += s.chunk(ch).cost;
          }
        }
      }
      for &ch in &member_chunks {
        s.chunk_mut(ch).group = Some(g);
      }
      s.groups.push(ChunkGroup { chunks: member_chunks, cost });
    } else {
      chunks.remove(c);
      s.chunk_mut(c).group = Some(g);
      let cost = s.chunk(c).cost;
      s.groups.push(ChunkGroup { chunks: vec![c], cost });
    }
    let cost = s.group(g).cost;
    s.chunk_groups.enqueue(cost, g);
  }
}

fn build_affinity_chunks(s: &mut OptSession) {
  let root = s.root;
  build_affinity_edges(s, root);

  for (cost, e) in s.edge_queue.clone().iter() {
    let ed = s.edge(e);
    debug!("aff ({}) {:?} <=> {:?}", cost, ed.v1, ed.v2);
  }

  build_chunks(s);
  build_chunks_queue(s);
}

//=============================================================================
// Coloring primitives

fn update_last_color(s: &mut OptSession, color: Color) {
  if s.enable_last_color_update && color > s.last_color {
    s.last_color = color;
  }
}

fn fix_var_color(s: &mut OptSession, v: VarIx, fixed: bool) {
  if s.var(v).fixed == fixed {
    return;
  }
  if let Some(rc) = s.var(v).constraint {
    if fixed {
      let v_color = s.var(v).color;
      let c = s.constraint_mut(rc);
      if c.fixed == 0 {
        c.r_color = (v_color - 1) / 4 + 1;
      }
      c.fixed += 1;
    } else {
      s.constraint_mut(rc).fixed -= 1;
    }
  }
  s.var_mut(v).fixed = fixed;
}

fn set_color(
  s: &mut OptSession, v: VarIx, color: Color, recolored: &mut SortedSet<VarIx>,
) {
  let cur = s.var(v).color;
  s.var_mut(v).saved_color = cur;
  recolored.insert(v);
  s.var_mut(v).color = color;
  fix_var_color(s, v, true);
}

fn rollback_colors(s: &mut OptSession, recolored: &mut SortedSet<VarIx>) {
  for &n in recolored.clone().iter() {
    let saved = s.var(n).saved_color;
    s.var_mut(n).color = saved;
    fix_var_color(s, n, false);
  }
  recolored.clear();
}

/// Lowest free (reg, chan) for `v`, consistent with its channel pin and its
/// already-colored interference neighbours.
fn get_unique_color(s: &OptSession, v: VarIx) -> Color {
  let mut color_start: Color = 1;
  let mut color_step: Color = 1;
  let last_color: Color = (MAX_GPRS - s.temp_gprs) * 4;

  if s.var(v).pin_chan {
    color_start += s.var(v).chan as Color;
    color_step = 4;
  }

  // Availability bitmap over the whole register file.
  let mut avail = [!0u64; 8];
  for &n in s.var(v).interferences.iter() {
    let nc = s.var(n).color;
    if nc > 0
      && (color_step == 1 || color_chan(nc) == color_chan(color_start))
      && !value_equal(s, v, n)
      && nc as usize <= 512
    {
      let bit = (nc - 1) as usize;
      avail[bit >> 6] &= !(1u64 << (bit & 63));
    }
  }

  let mut color = color_start;
  while color < last_color {
    let bit = (color - 1) as usize;
    if avail[bit >> 6] & (1u64 << (bit & 63)) != 0 {
      break;
    }
    color += color_step;
  }
  color
}

/// Pick a channel inside the fixed register of `v`'s constraint; 0 if all
/// channels are taken.
fn choose_color_constrained(s: &OptSession, v: VarIx) -> Color {
  let rc_ix = s.var(v).constraint.unwrap();
  let rc = s.constraint(rc_ix);

  for q in 0..4u32 {
    let color = (rc.r_color - 1) * 4 + 1 + q;

    if s.var(v).pin_chan && color_chan(color) != s.var(v).chan as u8 {
      continue;
    }

    let mut used = false;
    for c in rc.comps.iter().flatten() {
      let cv = s.var(*c);
      if cv.fixed && cv.color == color && !value_equal(s, *c, v) {
        used = true;
        break;
      }
    }
    if !used {
      for &c in s.var(v).interferences.iter() {
        let cv = s.var(c);
        if cv.fixed && cv.color == color && !value_equal(s, v, c) {
          used = true;
          break;
        }
      }
    }
    if !used {
      return color;
    }
  }
  0
}

/// Move `v` away from `color`, displacing its own neighbours recursively.
/// All changes are recorded in `recolored` for exact rollback by the caller.
fn avoid_color(
  s: &mut OptSession, v: VarIx, color: Color,
  recolored: &mut SortedSet<VarIx>, unfix: bool,
) -> bool {
  if s.var(v).fixed {
    return false;
  }

  let constrained_fixed = s
    .var(v)
    .constraint
    .map_or(false, |rc| s.constraint(rc).fixed > 0);
  let new_color = if constrained_fixed {
    choose_color_constrained(s, v)
  } else {
    get_unique_color(s, v)
  };
  if new_color == 0 {
    return false;
  }

  set_color(s, v, new_color, recolored);

  let mut result = true;
  for &n in s.var(v).interferences.clone().iter() {
    let collides = {
      let nd = s.var(n);
      nd.color == new_color
        && (nd.constraint.is_none() || nd.constraint != s.var(v).constraint)
    };
    if collides && !value_equal(s, n, v) {
      if !avoid_color(s, n, new_color, recolored, true) {
        result = false;
        break;
      }
    }
  }

  if result {
    update_last_color(s, color);
  }
  if unfix {
    fix_var_color(s, v, false);
  }
  result
}

/// Try to give `v` exactly `color`, displacing interfering neighbours if
/// needed.  On failure everything is rolled back.
fn recolor_var(s: &mut OptSession, v: VarIx, color: Color) -> bool {
  let mut recolored = SortedSet::<VarIx>::empty();
  let mut result = true;

  if !s.var(v).fixed {
    if s.var(v).pin_chan && color % 4 != s.var(v).color % 4 {
      result = false;
    }

    if result {
      if let Some(rc) = s.var(v).constraint {
        let c = s.constraint(rc);
        if c.fixed > 0 && c.r_color != (color - 1) / 4 + 1 {
          result = false;
        }
      }
    }

    // Bank-swizzle constraint: at most three distinct fixed values per
    // channel within a four-slot group.
    if result {
      if let Some(bs) = s.var(v).bs_constraint {
        let comps = s.constraint(bs).comps.clone();
        let mut cc = 0;
        for v2 in comps.iter().flatten() {
          if *v2 != v
            && s.var(*v2).color != 0
            && color_chan(s.var(*v2).color) == color_chan(color)
            && s.var(*v2).fixed
            && !value_equal(s, v, *v2)
          {
            if cc < 2 {
              cc += 1;
            } else {
              result = false;
              break;
            }
          }
        }
      }
    }

    if result {
      set_color(s, v, color, &mut recolored);

      if let Some(rc) = s.var(v).constraint {
        let comps = s.constraint(rc).comps.clone();
        for n in comps.iter().flatten() {
          let skip = {
            let nd = s.var(*n);
            nd.dead || nd.fixed
          };
          if skip || value_equal(s, *n, v) {
            continue;
          }
          if !avoid_color(s, *n, color, &mut recolored, false) {
            rollback_colors(s, &mut recolored);
            result = false;
            break;
          }
        }
      }

      if result {
        for &n in s.var(v).interferences.clone().iter() {
          if !value_equal(s, n, v)
            && s.var(n).color == color
            && !avoid_color(s, n, color, &mut recolored, true)
          {
            rollback_colors(s, &mut recolored);
            result = false;
            break;
          }
        }
      }
    }
  } else if s.var(v).color != color {
    result = false;
  }

  // Leave the colors in place but release the fixing done along the way.
  for &n in recolored.clone().iter() {
    fix_var_color(s, n, false);
  }

  if result {
    update_last_color(s, color);
  }
  result
}

//=============================================================================
// Affine subsets: when a chunk cannot be recolored whole, keep the connected
// subset preserving the most affinity cost and split the rest off.

fn get_affine_subset(
  s: &OptSession, colored: &mut SortedSet<VarIx>, v: VarIx,
  cset: &mut SortedSet<VarIx>,
) -> u64 {
  let mut cost = 0u64;
  let mut new_vars = SortedSet::<VarIx>::empty();
  let mut next_vars = SortedSet::<VarIx>::empty();
  let mut edges = SortedSet::<EdgeIx>::empty();

  cset.clear();
  new_vars.insert(v);
  colored.remove(v);

  loop {
    for &nv in new_vars.clone().iter() {
      for &e in s.var(nv).aff_edges.iter() {
        let ed = s.edge(e);
        let other = if ed.v1 == nv { ed.v2 } else { ed.v1 };
        if colored.remove(other) {
          next_vars.insert(other);
          if edges.insert(e) {
            cost += ed.cost;
          }
        }
      }
    }

    cset.add_set(&new_vars);
    new_vars.copy_from(&next_vars);
    next_vars.clear();

    if new_vars.is_empty() {
      break;
    }
  }
  cost
}

fn get_best_affine_subset(
  s: &OptSession, colored: &mut SortedSet<VarIx>,
  clr_best: &mut SortedSet<VarIx>,
) -> i64 {
  let mut best_cost: i64 = -1;
  let mut cset = SortedSet::<VarIx>::empty();
  clr_best.clear();

  while !colored.is_empty() {
    let v = colored.nth(0);
    let cost = get_affine_subset(s, colored, v, &mut cset) as i64;
    if cost > best_cost {
      best_cost = cost;
      clr_best.copy_from(&cset);
    }
  }
  best_cost
}

fn recalc_chunk_cost(s: &OptSession, chunk: ChunkIx) -> u64 {
  let vars = &s.chunk(chunk).vars;
  if vars.card() <= 1 {
    return 0;
  }
  let mut cost = 0;
  for (_, e) in s.edge_queue.iter() {
    let ed = s.edge(e);
    if vars.contains(ed.v1) && vars.contains(ed.v2) {
      cost += ed.cost;
    }
  }
  cost
}

//=============================================================================
// Chunk group recoloring

struct RcgCtx {
  group: GroupIx,
  chan: [i32; 4],
  new_chan: [i32; 4],
  ccost: [i64; 4],
  base_reg: u32,
}

/// Next combination of channels for the group's chunks.
fn rcg_next_channels(x: &mut RcgCtx, count: usize) -> bool {
  let mut free_chans: u32 = !0;
  if count < 4 {
    for q in 0..count {
      free_chans &= !(1 << x.new_chan[q]);
    }
  } else {
    free_chans &= !0b1111;
  }

  let mut q = count as i32 - 1;
  loop {
    let cur_chan = x.new_chan[q as usize];
    let new_chan =
      (free_chans >> (cur_chan + 1)).trailing_zeros() as i32 + cur_chan + 1;

    free_chans |= 1 << cur_chan;

    if new_chan < 4 {
      free_chans &= !(1 << new_chan);
      x.new_chan[q as usize] = new_chan;
      break;
    }
    if q == 0 {
      return false;
    }
    q -= 1;
  }

  let mut q = q + 1;
  while (q as usize) < count {
    let new_chan = free_chans.trailing_zeros() as i32;
    debug_assert!(new_chan < 4);
    free_chans &= !(1 << new_chan);
    x.new_chan[q as usize] = new_chan;
    q += 1;
  }
  true
}

fn rcg_color_chunk(
  s: &mut OptSession, x: &mut RcgCtx, chunk_index: usize, is_final: bool,
) {
  let chunk = s.group(x.group).chunks[chunk_index];
  let color = regchan_key(x.base_reg, x.new_chan[chunk_index] as u8);
  let chunk_vars: Vec<VarIx> = s.chunk(chunk).vars.iter().copied().collect();

  for &v in &chunk_vars {
    if !s.var(v).pin_reg {
      fix_var_color(s, v, false);
    }
  }

  let mut colored = SortedSet::<VarIx>::empty();
  for &v in &chunk_vars {
    if recolor_var(s, v, color) {
      colored.insert(v);
    }
  }

  let mut clr_best = SortedSet::<VarIx>::empty();
  let cur_cost: i64;
  if colored.card() == chunk_vars.len() {
    cur_cost = s.chunk(chunk).cost as i64;
    clr_best.copy_from(&colored);
  } else {
    cur_cost = get_best_affine_subset(s, &mut colored, &mut clr_best);
  }

  x.ccost[chunk_index] = cur_cost;

  if is_final {
    if clr_best.is_empty() {
      debug!("unable to recolor chunk {:?}, discarding", chunk);
      return;
    }

    for &v in clr_best.clone().iter() {
      recolor_var(s, v, color);
      fix_var_color(s, v, true);
    }

    // Split the part that couldn't join into a fresh chunk and requeue it.
    let mut rest = s.chunk(chunk).vars.clone();
    rest.remove_set(&clr_best);

    if !rest.is_empty() {
      let rest_chunk = ChunkIx::new(s.chunks.len() as u32);
      s.chunks.push(AffinityChunk {
        vars: rest.clone(),
        cost: 0,
        group: None,
        local: false,
      });

      s.chunk_mut(chunk).cost = cur_cost as u64;
      let best = clr_best.clone();
      s.chunk_mut(chunk).vars.copy_from(&best);

      for &v in rest.iter() {
        s.var_mut(v).chunk = Some(rest_chunk);
      }

      let rest_cost = recalc_chunk_cost(s, rest_chunk);
      s.chunk_mut(rest_chunk).cost = rest_cost;
      s.chunk_queue.enqueue(rest_cost, rest_chunk);

      let g = GroupIx::new(s.groups.len() as u32);
      s.groups.push(ChunkGroup { chunks: vec![rest_chunk], cost: rest_cost });
      s.chunk_mut(rest_chunk).group = Some(g);
      s.chunk_groups.enqueue(rest_cost, g);
    }
  }
}

fn recolor_chunk_group(s: &mut OptSession, group: GroupIx) {
  let count = s.group(group).chunks.len();
  let mut best_total_cost: i64 = -1;
  let mut best_color: [Color; 4] = [0; 4];
  let mut completed = false;

  let last_reg =
    (s.last_color / 4 + 2).min(MAX_GPRS - 1 - s.temp_gprs);
  debug_assert!(count <= 4);

  let mut x = RcgCtx {
    group,
    chan: [-1; 4],
    new_chan: [0; 4],
    ccost: [0; 4],
    base_reg: 0,
  };

  s.enable_last_color_update = false;

  let group_cost = s.group(group).cost as i64;

  for base_reg in 0..last_reg {
    if completed {
      break;
    }
    x.base_reg = base_reg;
    for q in 0..count {
      x.chan[q] = -1;
      x.new_chan[q] = q as i32;
    }

    loop {
      let mut total_cost: i64 = 0;
      for q in 0..count {
        if x.new_chan[q] != x.chan[q] {
          rcg_color_chunk(s, &mut x, q, false);
          x.chan[q] = x.new_chan[q];
        }
        total_cost += x.ccost[q];
      }

      if total_cost == group_cost {
        // All chunks fully colored; no better outcome exists.
        completed = true;
      }
      if total_cost > best_total_cost {
        for q in 0..count {
          best_color[q] = regchan_key(base_reg, x.new_chan[q] as u8);
        }
        best_total_cost = total_cost;
      }

      if completed || !rcg_next_channels(&mut x, count) {
        break;
      }
    }
  }

  s.enable_last_color_update = true;
  if best_total_cost < 0 {
    // Nothing in the group could be recolored anywhere; leave the initial
    // coloring in place.
    debug!("unable to recolor group {:?}, discarding", group);
    return;
  }

  x.base_reg = color_reg(best_color[0]);

  for q in 0..count {
    x.new_chan[q] = (best_color[q] - 1 - (x.base_reg << 2)) as i32;
    rcg_color_chunk(s, &mut x, q, true);
  }
}

fn recolor_chunk_groups(s: &mut OptSession) {
  while let Some(g) = s.chunk_groups.dequeue() {
    recolor_chunk_group(s, g);
  }
}

pub fn coalesce(s: &mut OptSession) {
  build_affinity_chunks(s);
  recolor_chunk_groups(s);
  debug!("coalesce done");
}

//=============================================================================
// Initial coloring

fn color_node(s: &mut OptSession, node: NodeIx) {
  if s.node(node).dead {
    return;
  }

  if let Some(p) = s.node(node).loop_phi {
    color_node(s, p);
  }

  let outs = s.node(node).outs.clone();
  for v in outs.iter().flatten() {
    let skip = {
      let vd = s.var(*v);
      vd.dead || vd.special
    };
    if skip {
      continue;
    }
    if s.var(*v).color == 0 {
      let c = get_unique_color(s, *v);
      s.var_mut(*v).color = c;
    }
    let c = s.var(*v).color;
    update_last_color(s, c);
  }

  let (child, rest, phi) = {
    let n = s.node(node);
    (n.child, n.rest, n.phi)
  };
  if let Some(c) = child {
    color_node(s, c);
  }
  if let Some(r) = rest {
    color_node(s, r);
  }
  if let Some(p) = phi {
    color_node(s, p);
  }
}

/// Initial coloring; refined later by coalescing and then by the scheduler.
pub fn color(s: &mut OptSession) {
  let root = s.root;
  color_node(s, root);
}

//=============================================================================
// Local recoloring, used by the clause scheduler

fn add_neighbour_colors(
  s: &OptSession, colors: &mut SortedSet<Color>, vars: &SortedSet<VarIx>,
  v: VarIx,
) {
  for &v2 in vars.iter() {
    if s.var(v2).fixed && !value_equal(s, v2, v) {
      colors.insert(s.var(v2).color);
    }
  }
}

/// Recolor a clause-local variable (or its whole local chunk) to any free
/// color in its channel.
pub fn recolor_local(s: &mut OptSession, v: VarIx) -> bool {
  if s.var(v).dead {
    s.var_mut(v).color = 0;
    return true;
  }

  let mut colors = SortedSet::<Color>::empty();
  let color_step = 4;
  let mut color: Color = 1 + color_chan(s.var(v).color) as Color;

  if let Some(chunk) = s.var(v).chunk {
    debug_assert!(s.chunk(chunk).local);
    for &n in s.chunk(chunk).vars.clone().iter() {
      let intf = s.var(n).interferences.clone();
      add_neighbour_colors(s, &mut colors, &intf, v);
    }
  } else {
    let intf = s.var(v).interferences.clone();
    add_neighbour_colors(s, &mut colors, &intf, v);
  }

  let mut result = false;
  while color <= MAX_COLOR {
    if !colors.contains(color) {
      result = true;
      break;
    }
    color += color_step;
  }

  if result {
    debug_assert!(color_chan(s.var(v).color) == color_chan(color));
    if let Some(chunk) = s.var(v).chunk {
      for &n in s.chunk(chunk).vars.clone().iter() {
        s.var_mut(n).color = color;
        s.var_mut(n).fixed = true;
        debug!("recolored local {:?} @ {}", n, color);
      }
    } else {
      s.var_mut(v).color = color;
      s.var_mut(v).fixed = true;
      debug!("recolored local {:?} @ {}", v, color);
    }
  }
  result
}

//=============================================================================
// Post-allocation verification

fn phis_coalesced(s: &OptSession, mut list: Option<NodeIx>) -> bool {
  let mut ok = true;
  while let Some(lx) = list {
    if let Some(phi) = s.node(lx).child {
      if !s.node(phi).dead {
        if let Some(o) = s.node(phi).outs[0] {
          let od = s.var(o);
          if !od.dead && !od.special {
            for i in s.node(phi).ins.iter().flatten() {
              let id = s.var(*i);
              if id.undefined || id.special {
                continue;
              }
              if id.color != od.color {
                debug!("uncoalesced phi: {:?} <= {:?}", o, i);
                ok = false;
              }
            }
          }
        }
      }
    }
    list = s.node(lx).rest;
  }
  ok
}

fn insert_copies_node(s: &OptSession, node: NodeIx) -> bool {
  if s.node(node).dead {
    return true;
  }
  let mut r = true;

  if let Some(phi) = s.node(node).phi {
    r &= phis_coalesced(s, Some(phi));
  }
  if let Some(phi) = s.node(node).loop_phi {
    r &= phis_coalesced(s, Some(phi));
  }

  if let Some(c) = s.node(node).child {
    r &= insert_copies_node(s, c);
  }
  if let Some(rest) = s.node(node).rest {
    r &= insert_copies_node(s, rest);
  }
  r
}

/// Check that every phi web was coalesced into one location.  Inserting the
/// copies that would make an uncoalesced phi executable is not implemented;
/// returning false makes the caller fall back to the unoptimized bytecode.
pub fn insert_copies(s: &mut OptSession) -> bool {
  let root = s.root;
  insert_copies_node(s, root)
}

//=============================================================================
// Tests

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ast::OptSession;
  use crate::bytecode::IsaCaps;

  fn session_with_vars(n: usize) -> (OptSession, Vec<VarIx>) {
    let mut s = OptSession::new(IsaCaps::five_slot(), None);
    let vars = (0..n).map(|i| s.get_var(i as u32, 0, 1)).collect();
    (s, vars)
  }

  #[test]
  fn unique_color_avoids_interferences() {
    let (mut s, v) = session_with_vars(3);
    s.var_mut(v[0]).color = regchan_key(0, 0);
    s.var_mut(v[1]).color = regchan_key(0, 1);
    s.var_mut(v[2]).interferences.insert(v[0]);
    s.var_mut(v[2]).interferences.insert(v[1]);
    let c = get_unique_color(&s, v[2]);
    assert_eq!(c, regchan_key(0, 2));
  }

  #[test]
  fn unique_color_respects_chan_pin() {
    let (mut s, v) = session_with_vars(2);
    s.var_mut(v[0]).color = regchan_key(0, 2);
    {
      let vd = s.var_mut(v[1]);
      vd.pin_chan = true;
      vd.chan = 2;
    }
    s.var_mut(v[1]).interferences.insert(v[0]);
    let c = get_unique_color(&s, v[1]);
    assert_eq!(c, regchan_key(1, 2));
  }

  #[test]
  fn recolor_var_displaces_and_rolls_back() {
    let (mut s, v) = session_with_vars(2);
    s.var_mut(v[0]).color = regchan_key(0, 0);
    s.var_mut(v[1]).color = regchan_key(1, 0);
    s.var_mut(v[0]).interferences.insert(v[1]);
    s.var_mut(v[1]).interferences.insert(v[0]);

    // Moving v1 onto v0's color displaces v0.
    assert!(recolor_var(&mut s, v[1], regchan_key(0, 0)));
    assert_eq!(s.var(v[1]).color, regchan_key(0, 0));
    assert_ne!(s.var(v[0]).color, regchan_key(0, 0));

    // A fixed occupant can't be displaced and the attempt is rolled back.
    let (mut s, v) = session_with_vars(2);
    s.var_mut(v[0]).color = regchan_key(0, 0);
    s.var_mut(v[0]).fixed = true;
    s.var_mut(v[1]).color = regchan_key(1, 0);
    s.var_mut(v[0]).interferences.insert(v[1]);
    s.var_mut(v[1]).interferences.insert(v[0]);
    assert!(!recolor_var(&mut s, v[1], regchan_key(0, 0)));
    assert_eq!(s.var(v[1]).color, regchan_key(1, 0));
    assert_eq!(s.var(v[0]).color, regchan_key(0, 0));
  }

  #[test]
  fn rcg_channel_permutations() {
    let mut x = RcgCtx {
      group: GroupIx::new(0),
      chan: [-1; 4],
      new_chan: [0, 1, 2, 3],
      ccost: [0; 4],
      base_reg: 0,
    };
    // For 4 chunks there are 4! = 24 permutations; we start at one and must
    // enumerate the other 23.
    let mut seen = vec![x.new_chan];
    while rcg_next_channels(&mut x, 4) {
      assert!(!seen.contains(&x.new_chan));
      seen.push(x.new_chan);
    }
    assert_eq!(seen.len(), 24);

    // For 2 chunks: 4*3 = 12 ordered pairs.
    let mut x = RcgCtx {
      group: GroupIx::new(0),
      chan: [-1; 4],
      new_chan: [0, 1, 0, 0],
      ccost: [0; 4],
      base_reg: 0,
    };
    let mut count = 1;
    while rcg_next_channels(&mut x, 2) {
      count += 1;
    }
    assert_eq!(count, 12);
  }
}
