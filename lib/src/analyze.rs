/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Copy propagation and per-variable analysis.
//!
//! `propagate_copy` replaces uses of MOV-defined values with the MOV source
//! directly (merging negate/absolute modifiers, folding constants into
//! operand slots) subject to the hardware operand limits: at most two
//! constant-bank reads per instruction and at most two distinct kcache pairs
//! per four-slot group.  `analyze_vars` classifies variables (inputs, channel
//! pinning, undefined uses), propagates clamp modifiers backwards through
//! copy chains when every consumer tolerates it, and records copy affinities
//! for the coalescer.

use log::debug;

use crate::ast::{NodeSubtype, NodeType, OpClass, OptSession};
use crate::bytecode::{AluSrcSel, CfKind};
use crate::coloring::add_affinity_edge;
use crate::data_structures::{NodeIx, SortedSet, VarIx};
use crate::vars::{regchan_key, AE_COPY_COST};

fn clamp01(f: f32) -> f32 {
  if f < 0.0 {
    0.0
  } else if f > 1.0 {
    1.0
  } else {
    f
  }
}

//=============================================================================
// Copy propagation

/// Try to replace operand `index` of `node` with the source of the MOV `m`.
fn propagate_copy_input(
  s: &mut OptSession, node: NodeIx, index: usize, m: NodeIx,
) -> bool {
  let sv = s.node(m).ins[0];
  let src = s.node(m).alu.as_ref().unwrap().src[0];
  let m_clamp = s.node(m).clamp_dst;

  if s.node(node).is_alu_like() || s.node(node).subtype == NodeSubtype::AluInst
  {
    let node_ref = s.node(node);
    let alu = node_ref.alu.as_ref().unwrap();
    let d = alu.src[index];

    // Constant-bank read port limit: two kcache operands per instruction.
    if sv.is_none() && src.sel.is_kcache() && node_ref.const_ins_count == 2 {
      let mut k = 0;
      for (t, _) in alu.srcs().iter().enumerate() {
        if t == index {
          continue;
        }
        if alu.src[t].sel.is_kcache() {
          k += 1;
          if k == 2 {
            return false;
          }
        }
      }
    }

    let mut nneg = src.neg;
    let mut nabs = src.abs;
    let mut new_sel = src.sel;

    if sv.is_none() && m_clamp {
      match src.sel {
        AluSrcSel::Kcache { .. } => return false,
        _ => {
          // Fold the clamp into the constant itself.
          let val = clamp01(src.const_value().unwrap());
          new_sel = AluSrcSel::Literal(val.to_bits());
          nneg = false;
          nabs = false;
        }
      }
    }

    if d.abs {
      nneg = false;
      nabs = true;
    }
    if d.neg {
      nneg = !nneg;
    }
    if nabs && alu.op.is_op3() {
      return false;
    }

    if let Some(sv) = sv {
      if m_clamp || s.node(node).four_slots {
        return false;
      }
      s.node_mut(node).ins[index] = Some(sv);
      s.var_mut(sv).uses.insert(node);
    } else {
      // Kcache pair limit for four-slot groups: at most two distinct pairs.
      if s.node(node).four_slots && src.sel.is_kcache() {
        let mut csel = SortedSet::<u64>::empty();
        let pair_key = |sel: AluSrcSel, chan: u8| -> u64 {
          match sel {
            AluSrcSel::Kcache { bank, addr } => {
              ((bank as u64) << 40) | ((addr as u64) << 1) | ((chan >> 1) as u64)
            }
            _ => unreachable!(),
          }
        };
        csel.insert(pair_key(src.sel, src.chan));
        for g in group_instructions(s, node) {
          let galu = s.node(g).alu.as_ref().unwrap();
          for gs in galu.srcs() {
            if gs.sel.is_kcache() {
              csel.insert(pair_key(gs.sel, gs.chan));
              if csel.card() > 2 {
                return false;
              }
            }
          }
        }
      }

      {
        let n = s.node_mut(node);
        let alu = n.alu.as_mut().unwrap();
        alu.src[index].sel = new_sel;
        alu.src[index].chan =
          if src.sel.is_kcache() { src.chan } else { 0 };
        n.ins[index] = None;
        n.const_ins_count += 1;
      }
    }

    {
      let n = s.node_mut(node);
      let alu = n.alu.as_mut().unwrap();
      alu.src[index].neg = nneg;
      alu.src[index].abs = nabs;
    }
    return true;
  }

  // Constant folding into export swizzle selects.
  if s.node(node).op_class == OpClass::CfExport {
    if let Some(val) = src.const_value() {
      let bits = val.to_bits();
      if bits == 0.0f32.to_bits() || bits == 1.0f32.to_bits() {
        let swz = if bits == 0.0f32.to_bits() { 4 } else { 5 };
        let n = s.node_mut(node);
        n.ins[index] = None;
        if let Some(CfKind::Export { out, .. }) = &mut n.cf {
          out.swizzle[index] = swz;
        }
      }
    }
    return s.node(node).ins[index].is_none();
  }

  // Same for texture coordinate selects.
  if s.node(node).subtype == NodeSubtype::TexInst {
    if let Some(val) = src.const_value() {
      let bits = val.to_bits();
      if bits == 0.0f32.to_bits() || bits == 1.0f32.to_bits() {
        let swz = if bits == 0.0f32.to_bits() { 4 } else { 5 };
        let n = s.node_mut(node);
        n.ins[index] = None;
        n.tex.as_mut().unwrap().src_sel[index] = swz;
      }
    }
    return s.node(node).ins[index].is_none();
  }

  false
}

/// The four instruction nodes of the four-slot group containing `node`.
fn group_instructions(s: &OptSession, node: NodeIx) -> Vec<NodeIx> {
  debug_assert!(s.node(node).four_slots);
  let mut p = s.node(s.node(node).parent.unwrap()).parent.unwrap();
  while s.node(p).subtype != NodeSubtype::AluGroup {
    p = s.node(p).parent.unwrap();
  }
  let mut insts = vec![];
  let mut l = s.node(p).child;
  while let Some(lx) = l {
    if let Some(c) = s.node(lx).child {
      insts.push(c);
    }
    l = s.node(lx).rest;
  }
  insts
}

fn propagate_copy_node(s: &mut OptSession, node: NodeIx) {
  if !s.node(node).ins.is_empty() && !s.node(node).split_copy {
    let nins = s.node(node).ins.len();
    for q in 0..nins {
      let v = match s.node(node).ins[q] {
        Some(v) if !s.var(v).dead => v,
        _ => continue,
      };

      // Look through live-range split copies to the real source.
      let mut vv = v;
      while let Some(d) = s.var(vv).def {
        if s.node(d).split_copy {
          vv = match s.node(d).ins[0] {
            Some(src) => src,
            None => break,
          };
        } else {
          break;
        }
      }

      if let Some(d) = s.var(vv).def {
        let is_plain_mov = {
          let dn = s.node(d);
          dn.alu.as_ref().map_or(false, |a| {
            a.op == crate::bytecode::AluOp::Mov && !a.op.is_op3()
          }) && !dn.split_copy
        };
        if is_plain_mov && propagate_copy_input(s, node, q, d) {
          s.var_mut(vv).uses.remove(node);
        }
      }
    }
  }

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    propagate_copy_node(s, c);
  }
  if let Some(r) = rest {
    propagate_copy_node(s, r);
  }
}

pub fn propagate_copy(s: &mut OptSession) {
  let root = s.root;
  propagate_copy_node(s, root);
}

//=============================================================================
// Variable analysis

fn check_copy(s: &mut OptSession, v: VarIx) {
  let def = s.var(v).def.unwrap();
  let src = s.node(def).ins[0];

  if let Some(src_v) = src {
    if s.var(src_v).undefined {
      s.var_mut(v).undefined = true;
      s.var_mut(v).value_hint = src;
      return;
    }
  }
  let has_mods = s
    .node(def)
    .alu
    .as_ref()
    .map_or(false, |a| a.src[0].neg || a.src[0].abs);
  if has_mods {
    s.node_mut(def).copy_hint = false;
    s.var_mut(v).value_hint = None;
    return;
  }
  s.var_mut(v).value_hint = src;
}

/// For INTERP_XY the output modifiers of lane y live on lane z, and
/// similarly for the other grouped interpolators; resolve to the lane
/// actually carrying the modifiers.
fn get_real_def_node(s: &OptSession, v: VarIx) -> Option<NodeIx> {
  let d = s.var(v).def?;
  if let Some(alu) = &s.node(d).alu {
    let chan = alu.dst.chan;
    if chan == 1 && alu.op == crate::bytecode::AluOp::InterpXy {
      let next = s.node(s.node(d).parent.unwrap()).rest.unwrap();
      return s.node(next).child;
    } else if chan == 3 && alu.op == crate::bytecode::AluOp::InterpZw {
      let mut p = d;
      for _ in 0..4 {
        p = s.node(p).parent.unwrap();
      }
      return s.node(p).child;
    }
  }
  Some(d)
}

fn propagate_clamp(s: &mut OptSession, v: VarIx) {
  let hint = match s.var(v).value_hint {
    Some(h) => h,
    None => return,
  };
  let vdef = get_real_def_node(s, v);
  let sdef = get_real_def_node(s, hint);
  let mut propagate = false;

  let vdef_clamp = vdef.map_or(false, |d| s.node(d).clamp_dst);
  let sdef_is_alu = sdef.map_or(false, |d| s.node(d).alu.is_some());

  if vdef.is_some() && vdef_clamp && s.var(hint).def.is_some() && sdef_is_alu {
    propagate = true;

    let sdef = sdef.unwrap();
    if !s.node(sdef).clamp_dst {
      debug!("propagate_clamp: checking src usage");
      let uses: Vec<NodeIx> = s.var(hint).uses.iter().copied().collect();
      let vd = s.var(v).def;
      for u in uses {
        if Some(u) == vd {
          continue;
        }
        let un = s.node(u);
        if !un.dead && (!un.copy_hint || !un.clamp_dst) {
          propagate = false;
          break;
        }
      }
      if propagate {
        s.node_mut(sdef).clamp_dst = true;
      }
    }
  }

  // A split copy that cannot pass its clamp backwards drops it; the clamp is
  // already present on the real definition.
  if !propagate {
    if let Some(vdef) = vdef {
      let revert =
        s.node(vdef).split_copy && s.node(s.var(v).def.unwrap()).clamp_dst;
      if revert {
        s.node_mut(vdef).clamp_dst = false;
      }
    }
  }

  if propagate && s.var(hint).value_hint.is_some() {
    propagate_clamp(s, hint);
  }
}

pub fn analyze_vars(s: &mut OptSession) {
  let nvars = s.num_vars();

  // Pass 1: classify inputs, undefined uses, channel pinning; collect value
  // hints for copies.
  for i in 0..nvars {
    let v = VarIx::new(i as u32);
    if s.var(v).special {
      continue;
    }

    if s.var(v).def.is_none() {
      if s.var(v).uses.is_empty() {
        s.prune_var(v);
        continue;
      }

      let reg = s.var(v).reg;
      let is_input = s.last_input_gpr.map_or(false, |last| reg <= last);
      if !is_input {
        debug!("undefined var usage: reg {} chan {}", reg, s.var(v).chan);
        s.var_mut(v).undefined = true;
        continue;
      }

      // Never defined, declared as input: pin to its location.
      let rc = regchan_key(reg, s.var(v).chan as u8);
      {
        let vd = s.var_mut(v);
        vd.pin_chan = true;
        vd.pin_reg = true;
        vd.color = rc;
        vd.fixed = true;
      }
      if rc > s.last_color {
        s.last_color = rc;
      }
      debug!("input mapped: reg {} chan {}", reg, s.var(v).chan);
    } else {
      let def = s.var(v).def.unwrap();
      if s.var(v).dead || s.node(def).dead {
        continue;
      }

      if s.node(def).chan_constraint {
        let replicate = s
          .node(def)
          .alu
          .as_ref()
          .map_or(false, |a| a.op.is_replicate());
        if !replicate {
          s.var_mut(v).pin_chan = true;
        }
      } else {
        let uses: Vec<NodeIx> = s.var(v).uses.iter().copied().collect();
        for u in uses {
          if s.node(u).chan_constraint {
            s.var_mut(v).pin_chan = true;
            break;
          }
        }
      }

      if s.node(def).copy_hint {
        check_copy(s, v);
      }
    }
  }

  // Pass 2: clamp propagation through copy chains.
  for i in 0..nvars {
    let v = VarIx::new(i as u32);
    let def = match s.var(v).def {
      Some(d) => d,
      None => continue,
    };
    if s.var(v).dead || s.node(def).dead {
      continue;
    }
    if s.node(def).copy_hint && s.var(v).value_hint.is_some() {
      propagate_clamp(s, v);
    }
  }

  // Pass 3: reduction-group clamp normalization and hint verification.
  for i in 0..nvars {
    let v = VarIx::new(i as u32);
    let def = match s.var(v).def {
      Some(d) => d,
      None => continue,
    };
    if s.var(v).dead || s.node(def).dead {
      continue;
    }

    let is_reduction =
      s.node(def).alu.as_ref().map_or(false, |a| a.op.is_reduction());
    if is_reduction {
      // Either all four lanes clamp or none do (dead/unwritten lanes don't
      // care).
      let insts = group_instructions(s, def);
      let mut clamps_count = 0;
      for &p in &insts {
        let pn = s.node(p);
        let o = pn.outs[0];
        if pn.clamp_dst || o.is_none() || o.map_or(false, |o| s.var(o).dead) {
          clamps_count += 1;
        }
      }
      for &p in &insts {
        s.node_mut(p).clamp_dst = clamps_count == 4;
      }
    }

    if s.node(def).copy_hint {
      if let Some(hint) = s.var(v).value_hint {
        let vdef = get_real_def_node(s, v);
        let sdef = get_real_def_node(s, hint);
        let vdef_clamp = vdef.map_or(false, |d| s.node(d).clamp_dst);
        let mismatch = match sdef {
          Some(sd) => vdef_clamp != s.node(sd).clamp_dst,
          None => !s.var(hint).undefined && vdef_clamp,
        };
        if mismatch {
          s.var_mut(v).value_hint = None;
          s.node_mut(def).copy_hint = false;
        }
      }
    }
  }

  // Pass 4: copy affinity edges and hint chain collapsing.
  for i in 0..nvars {
    let v = VarIx::new(i as u32);
    let def = match s.var(v).def {
      Some(d) => d,
      None => continue,
    };
    if s.var(v).dead || s.node(def).dead {
      continue;
    }

    if let Some(hint) = s.var(v).value_hint {
      if s.var(v).constraint.is_none() && s.var(hint).constraint.is_none() {
        add_affinity_edge(s, Some(v), Some(hint), AE_COPY_COST);
      }
      if s.node(def).copy_hint {
        s.node_mut(def).subtype = NodeSubtype::Copy;
      }
      while let Some(next) = s.var(s.var(v).value_hint.unwrap()).value_hint {
        s.var_mut(v).value_hint = Some(next);
      }
    }
  }
}
