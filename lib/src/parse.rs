/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! First pass: walk the flat record stream once and build one op/group node
//! per record.  ALU clauses are expanded into per-instruction nodes grouped
//! by the hardware's dual-issue-cycle model (PV/PS operands resolve to the
//! previous cycle's slot outputs); four-slot reduction/interp instructions
//! stay together in a group node.  Live intervals of fetch/export operands
//! and of four-slot group operands are split with explicit copy nodes here,
//! because those instructions constrain how their operands may be packed.
//!
//! Any use of relative addressing makes the whole shader unsupported; that is
//! reported as a skip code, never a crash.

use log::debug;

use crate::ast::{AluSlots, NodeSubtype, NodeType, OpClass, OptSession};
use crate::bytecode::{
  AluOp, AluRecord, AluSrcSel, CfKind, CfRecord, OutputRecord, TexRecord,
  VtxRecord, MAX_GPRS,
};
use crate::data_structures::{NodeIx, SortedMap, VarIx};
use crate::interface::OptError;
use crate::vars::{REG_AM, REG_AR, REG_GR, REG_PR};

//=============================================================================
// Copy nodes

/// Build a MOV-like copy node `dst <- src` used for live interval splitting.
pub fn create_alu_copy(s: &mut OptSession, dst: VarIx, src: VarIx) -> NodeIx {
  let n = s.new_node(NodeType::Op);
  {
    let node = s.node_mut(n);
    node.subtype = NodeSubtype::Copy;
    node.copy_hint = true;
    node.split_copy = true;
    node.alu_allowed_slots = AluSlots::Any;
    node.ins = vec![Some(src)].into();
    node.outs = vec![Some(dst)].into();
    node.alu = Some(AluRecord::new(
      AluOp::Mov,
      crate::bytecode::AluDst { gpr: 0, chan: 0, write: true, clamp: false, rel: false },
      &[crate::bytecode::AluSrc::gpr(0, 0)],
    ));
  }
  n
}

//=============================================================================
// Register constraints

/// Attach a register constraint over a node's distinct input or output
/// variables (all of them must land in channels of one GPR).
pub fn set_constraint(s: &mut OptSession, node: NodeIx, inputs: bool) {
  let vv = if inputs {
    s.node(node).ins.clone()
  } else {
    s.node(node).outs.clone()
  };
  if vv.len() <= 1 {
    return;
  }
  let count = vv.len().min(4);
  let mut vars = crate::data_structures::SortedSet::<VarIx>::empty();
  for v in vv[..count].iter().flatten() {
    vars.insert(*v);
  }
  if vars.card() <= 1 {
    return;
  }
  let comps: Vec<Option<VarIx>> = vars.iter().map(|v| Some(*v)).collect();
  s.add_constraint(comps, false);
}

//=============================================================================
// Live interval splitting for non-ALU instructions

/// Replace the variables of `vv` (an operand vector of a fetch/export node)
/// with fresh temporaries and return a small clause of copies between them,
/// or None when there is nothing to split.
fn build_split(
  s: &mut OptSession, node: NodeIx, outs: bool,
) -> Option<NodeIx> {
  let vv = if outs { s.node(node).outs.clone() } else { s.node(node).ins.clone() };
  // More than 4 operand slots can occur with gradients; the extra slots hold
  // special vars which need no splitting.
  let count = vv.len().min(4);
  if count <= 1 {
    return None;
  }

  let mut vm = SortedMap::<VarIx, VarIx>::empty();
  let mut g: Option<NodeIx> = None;
  let mut l: Option<NodeIx> = None;
  let mut last_copy: Option<NodeIx> = None;
  let mut new_vv = vv.clone();

  for (q, slot) in vv[..count].iter().enumerate() {
    let v = match slot {
      Some(v) => *v,
      None => continue,
    };
    if let Some(t) = vm.get(v) {
      new_vv[q] = Some(t);
      continue;
    }

    let t = s.create_temp_var();
    s.var_mut(t).chan = s.var(v).chan;
    vm.set(v, t);
    new_vv[q] = Some(t);

    let list = match l {
      None => {
        let group = s.new_node(NodeType::Group);
        s.node_mut(group).subtype = NodeSubtype::AluClause;
        let list = s.start_list(group);
        g = Some(group);
        list
      }
      Some(prev) => s.append_list(prev),
    };
    l = Some(list);

    let copy =
      if outs { create_alu_copy(s, v, t) } else { create_alu_copy(s, t, v) };
    s.set_child(list, copy);
    last_copy = Some(copy);
  }

  if let Some(copy) = last_copy {
    s.node_mut(copy).alu.as_mut().unwrap().last = true;
  }

  if outs {
    s.node_mut(node).outs = new_vv;
  } else {
    s.node_mut(node).ins = new_vv;
  }
  g
}

//=============================================================================
// Fetch clauses

fn parse_cf_tex(
  s: &mut OptSession, node: NodeIx, fetches: &[TexRecord],
) -> Result<(), OptError> {
  let mut cl: Option<NodeIx> = None;

  for tex in fetches {
    if tex.dst_rel || tex.src_rel {
      return Err(OptError::UnsupportedRelAddr);
    }

    let tn = s.new_node(NodeType::Op);
    s.node_mut(tn).subtype = NodeSubtype::TexInst;

    let list = match cl {
      None => s.start_list(node),
      Some(prev) => s.append_list(prev),
    };
    cl = Some(list);

    let uses_grad = tex.op.uses_gradients();
    let sets_grad_h = tex.op == crate::bytecode::TexOp::SetGradientsH;
    let sets_grad_v = tex.op == crate::bytecode::TexOp::SetGradientsV;

    let mut ins: Vec<Option<VarIx>> = Vec::with_capacity(6);
    for q in 0..4 {
      ins.push(if tex.src_sel[q] < 4 {
        Some(s.get_var(tex.src_gpr, tex.src_sel[q] as i8, 0))
      } else {
        None
      });
    }
    if uses_grad {
      ins.push(Some(s.get_var(REG_GR, 0, 0)));
      ins.push(Some(s.get_var(REG_GR, 1, 0)));
    }

    let mut outs: Vec<Option<VarIx>> = Vec::with_capacity(5);
    for q in 0..4 {
      outs.push(if tex.dst_sel[q] < 4 {
        Some(s.get_var(tex.dst_gpr, tex.dst_sel[q] as i8, 0))
      } else {
        None
      });
    }
    if sets_grad_v {
      outs.push(Some(s.get_var(REG_GR, 0, 0)));
    }
    if sets_grad_h {
      outs.push(Some(s.get_var(REG_GR, 1, 0)));
    }

    let am = s.get_var(REG_AM, 0, 0);
    {
      let n = s.node_mut(tn);
      n.tex = Some(tex.clone());
      n.ins = ins.into();
      n.outs = outs.into();
      n.reg_constraint = true;
      n.keep_alive = sets_grad_h || sets_grad_v;
      n.flow_dep = Some(am);
    }

    // Split operand live intervals around the fetch.
    if let Some(split) = build_split(s, tn, false) {
      let list = cl.unwrap();
      s.set_child(list, split);
      cl = Some(s.append_list(list));
    }

    s.set_child(cl.unwrap(), tn);

    if let Some(split) = build_split(s, tn, true) {
      let list = s.append_list(cl.unwrap());
      s.set_child(list, split);
      cl = Some(list);
    }
  }
  Ok(())
}

fn parse_cf_vtx(
  s: &mut OptSession, node: NodeIx, fetches: &[VtxRecord],
) -> Result<(), OptError> {
  let mut cl: Option<NodeIx> = None;

  for vtx in fetches {
    if vtx.src_rel {
      return Err(OptError::UnsupportedRelAddr);
    }

    let tn = s.new_node(NodeType::Op);
    s.node_mut(tn).subtype = NodeSubtype::VtxInst;

    let list = match cl {
      None => s.start_list(node),
      Some(prev) => s.append_list(prev),
    };
    cl = Some(list);

    let ins = vec![if vtx.src_sel_x < 4 {
      Some(s.get_var(vtx.src_gpr, vtx.src_sel_x as i8, 0))
    } else {
      None
    }];
    let mut outs: Vec<Option<VarIx>> = Vec::with_capacity(4);
    for q in 0..4 {
      outs.push(if vtx.dst_sel[q] < 4 {
        Some(s.get_var(vtx.dst_gpr, vtx.dst_sel[q] as i8, 0))
      } else {
        None
      });
    }

    let am = s.get_var(REG_AM, 0, 0);
    {
      let n = s.node_mut(tn);
      n.vtx = Some(vtx.clone());
      n.ins = ins.into();
      n.outs = outs.into();
      n.reg_constraint = true;
      n.flow_dep = Some(am);
    }

    s.set_child(cl.unwrap(), tn);

    if let Some(split) = build_split(s, tn, true) {
      let list = s.append_list(cl.unwrap());
      s.set_child(list, split);
      cl = Some(list);
    }
  }
  Ok(())
}

//=============================================================================
// ALU clauses

/// Split live intervals around four-slot instruction groups by copying every
/// group operand into a fresh temporary before the group and every group
/// result out of one after it.
fn build_alu_list_split(s: &mut OptSession, start: NodeIx) {
  let mut im = SortedMap::<VarIx, VarIx>::empty();
  let mut om = SortedMap::<VarIx, VarIx>::empty();
  let mut list = Some(start);

  while let Some(lx) = list {
    let child = s.node(lx).child;
    let is_group =
      child.map_or(false, |c| s.node(c).subtype == NodeSubtype::AluGroup);
    if !is_group {
      list = s.node(lx).rest;
      continue;
    }

    let prev = s.node(lx).parent.unwrap();
    let mut next = s.node(lx).rest;
    let mut g = s.node(child.unwrap()).child;
    let mut s_in = prev;
    let mut list_start = s.node(prev).child == Some(lx);
    let mut contains_last = false;

    while let Some(gl) = g {
      let n = s.node(gl).child.unwrap();

      let ins = s.node(n).ins.clone();
      for (q, slot) in ins.iter().enumerate() {
        let v = match slot {
          Some(v) => *v,
          None => continue,
        };
        if let Some(t) = im.get(v) {
          s.node_mut(n).ins[q] = Some(t);
          continue;
        }
        let t = s.create_temp_var();
        s.var_mut(t).chan = s.var(v).chan;
        im.set(v, t);
        s.node_mut(n).ins[q] = Some(t);

        let nl = s.new_node(NodeType::List);
        if list_start {
          s.set_child(s_in, nl);
          list_start = false;
        } else {
          s.set_rest(s_in, nl);
        }
        s_in = nl;
        let copy = create_alu_copy(s, t, v);
        s.node_mut(copy).group_split = true;
        s.node_mut(copy).alu.as_mut().unwrap().last = true;
        s.set_child(nl, copy);
      }

      if let Some(v) = s.node(n).outs[0] {
        let t = s.create_temp_var();
        s.var_mut(t).chan = s.var(v).chan;
        s.node_mut(n).outs[0] = Some(t);
        om.set(v, t);
      }

      if s.node(n).alu.as_ref().unwrap().last {
        contains_last = true;
      }
      g = s.node(gl).rest;
    }

    if !im.is_empty() {
      im.clear();
      if s_in != prev {
        s.set_rest(s_in, lx);
      } else {
        s.node_mut(lx).parent = Some(s_in);
      }
    }

    let mut out_anchor = lx;
    if !om.is_empty() {
      if !contains_last {
        // The group doesn't own the issue cycle's last instruction; the
        // following trans instruction does, so the out-copies go after it.
        out_anchor = next.unwrap();
        next = s.node(out_anchor).rest;
        let trans = s.node(out_anchor).child.unwrap();
        debug_assert!(s.node(trans).alu.as_ref().unwrap().last);
        if let Some(tw) = s.node(trans).outs[0] {
          // The trans instruction overwrites a var written by the group.
          om.remove(tw);
        }
      }

      if !om.is_empty() {
        let mut s_out: Option<NodeIx> = None;
        let mut s_out_start: Option<NodeIx> = None;
        let pairs: Vec<(VarIx, VarIx)> = om.iter().collect();
        for (v, t) in pairs {
          let nl = match s_out {
            None => {
              let nl = s.new_node(NodeType::List);
              s_out_start = Some(nl);
              nl
            }
            Some(prev_l) => s.append_list(prev_l),
          };
          s_out = Some(nl);
          let copy = create_alu_copy(s, v, t);
          s.node_mut(copy).group_split = true;
          s.node_mut(copy).alu.as_mut().unwrap().last = true;
          s.set_child(nl, copy);
        }

        s.set_rest(out_anchor, s_out_start.unwrap());
        if let Some(nx) = next {
          s.set_rest(s_out.unwrap(), nx);
        } else {
          s.node_mut(s_out.unwrap()).rest = None;
        }
        om.clear();
      }
    }

    list = next;
  }
}

fn parse_cf_alu(
  s: &mut OptSession, node: NodeIx, insts: &[AluRecord],
) -> Result<(), OptError> {
  // Per-cycle slot tracking for PV/PS operand resolution: [cycle][slot],
  // slot 4 being trans.
  let mut slots: [[Option<NodeIx>; 5]; 2] = [[None; 5], [None; 5]];
  let mut cur_slots = 0usize;
  let mut cl = s.start_list(node);
  let mut cg: Option<NodeIx> = None;
  let mut has_groups = false;

  for alu in insts {
    if alu.dst.rel {
      return Err(OptError::UnsupportedRelAddr);
    }
    for src in alu.srcs() {
      if src.rel {
        return Err(OptError::UnsupportedRelAddr);
      }
    }

    let an = s.new_node(NodeType::Op);
    s.node_mut(an).subtype = NodeSubtype::AluInst;
    let grouped = alu.op.is_four_slot();

    if grouped {
      // Keep these instructions together under an extra level of hierarchy.
      has_groups = true;
      match cg {
        None => {
          let group = s.new_node(NodeType::Group);
          s.node_mut(group).subtype = NodeSubtype::AluGroup;
          s.set_child(cl, group);
          let gl = s.start_list(group);
          s.set_child(gl, an);
          cg = Some(gl);
        }
        Some(prev) => {
          let gl = s.append_list(prev);
          s.set_child(gl, an);
          cg = Some(gl);
        }
      }
    } else {
      if cg.is_some() {
        cl = s.append_list(cl);
        cg = None;
      }
      s.set_child(cl, an);
    }

    let am = s.get_var(REG_AM, 0, 0);
    s.node_mut(an).flow_dep = Some(am);

    // Slot classification, and bookkeeping of which hardware slot the naive
    // code generator used (for PV/PS resolution below).
    let chan = alu.dst.chan as usize;
    let trans;
    if s.max_slots == 4 {
      trans = false;
      s.node_mut(an).alu_allowed_slots = AluSlots::Vector;
    } else if alu.op.is_trans_only() {
      trans = true;
      s.node_mut(an).alu_allowed_slots = AluSlots::Trans;
    } else if alu.op.is_vector_only() {
      trans = false;
      s.node_mut(an).alu_allowed_slots = AluSlots::Vector;
    } else if slots[cur_slots][chan].is_some() {
      // Assume the generator preferred vector slots.
      trans = true;
    } else {
      trans = false;
    }

    if trans {
      debug_assert!(slots[cur_slots][4].is_none());
      slots[cur_slots][4] = Some(an);
    } else {
      debug_assert!(slots[cur_slots][chan].is_none());
      slots[cur_slots][chan] = Some(an);
    }

    // Outputs.
    let write = alu.dst.write || alu.op.is_op3();
    let mut outs: Vec<Option<VarIx>> = if alu.predicate {
      let pr = s.get_var(REG_PR, 0, 0);
      let am = s.get_var(REG_AM, 0, 0);
      vec![None, Some(pr), Some(am)]
    } else {
      vec![None]
    };
    outs[0] = if alu.op == AluOp::MovaInt {
      Some(s.get_var(REG_AR, 0, 0))
    } else if alu.dst.gpr < MAX_GPRS && write {
      Some(s.get_var(alu.dst.gpr, alu.dst.chan as i8, 0))
    } else {
      None
    };
    s.node_mut(an).outs = outs.into();

    {
      let n = s.node_mut(an);
      if alu.op == AluOp::Mov {
        n.copy_hint = true;
      }
      if alu.dst.clamp {
        n.clamp_dst = true;
      }
      if grouped {
        n.four_slots = true;
      } else if alu.op.is_kill() {
        n.keep_alive = true;
      }
      if matches!(
        alu.op,
        AluOp::InterpXy | AluOp::InterpZw | AluOp::InterpLoadP0 | AluOp::Cube
      ) {
        n.chan_constraint = true;
      }
    }

    // Inputs.
    let num_op = alu.op.num_src();
    let mut ins: Vec<Option<VarIx>> = Vec::with_capacity(num_op);
    let mut const_count = 0;
    for i in 0..num_op {
      let src = alu.src[i];
      let v = match src.sel {
        AluSrcSel::Gpr(g) => Some(s.get_var(g, src.chan as i8, 0)),
        AluSrcSel::PrevVec | AluSrcSel::PrevScalar => {
          let prev_slot = if src.sel == AluSrcSel::PrevScalar {
            4
          } else {
            src.chan as usize
          };
          let p = slots[1 - cur_slots][prev_slot]
            .expect("PV/PS refers to an empty previous slot");
          match s.node(p).outs[0] {
            Some(v) => Some(v),
            None => {
              let v = s.create_temp_var();
              s.node_mut(p).outs[0] = Some(v);
              Some(v)
            }
          }
        }
        _ => None,
      };
      if v.is_none() {
        const_count += 1;
      }
      ins.push(v);
    }
    {
      let n = s.node_mut(an);
      n.ins = ins.into();
      n.const_ins_count = const_count;
      n.alu = Some(alu.clone());
    }

    if alu.last {
      cur_slots = 1 - cur_slots;
      slots[cur_slots] = [None; 5];
      cg = None;
    }
    if !grouped || alu.last {
      cl = s.append_list(cl);
      cg = None;
    }
  }

  if has_groups {
    let first = s.node(node).child.unwrap();
    build_alu_list_split(s, first);
  }
  Ok(())
}

//=============================================================================
// Exports and stream-out

fn output_swizzle(out: &OutputRecord, export: bool, q: usize) -> Option<u8> {
  if export {
    let swz = out.swizzle[q];
    if swz > 3 {
      None
    } else {
      Some(swz)
    }
  } else if (out.comp_mask >> q) & 1 != 0 {
    Some(q as u8)
  } else {
    None
  }
}

/// Expand an export/stream-out burst into one node per exported register and
/// return the last list node used.
fn parse_cf_output(
  s: &mut OptSession, cfn: NodeIx, record: &CfRecord,
) -> NodeIx {
  let (out, export, stream, buffer) = match &record.kind {
    CfKind::Export { out, .. } => (out.clone(), true, 0, 0),
    CfKind::StreamOut { out, stream, buffer } => {
      (out.clone(), false, *stream, *buffer)
    }
    _ => unreachable!(),
  };

  let count = out.burst_count.max(1);
  let mut ln = s.node(cfn).parent.unwrap();
  let mut cur = cfn;

  for w in 0..count {
    if w > 0 {
      cur = s.new_node(NodeType::Op);
      ln = s.append_list(ln);
    }

    let mut rec_out = out.clone();
    rec_out.gpr += w;
    rec_out.array_base += w;
    rec_out.burst_count = 1;

    let mut ins: Vec<Option<VarIx>> = Vec::with_capacity(4);
    for q in 0..4 {
      let swz = output_swizzle(&rec_out, export, q);
      ins.push(swz.map(|c| s.get_var(rec_out.gpr, c as i8, 0)));
    }

    let am = s.get_var(REG_AM, 0, 0);
    {
      let n = s.node_mut(cur);
      n.kind = NodeType::Op;
      n.subtype = NodeSubtype::CfInst;
      n.label = record.id;
      n.ins = ins.into();
      n.flow_dep = Some(am);
      n.reg_constraint = true;
      n.op_class = if export { OpClass::CfExport } else { OpClass::CfStreamout };
      if !export {
        n.chan_constraint = true;
      }
      n.cf = Some(if export {
        CfKind::Export { out: rec_out, done: false }
      } else {
        CfKind::StreamOut { out: rec_out, stream, buffer }
      });
    }

    if let Some(split) = build_split(s, cur, false) {
      s.set_child(ln, split);
      ln = s.append_list(ln);
    }
    s.set_child(ln, cur);
  }

  ln
}

//=============================================================================
// Top level

/// Parse the source record stream into the initial tree under the session
/// root.  Control-flow records stay raw ops here; `convert_cf` rewrites them
/// into regions afterwards.
pub fn parse_shader(
  s: &mut OptSession, records: &[CfRecord],
) -> Result<(), OptError> {
  s.stats[0] = stats_for_records(records);

  let root = s.root;
  let first = s.new_node(NodeType::List);
  s.set_child(root, first);
  let mut node = first;

  for record in records {
    let cfn = s.new_node(NodeType::Group);
    {
      let am = s.get_var(REG_AM, 0, 0);
      let n = s.node_mut(cfn);
      n.subtype = NodeSubtype::CfInst;
      n.label = record.id;
      n.flow_dep = Some(am);
    }
    debug_assert!(s.node(node).kind == NodeType::List);
    s.set_child(node, cfn);

    let last = match &record.kind {
      CfKind::Alu { insts, .. } => {
        s.node_mut(cfn).subtype = NodeSubtype::AluClause;
        parse_cf_alu(s, cfn, insts)?;
        cfn
      }
      CfKind::Tex(fetches) => {
        parse_cf_tex(s, cfn, fetches)?;
        cfn
      }
      CfKind::Vtx(fetches) => {
        parse_cf_vtx(s, cfn, fetches)?;
        cfn
      }
      CfKind::Export { .. } | CfKind::StreamOut { .. } => {
        let ln = parse_cf_output(s, cfn, record);
        s.node(ln).child.unwrap()
      }
      CfKind::CallFs => {
        let am = s.get_var(REG_AM, 0, 0);
        let n = s.node_mut(cfn);
        n.kind = NodeType::Op;
        n.outs = vec![Some(am)].into();
        n.cf = Some(record.kind.clone());
        cfn
      }
      kind => {
        let n = s.node_mut(cfn);
        n.kind = NodeType::Op;
        n.cf = Some(kind.clone());
        cfn
      }
    };

    node = s.node(last).parent.unwrap();
    let next = s.append_list(node);
    node = next;
  }

  debug!("parsed {} cf records", records.len());
  Ok(())
}

/// Size metrics of a record stream.
pub fn stats_for_records(records: &[CfRecord]) -> crate::interface::ShaderStats {
  let mut st = crate::interface::ShaderStats::default();
  let mut max_gpr: Option<u32> = None;
  let mut depth: u32 = 0;
  let mut touch = |gpr: u32, max_gpr: &mut Option<u32>| {
    if gpr < MAX_GPRS {
      *max_gpr = Some(max_gpr.map_or(gpr, |m: u32| m.max(gpr)));
    }
  };
  for r in records {
    st.ncf += 1;
    match &r.kind {
      CfKind::Alu { insts, .. } => {
        for alu in insts {
          st.nalu += 1;
          if alu.last {
            st.nalugroups += 1;
          }
          if alu.dst.write {
            touch(alu.dst.gpr, &mut max_gpr);
          }
          for src in alu.srcs() {
            if let AluSrcSel::Gpr(g) = src.sel {
              touch(g, &mut max_gpr);
            }
          }
        }
      }
      CfKind::Tex(fetches) => {
        st.nfetch += fetches.len() as u32;
        for t in fetches {
          touch(t.src_gpr, &mut max_gpr);
          touch(t.dst_gpr, &mut max_gpr);
        }
      }
      CfKind::Vtx(fetches) => {
        st.nfetch += fetches.len() as u32;
        for v in fetches {
          touch(v.src_gpr, &mut max_gpr);
          touch(v.dst_gpr, &mut max_gpr);
        }
      }
      CfKind::Export { out, .. } | CfKind::StreamOut { out, .. } => {
        for w in 0..out.burst_count.max(1) {
          touch(out.gpr + w, &mut max_gpr);
        }
      }
      CfKind::Jump { .. } | CfKind::LoopStart { .. } => {
        depth += 1;
        st.nstack = st.nstack.max(depth);
      }
      CfKind::Pop { .. } | CfKind::LoopEnd { .. } => {
        depth = depth.saturating_sub(1);
      }
      _ => {}
    }
  }
  st.ngpr = max_gpr.map_or(0, |m| m + 1);
  st
}
