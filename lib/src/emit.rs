/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Re-emission of the optimized tree as a record stream.  Register colors
//! are applied to every operand, clauses are rebuilt (splitting where the
//! scheduler marked splits or after kill groups), structured regions turn
//! back into jump/loop records with resolved addresses, and export bursts
//! get their swizzles and done-flags.

use log::debug;

use crate::ast::{NodeSubtype, NodeType, OpClass, OptSession};
use crate::bytecode::{
  alloc_kcache_line, AluRecord, AluSrcSel, CfKind, CfRecord, KcacheBanks,
};
use crate::data_structures::{NodeIx, SortedMap, VarIx};
use crate::parse::stats_for_records;
use crate::vars::{color_chan, color_reg, Color};

struct EmitCtx {
  records: Vec<CfRecord>,
  next_id: u32,
  /// Index of the open ALU/TEX/VTX clause, if the last record is one.
  cur_alu: Option<usize>,
  cur_tex: Option<usize>,
  cur_vtx: Option<usize>,
  /// Split the clause after the current instruction group completes.
  force_cf: bool,
  force_add_cf: bool,
  /// Record index of the last export per target kind.
  last_export: SortedMap<u32, usize>,
  /// Emitted record index for loop-related nodes, for address fixups.
  new_cf: SortedMap<NodeIx, usize>,
  stack_level: u32,
  nstack: u32,
  kcache_sets: usize,
}

impl EmitCtx {
  fn add_record(&mut self, kind: CfKind) -> usize {
    let id = self.next_id;
    self.next_id += 1;
    self.records.push(CfRecord::new(id, kind));
    self.cur_alu = None;
    self.cur_tex = None;
    self.cur_vtx = None;
    self.records.len() - 1
  }

  fn push_stack(&mut self) {
    self.stack_level += 1;
    if self.stack_level > self.nstack {
      self.nstack = self.stack_level;
    }
  }

  fn pop_stack(&mut self) {
    debug_assert!(self.stack_level > 0);
    self.stack_level -= 1;
  }

  fn add_alu(&mut self, alu: AluRecord, predicate: bool) {
    let want_push_before = predicate;

    let mut reuse = false;
    if let Some(ix) = self.cur_alu {
      if !self.force_add_cf {
        if let CfKind::Alu { push_before, .. } = &self.records[ix].kind {
          // A predicate instruction needs a PUSH_BEFORE clause; anything
          // may continue in one.
          reuse = !want_push_before || *push_before;
        }
      }
    }

    if reuse {
      let ix = self.cur_alu.unwrap();
      // Keep the clause's kcache set consistent with its instructions.
      let mut kc = match &self.records[ix].kind {
        CfKind::Alu { kcache, .. } => *kcache,
        _ => unreachable!(),
      };
      if alloc_alu_kcache(&mut kc, self.kcache_sets, &alu) {
        if let CfKind::Alu { insts, kcache, .. } = &mut self.records[ix].kind {
          insts.push(alu);
          *kcache = kc;
        }
        return;
      }
      // The scheduler's clause splits should prevent this.
      debug_assert!(false, "kcache overflow while rebuilding a clause");
    }

    let mut kc = KcacheBanks::default();
    let ok = alloc_alu_kcache(&mut kc, self.kcache_sets, &alu);
    debug_assert!(ok);
    let ix = self.add_record(CfKind::Alu {
      push_before: want_push_before,
      insts: vec![alu],
      kcache: kc,
    });
    self.cur_alu = Some(ix);
    self.force_add_cf = false;
  }

  fn add_tex(&mut self, tex: crate::bytecode::TexRecord) {
    if let Some(ix) = self.cur_tex {
      if let CfKind::Tex(fetches) = &mut self.records[ix].kind {
        fetches.push(tex);
        return;
      }
    }
    let ix = self.add_record(CfKind::Tex(vec![tex]));
    self.cur_tex = Some(ix);
  }

  fn add_vtx(&mut self, vtx: crate::bytecode::VtxRecord) {
    if let Some(ix) = self.cur_vtx {
      if let CfKind::Vtx(fetches) = &mut self.records[ix].kind {
        fetches.push(vtx);
        return;
      }
    }
    let ix = self.add_record(CfKind::Vtx(vec![vtx]));
    self.cur_vtx = Some(ix);
  }
}

fn alloc_alu_kcache(
  kc: &mut KcacheBanks, nsets: usize, alu: &AluRecord,
) -> bool {
  let saved = *kc;
  for src in alu.srcs() {
    if let AluSrcSel::Kcache { bank, addr } = src.sel {
      if !alloc_kcache_line(kc, nsets, bank, addr >> 4) {
        *kc = saved;
        return false;
      }
    }
  }
  true
}

//=============================================================================
// Register application

fn var_alloc(s: &OptSession, v: VarIx) -> Color {
  debug_assert!(!s.var(v).dead);
  s.var(v).color
}

fn set_alu_regs(s: &mut OptSession, node: NodeIx) -> AluRecord {
  let mut alu = s.node(node).alu.as_ref().unwrap().clone();
  let ins = s.node(node).ins.clone();

  for (q, slot) in ins.iter().enumerate() {
    if let Some(v) = slot {
      if s.var(*v).undefined {
        // Reading an undefined value: any safe operand will do.
        alu.src[q].sel = AluSrcSel::Zero;
        alu.src[q].chan = 0;
      } else {
        let rc = var_alloc(s, *v);
        assert!(rc != 0);
        alu.src[q].sel = AluSrcSel::Gpr(color_reg(rc));
        alu.src[q].chan = color_chan(rc);
      }
    }
  }

  let out = s.node(node).outs[0];
  match out {
    Some(v) if !s.var(v).dead => {
      let rc = var_alloc(s, v);
      assert!(rc != 0);
      alu.dst.gpr = color_reg(rc);
      alu.dst.chan = color_chan(rc);
      alu.dst.write = true;
    }
    _ => {
      alu.dst.write = false;
      alu.dst.gpr = 0;
    }
  }

  alu.dst.clamp = s.node(node).clamp_dst;
  alu
}

/// Replicated reductions produce the same value in all four lanes, so each
/// lane can claim whichever output landed in its channel.
fn fix_alu_replicate_regs(s: &mut OptSession, group: NodeIx) {
  let mut outs: [Option<VarIx>; 4] = [None; 4];
  let mut l = s.node(group).child;
  while let Some(lx) = l {
    if let Some(inst) = s.node(lx).child {
      if let Some(o) = s.node(inst).outs[0] {
        let chan = color_chan(s.var(o).color) as usize;
        debug_assert!(chan < 4);
        outs[chan] = Some(o);
      }
    }
    l = s.node(lx).rest;
  }

  let mut l = s.node(group).child;
  let mut q = 0;
  while let Some(lx) = l {
    if let Some(inst) = s.node(lx).child {
      s.node_mut(inst).outs[0] = outs[q];
    }
    q += 1;
    l = s.node(lx).rest;
  }
}

fn set_tex_regs(s: &mut OptSession, node: NodeIx) -> crate::bytecode::TexRecord {
  let mut tex = s.node(node).tex.as_ref().unwrap().clone();
  let ins = s.node(node).ins.clone();
  let outs = s.node(node).outs.clone();

  let mut gpr: Option<u32> = None;
  for q in 0..4 {
    if let Some(v) = ins.get(q).copied().flatten() {
      if s.var(v).dead {
        continue;
      }
      let rc = var_alloc(s, v);
      match gpr {
        None => gpr = Some(color_reg(rc)),
        Some(g) => {
          assert!(g == color_reg(rc), "tex ins: vars in different gprs")
        }
      }
      tex.src_sel[q] = color_chan(rc);
    }
  }
  tex.src_gpr = gpr.unwrap_or(0);

  let mut gpr: Option<u32> = None;
  for q in 0..4 {
    tex.dst_sel[q] = 7;
    if let Some(v) = outs.get(q).copied().flatten() {
      if s.var(v).dead || s.var(v).special {
        continue;
      }
      let rc = var_alloc(s, v);
      match gpr {
        None => gpr = Some(color_reg(rc)),
        Some(g) => {
          assert!(g == color_reg(rc), "tex outs: vars in different gprs")
        }
      }
      tex.dst_sel[q] = color_chan(rc);
    }
  }
  tex.dst_gpr = gpr.unwrap_or(0);
  tex
}

fn set_vtx_regs(s: &mut OptSession, node: NodeIx) -> crate::bytecode::VtxRecord {
  let mut vtx = s.node(node).vtx.as_ref().unwrap().clone();
  let ins = s.node(node).ins.clone();
  let outs = s.node(node).outs.clone();

  if let Some(v) = ins.get(0).copied().flatten() {
    debug_assert!(!s.var(v).special);
    let rc = var_alloc(s, v);
    assert!(rc != 0);
    vtx.src_gpr = color_reg(rc);
    vtx.src_sel_x = color_chan(rc);
  }

  let mut gpr: Option<u32> = None;
  for q in 0..4 {
    vtx.dst_sel[q] = 7;
    if let Some(v) = outs.get(q).copied().flatten() {
      if s.var(v).dead {
        continue;
      }
      let rc = var_alloc(s, v);
      match gpr {
        None => gpr = Some(color_reg(rc)),
        Some(g) => {
          assert!(g == color_reg(rc), "vtx outs: vars in different gprs")
        }
      }
      vtx.dst_sel[q] = color_chan(rc);
    }
  }
  vtx.dst_gpr = gpr.unwrap_or(0);
  vtx
}

//=============================================================================
// CF leaves

fn build_cf_node(s: &mut OptSession, ctx: &mut EmitCtx, node: NodeIx) {
  match s.node(node).op_class {
    OpClass::CfExport => {
      let mut out = match s.node(node).cf.as_ref().unwrap() {
        CfKind::Export { out, .. } => out.clone(),
        _ => unreachable!(),
      };
      let ins = s.node(node).ins.clone();

      let mut gpr: Option<u32> = None;
      for (w, slot) in ins.iter().enumerate() {
        if let Some(v) = slot {
          if !s.var(*v).undefined {
            let rc = var_alloc(s, *v);
            assert!(rc != 0);
            match gpr {
              None => gpr = Some(color_reg(rc)),
              Some(g) => {
                assert!(g == color_reg(rc), "export: vars in different gprs")
              }
            }
            out.swizzle[w] = color_chan(rc);
          } else {
            out.swizzle[w] = 4;
          }
        }
        // A None slot keeps the swizzle from parse/copy-folding.
      }
      out.gpr = gpr.unwrap_or(0);
      out.burst_count = 1;

      let out_type = out.out_type;
      let ix = ctx.add_record(CfKind::Export { out, done: false });
      ctx.last_export.set(out_type, ix);
    }

    OpClass::CfStreamout => {
      let (mut out, stream, buffer) = match s.node(node).cf.as_ref().unwrap() {
        CfKind::StreamOut { out, stream, buffer } => {
          (out.clone(), *stream, *buffer)
        }
        _ => unreachable!(),
      };
      let ins = s.node(node).ins.clone();

      let mut gpr: Option<u32> = None;
      out.comp_mask = 0;
      for (w, slot) in ins.iter().enumerate() {
        if let Some(v) = slot {
          let rc = var_alloc(s, *v);
          assert!(rc != 0);
          match gpr {
            None => gpr = Some(color_reg(rc)),
            Some(g) => {
              assert!(g == color_reg(rc), "mem_stream: vars in different gprs")
            }
          }
          assert!(
            color_chan(rc) as usize == w,
            "mem_stream: channel constraint broken"
          );
          out.comp_mask |= 1 << w;
        }
      }
      out.gpr = gpr.unwrap_or(0);
      out.burst_count = 1;

      ctx.add_record(CfKind::StreamOut { out, stream, buffer });
    }

    OpClass::Generic => {
      if let Some(CfKind::CallFs) = s.node(node).cf {
        ctx.add_record(CfKind::CallFs);
      }
      // Raw ELSE/POP/LOOP_END leftovers from control-flow conversion emit
      // nothing; the structured nodes rebuild them.
    }
  }
}

//=============================================================================
// Structured control flow

fn fix_loop_ops(s: &OptSession, ctx: &mut EmitCtx, node: NodeIx, end_ix: usize) {
  let st = s.node(node).subtype;
  if st == NodeSubtype::LoopBreak || st == NodeSubtype::LoopContinue {
    // Only fix ops belonging to this loop, not to a nested one already
    // resolved.
    if let Some(rec) = ctx.new_cf.get(node) {
      let target = ctx.records[end_ix].id;
      match &mut ctx.records[rec].kind {
        CfKind::LoopBreak { target: t } | CfKind::LoopContinue { target: t } => {
          if *t == u32::MAX {
            *t = target;
          }
        }
        _ => {}
      }
    }
  }

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    fix_loop_ops(s, ctx, c, end_ix);
  }
  if let Some(r) = rest {
    fix_loop_ops(s, ctx, r, end_ix);
  }
}

fn emit_if_else(s: &mut OptSession, ctx: &mut EmitCtx, node: NodeIx) {
  // The region's child list holds the single depart wrapping
  // [if, else-op, false arm]; the if node's child is the true-arm depart.
  let depart = match s.node(node).child.and_then(|l| s.node(l).child) {
    Some(d) => d,
    None => return,
  };
  let dlist = match s.node(depart).child {
    Some(l) => l,
    None => return,
  };
  let if_node = s.node(dlist).child.unwrap();
  let n_if = s.node(if_node).child;
  let n_else = s.node(dlist).rest;

  let jump_ix = ctx.add_record(CfKind::Jump { target: 0, pop_count: 0 });

  ctx.push_stack();
  if let Some(n) = n_if {
    build_shader_node(s, ctx, n);
  }

  let else_ix = ctx.add_record(CfKind::Else { target: 0, pop_count: 1 });

  if let Some(n) = n_else {
    build_shader_node(s, ctx, n);
  }
  ctx.pop_stack();

  let pop_ix = ctx.add_record(CfKind::Pop { target: 0, pop_count: 1 });

  let else_id = ctx.records[else_ix].id;
  let after_pop = ctx.records[pop_ix].id + 1;
  if let CfKind::Jump { target, .. } = &mut ctx.records[jump_ix].kind {
    *target = else_id;
  }
  if let CfKind::Else { target, .. } = &mut ctx.records[else_ix].kind {
    *target = after_pop;
  }
  if let CfKind::Pop { target, .. } = &mut ctx.records[pop_ix].kind {
    *target = after_pop;
  }
}

//=============================================================================
// The walk

fn build_shader_node(s: &mut OptSession, ctx: &mut EmitCtx, node: NodeIx) {
  if s.node(node).dead {
    return;
  }

  if s.node(node).subtype == NodeSubtype::AluGroup {
    let first = s
      .node(node)
      .child
      .and_then(|l| s.node(l).child);
    let replicate = first
      .and_then(|f| s.node(f).alu.as_ref())
      .map_or(false, |a| a.op.is_replicate());
    if replicate {
      fix_alu_replicate_regs(s, node);
    }
  } else if s.node(node).alu.is_some() {
    let alu = set_alu_regs(s, node);
    let predicate = alu.predicate;
    let last = alu.last;

    debug!("building alu: {}", alu);
    ctx.add_alu(alu, predicate);

    if s.node(node).clause_split
      || s.node(node).alu.as_ref().unwrap().op.is_kill()
    {
      ctx.force_cf = true;
    }
    if ctx.force_cf && last {
      ctx.force_add_cf = true;
      ctx.force_cf = false;
    }
  } else if s.node(node).tex.is_some() {
    let tex = set_tex_regs(s, node);
    ctx.add_tex(tex);
  } else if s.node(node).vtx.is_some() {
    let vtx = set_vtx_regs(s, node);
    ctx.add_vtx(vtx);
  }

  match s.node(node).subtype {
    NodeSubtype::LoopRegion => {
      let start_ix = ctx.add_record(CfKind::LoopStart { target: 0 });
      ctx.push_stack();

      if let Some(c) = s.node(node).child {
        build_shader_node(s, ctx, c);
      }

      ctx.pop_stack();
      let end_ix = ctx.add_record(CfKind::LoopEnd { target: 0 });

      let start_id = ctx.records[start_ix].id;
      let end_id = ctx.records[end_ix].id;
      if let CfKind::LoopStart { target } = &mut ctx.records[start_ix].kind {
        *target = end_id + 1;
      }
      if let CfKind::LoopEnd { target } = &mut ctx.records[end_ix].kind {
        *target = start_id + 1;
      }

      if let Some(c) = s.node(node).child {
        fix_loop_ops(s, ctx, c, end_ix);
      }
      return;
    }

    NodeSubtype::LoopBreak => {
      if let Some(c) = s.node(node).child {
        build_shader_node(s, ctx, c);
      }
      let ix = ctx.add_record(CfKind::LoopBreak { target: u32::MAX });
      ctx.new_cf.set(node, ix);
      return;
    }

    NodeSubtype::LoopContinue => {
      if let Some(c) = s.node(node).child {
        build_shader_node(s, ctx, c);
      }
      let ix = ctx.add_record(CfKind::LoopContinue { target: u32::MAX });
      ctx.new_cf.set(node, ix);
      return;
    }

    NodeSubtype::IfElseRegion => {
      emit_if_else(s, ctx, node);
      return;
    }

    _ => {}
  }

  if s.node(node).kind == NodeType::If {
    let jump_ix = ctx.add_record(CfKind::Jump { target: 0, pop_count: 1 });

    ctx.push_stack();
    if let Some(c) = s.node(node).child {
      build_shader_node(s, ctx, c);
    }
    ctx.pop_stack();

    let pop_ix = ctx.add_record(CfKind::Pop { target: 0, pop_count: 1 });
    let after_pop = ctx.records[pop_ix].id + 1;
    if let CfKind::Jump { target, .. } = &mut ctx.records[jump_ix].kind {
      *target = after_pop;
    }
    if let CfKind::Pop { target, .. } = &mut ctx.records[pop_ix].kind {
      *target = after_pop;
    }
    return;
  }

  if s.node(node).cf.is_some() && s.node(node).kind == NodeType::Op {
    build_cf_node(s, ctx, node);
  }

  let (child, rest) = {
    let n = s.node(node);
    (n.child, n.rest)
  };
  if let Some(c) = child {
    build_shader_node(s, ctx, c);
  }
  if let Some(r) = rest {
    build_shader_node(s, ctx, r);
  }
}

//=============================================================================
// Entry point

pub fn build_shader(s: &mut OptSession) -> Vec<CfRecord> {
  let mut ctx = EmitCtx {
    records: vec![],
    next_id: 0,
    cur_alu: None,
    cur_tex: None,
    cur_vtx: None,
    force_cf: false,
    force_add_cf: false,
    last_export: SortedMap::empty(),
    new_cf: SortedMap::empty(),
    stack_level: 0,
    nstack: 0,
    kcache_sets: s.caps.kcache_sets(),
  };

  let root = s.root;
  build_shader_node(s, &mut ctx, root);

  // The final export of each kind carries the done flag.
  for (_, ix) in ctx.last_export.clone().iter() {
    if let CfKind::Export { done, .. } = &mut ctx.records[ix].kind {
      *done = true;
    }
  }

  if let Some(last) = ctx.records.last_mut() {
    last.end_of_program = true;
  }

  s.stats[1] = stats_for_records(&ctx.records);
  s.stats[1].nstack = ctx.nstack;

  ctx.records
}
