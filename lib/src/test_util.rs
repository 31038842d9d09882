/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Shared helpers for the in-crate tests: tiny builders for bytecode record
//! streams and partial-pipeline drivers that stop after a given pass so the
//! tests can inspect the session state.

use crate::analyze;
use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::bytecode::*;
use crate::coloring;
use crate::convert;
use crate::data_structures::{NodeIx, VarIx};
use crate::interface::Options;
use crate::liveness;
use crate::parse;
use crate::sched_global;
use crate::ssa;

pub fn dst(gpr: u32, chan: u8) -> AluDst {
  AluDst { gpr, chan, write: true, clamp: false, rel: false }
}

pub fn alu(op: AluOp, d: AluDst, src: &[AluSrc]) -> AluRecord {
  let mut a = AluRecord::new(op, d, src);
  a.last = true;
  a
}

pub fn alu_clause(id: u32, insts: Vec<AluRecord>) -> CfRecord {
  CfRecord::new(
    id,
    CfKind::Alu { push_before: false, insts, kcache: KcacheBanks::default() },
  )
}

pub fn export(id: u32, base: u32, gpr: u32, swizzle: [u8; 4]) -> CfRecord {
  CfRecord::new(
    id,
    CfKind::Export {
      out: OutputRecord {
        array_base: base,
        out_type: 0,
        gpr,
        rel: false,
        swizzle,
        comp_mask: 0,
        burst_count: 1,
      },
      done: false,
    },
  )
}

pub fn opts_with_inputs(last_input_gpr: u32) -> Options {
  Options { last_input_gpr: Some(last_input_gpr) }
}

/// Run the pipeline through liveness (tree building + SSA + liveness).
pub fn session_after_liveness(
  records: &[CfRecord], caps: IsaCaps, opts: &Options,
) -> OptSession {
  let mut s = OptSession::new(caps, opts.last_input_gpr);
  parse::parse_shader(&mut s, records).unwrap();
  convert::convert_cf(&mut s);
  ssa::build_ssa(&mut s);
  liveness::liveness(&mut s);
  s
}

/// Run the pipeline through coalescing (everything before the clause
/// scheduler).
pub fn session_after_coalesce(
  records: &[CfRecord], caps: IsaCaps, opts: &Options,
) -> OptSession {
  let mut s = OptSession::new(caps, opts.last_input_gpr);
  parse::parse_shader(&mut s, records).unwrap();
  convert::convert_cf(&mut s);
  ssa::build_ssa(&mut s);
  liveness::liveness(&mut s);
  analyze::propagate_copy(&mut s);
  s.reset_interferences();
  liveness::liveness(&mut s);
  analyze::analyze_vars(&mut s);
  sched_global::gs_schedule(&mut s);
  s.reset_interferences();
  liveness::liveness(&mut s);
  coloring::color(&mut s);
  coloring::coalesce(&mut s);
  s
}

pub fn find_nodes(
  s: &OptSession, pred: impl Fn(&crate::ast::AstNode) -> bool,
) -> Vec<NodeIx> {
  (0..s.nodes.len())
    .map(|i| NodeIx::new(i as u32))
    .filter(|&n| pred(s.node(n)))
    .collect()
}

/// Variables reachable from the final tree (live code only).
pub fn live_vars(s: &OptSession) -> Vec<VarIx> {
  (0..s.num_vars())
    .map(|i| VarIx::new(i as u32))
    .filter(|&v| !s.var(v).dead && (s.var(v).def.is_some() || !s.var(v).uses.is_empty()))
    .collect()
}

/// A straight-line shader: `n` independent ADDs of an input and a literal,
/// writing consecutive (reg, chan) slots starting at R1, followed by one
/// export per filled register.
pub fn straight_line_shader(n: usize) -> Vec<CfRecord> {
  let mut insts = vec![];
  for i in 0..n {
    let gpr = 1 + (i / 4) as u32;
    let chan = (i % 4) as u8;
    insts.push(alu(
      AluOp::Add,
      dst(gpr, chan),
      &[AluSrc::gpr(0, 0), AluSrc::literal(1.0 + i as f32)],
    ));
  }
  let mut records = vec![alu_clause(0, insts)];
  let nregs = (n + 3) / 4;
  for r in 0..nregs {
    records.push(export(
      1 + r as u32,
      r as u32,
      1 + r as u32,
      [0, 1, 2, 3],
    ));
  }
  records
}

/// A data-dependent loop with a break: a counter is incremented until a
/// predicate fires, then the final value is exported.  The break uses the
/// conditional pattern the naive code generator emits: a predicated jump
/// guarding the LOOP_BREAK record.
pub fn loop_break_shader() -> Vec<CfRecord> {
  let mut init = alu(AluOp::Mov, dst(1, 0), &[AluSrc::literal(0.0)]);
  init.last = true;

  let mut pred = alu(
    AluOp::PredSetGt,
    AluDst { gpr: 0, chan: 0, write: false, clamp: false, rel: false },
    &[AluSrc::gpr(1, 0), AluSrc::literal(3.0)],
  );
  pred.predicate = true;

  let inc =
    alu(AluOp::Add, dst(1, 0), &[AluSrc::gpr(1, 0), AluSrc::literal(1.0)]);

  vec![
    alu_clause(0, vec![init]),
    CfRecord::new(1, CfKind::LoopStart { target: 8 }),
    CfRecord::new(
      2,
      CfKind::Alu {
        push_before: true,
        insts: vec![pred],
        kcache: KcacheBanks::default(),
      },
    ),
    CfRecord::new(3, CfKind::Jump { target: 5, pop_count: 1 }),
    CfRecord::new(4, CfKind::LoopBreak { target: 8 }),
    CfRecord::new(5, CfKind::Pop { target: 6, pop_count: 1 }),
    alu_clause(6, vec![inc]),
    CfRecord::new(7, CfKind::LoopEnd { target: 2 }),
    export(8, 0, 1, [0, 0, 0, 0]),
  ]
}

//=============================================================================
// Tests over the internal pipeline state

#[cfg(test)]
mod tests {
  use super::*;
  use crate::interface::optimize_shader;
  use crate::sched_alu;
  use crate::vars::{color_chan, color_reg};

  #[test]
  fn interference_is_symmetric_and_irreflexive() {
    let records = straight_line_shader(20);
    let s =
      session_after_liveness(&records, IsaCaps::five_slot(), &opts_with_inputs(0));

    for &v in live_vars(&s).iter() {
      assert!(
        !s.var(v).interferences.contains(v),
        "{:?} interferes with itself",
        v
      );
      for &n in s.var(v).interferences.iter() {
        assert!(
          s.var(n).interferences.contains(v),
          "interference not symmetric: {:?} vs {:?}",
          v,
          n
        );
      }
    }
  }

  #[test]
  fn dead_vars_have_no_interferences() {
    // The second ADD result is never exported, so it is dead.
    let records = vec![
      alu_clause(
        0,
        vec![
          alu(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(1.0)]),
          alu(AluOp::Add, dst(2, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(2.0)]),
        ],
      ),
      export(1, 0, 1, [0, 0, 0, 0]),
    ];
    let s =
      session_after_liveness(&records, IsaCaps::five_slot(), &opts_with_inputs(0));

    let mut found_dead = false;
    for i in 0..s.num_vars() {
      let v = VarIx::new(i as u32);
      if s.var(v).dead {
        found_dead = true;
        assert!(s.var(v).interferences.is_empty());
      }
    }
    assert!(found_dead);
  }

  #[test]
  fn coloring_separates_interfering_vars() {
    let records = straight_line_shader(20);
    let s = session_after_coalesce(
      &records,
      IsaCaps::five_slot(),
      &opts_with_inputs(0),
    );

    for &v in live_vars(&s).iter() {
      let vd = s.var(v);
      if vd.special || vd.undefined || vd.color == 0 {
        continue;
      }
      for &n in vd.interferences.iter() {
        let nd = s.var(n);
        if nd.special || nd.undefined || nd.dead || nd.color == 0 {
          continue;
        }
        if vd.color == nd.color {
          // Sharing a location is only legal for copies of one value.
          assert!(
            vd.value_hint == Some(n)
              || nd.value_hint == Some(v)
              || (vd.value_hint.is_some() && vd.value_hint == nd.value_hint),
            "interfering vars {:?} and {:?} share color {}",
            v,
            n,
            vd.color
          );
        }
      }
    }
  }

  #[test]
  fn constraint_groups_share_register() {
    let records = straight_line_shader(8);
    let s = session_after_coalesce(
      &records,
      IsaCaps::five_slot(),
      &opts_with_inputs(0),
    );

    for rc in &s.constraints {
      let mut reg: Option<u32> = None;
      let mut chans = vec![];
      for v in rc.comps.iter().flatten() {
        let vd = s.var(*v);
        if vd.dead {
          continue;
        }
        assert!(vd.color != 0, "constrained var left uncolored");
        match reg {
          None => reg = Some(color_reg(vd.color)),
          Some(r) => assert_eq!(
            r,
            color_reg(vd.color),
            "constraint group split across registers"
          ),
        }
        let chan = color_chan(vd.color);
        assert!(!chans.contains(&chan), "constraint group channel collision");
        chans.push(chan);
      }
    }
  }

  #[test]
  fn straight_line_packs_full_groups() {
    // 20 independent ALU instructions on a 4-slot architecture pack into
    // exactly five groups of four, with nothing evicted.
    let records = straight_line_shader(20);
    let out = optimize_shader(&records, IsaCaps::four_slot(), &opts_with_inputs(0))
      .expect("optimization must succeed");

    let mut group_sizes = vec![];
    let mut cur = 0;
    for r in &out.records {
      if let CfKind::Alu { insts, .. } = &r.kind {
        for inst in insts {
          cur += 1;
          if inst.last {
            group_sizes.push(cur);
            cur = 0;
          }
        }
      }
    }
    assert_eq!(cur, 0, "clause ended mid-group");
    assert_eq!(group_sizes.iter().sum::<usize>(), 20);
    for sz in &group_sizes {
      assert_eq!(*sz, 4);
    }
    assert_eq!(group_sizes.len(), 5);
  }

  #[test]
  fn scheduled_groups_respect_slot_limits() {
    for caps in &[IsaCaps::five_slot(), IsaCaps::four_slot()] {
      let records = straight_line_shader(17);
      let out = optimize_shader(&records, *caps, &opts_with_inputs(0))
        .expect("optimization must succeed");

      let mut cur = 0;
      for r in &out.records {
        if let CfKind::Alu { insts, .. } = &r.kind {
          for inst in insts {
            cur += 1;
            if inst.last {
              assert!(cur <= caps.max_slots);
              cur = 0;
            }
          }
        }
      }
    }
  }

  #[test]
  fn kcache_pairs_limited_per_group() {
    // Four ADDs each reading a distinct kcache constant; every scheduled
    // group may reserve at most two constant pairs.
    let insts = vec![
      alu(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::kcache(0, 0, 0)]),
      alu(AluOp::Add, dst(1, 1), &[AluSrc::gpr(0, 0), AluSrc::kcache(0, 4, 1)]),
      alu(AluOp::Add, dst(1, 2), &[AluSrc::gpr(0, 0), AluSrc::kcache(0, 8, 0)]),
      alu(AluOp::Add, dst(1, 3), &[AluSrc::gpr(0, 0), AluSrc::kcache(0, 12, 1)]),
    ];
    let records =
      vec![alu_clause(0, insts), export(1, 0, 1, [0, 1, 2, 3])];
    let out = optimize_shader(&records, IsaCaps::five_slot(), &opts_with_inputs(0))
      .expect("optimization must succeed");

    for r in &out.records {
      if let CfKind::Alu { insts, .. } = &r.kind {
        let mut pairs = vec![];
        for inst in insts {
          for src in inst.srcs() {
            if let AluSrcSel::Kcache { bank, addr } = src.sel {
              let pair = (bank, addr, src.chan >> 1);
              if !pairs.contains(&pair) {
                pairs.push(pair);
              }
            }
          }
          if inst.last {
            assert!(pairs.len() <= 2, "too many kcache pairs in one group");
            pairs.clear();
          }
        }
      }
    }
  }

  #[test]
  fn empty_clause_short_circuits() {
    let mut s = OptSession::new(IsaCaps::five_slot(), None);
    let root = s.root;
    let list = s.new_node(NodeType::List);
    s.set_child(root, list);
    let clause = s.new_node(NodeType::Group);
    s.node_mut(clause).subtype = NodeSubtype::AluClause;
    s.set_child(list, clause);

    assert!(sched_alu::post_schedule(&mut s));
    assert!(s.node(clause).child.is_none());
  }

  #[test]
  fn loop_break_builds_region_with_depart() {
    let records = loop_break_shader();
    let s =
      session_after_liveness(&records, IsaCaps::five_slot(), &opts_with_inputs(0));

    let regions = find_nodes(&s, |n| {
      n.kind == NodeType::Region && n.subtype == NodeSubtype::LoopRegion
    });
    assert_eq!(regions.len(), 1);
    let region = regions[0];
    assert_eq!(s.node(region).repeat_count, 1);
    assert_eq!(s.node(region).depart_count, 1);
    assert!(s.node(region).loop_phi.is_some());

    let breaks =
      find_nodes(&s, |n| n.subtype == NodeSubtype::LoopBreak);
    assert_eq!(breaks.len(), 1);
    assert_eq!(s.node(breaks[0]).kind, NodeType::Depart);
    assert_eq!(s.node(breaks[0]).target, Some(region));

    // The loop-carried counter (R1.x) is live across the back edge.
    let repeats = find_nodes(&s, |n| {
      n.kind == NodeType::Repeat && n.subtype == NodeSubtype::None
    });
    assert_eq!(repeats.len(), 1);
    let live = s.node(repeats[0]).vars_live.as_ref().unwrap();
    let carried = live.iter().any(|&v| {
      let vd = s.var(v);
      vd.reg == 1 && vd.chan == 0
    });
    assert!(carried, "loop-carried variable not live across the back edge");
  }

  #[test]
  fn coalesced_mov_is_eliminated() {
    let records = vec![
      alu_clause(
        0,
        vec![alu(AluOp::Mov, dst(1, 0), &[AluSrc::gpr(0, 0)])],
      ),
      export(1, 0, 1, [0, 7, 7, 7]),
    ];
    let out = optimize_shader(&records, IsaCaps::five_slot(), &opts_with_inputs(0))
      .expect("optimization must succeed");

    // The copy coalesced away: no ALU instructions remain, and the export
    // reads the input register directly.
    for r in &out.records {
      match &r.kind {
        CfKind::Alu { insts, .. } => {
          assert!(insts.is_empty(), "MOV not eliminated: {:?}", insts)
        }
        CfKind::Export { out, .. } => {
          assert_eq!(out.gpr, 0);
          assert_eq!(out.swizzle[0], 0);
        }
        _ => {}
      }
    }
    assert!(out
      .records
      .iter()
      .all(|r| !matches!(&r.kind, CfKind::Alu { insts, .. } if !insts.is_empty())));
  }

  #[test]
  fn loop_break_optimizes_end_to_end() {
    let records = loop_break_shader();
    let out = optimize_shader(&records, IsaCaps::five_slot(), &opts_with_inputs(0))
      .expect("optimization must succeed");

    // The structure survives: one loop, a conditional break inside it, and
    // the final export.
    let mut has_start = false;
    let mut has_end = false;
    let mut has_break = false;
    let mut has_export = false;
    for r in &out.records {
      match &r.kind {
        CfKind::LoopStart { .. } => has_start = true,
        CfKind::LoopEnd { .. } => has_end = true,
        CfKind::LoopBreak { target } => {
          has_break = true;
          assert_ne!(*target, u32::MAX, "break target left unresolved");
        }
        CfKind::Export { .. } => has_export = true,
        _ => {}
      }
    }
    assert!(has_start && has_end && has_break && has_export);
  }

  #[test]
  fn stats_reflect_eliminated_copies() {
    let records = straight_line_shader(8);
    let out = optimize_shader(&records, IsaCaps::five_slot(), &opts_with_inputs(0))
      .expect("optimization must succeed");
    // The split copies inserted around the exports must have coalesced
    // away: no more ALU instructions than the source had.
    assert!(out.stats.after.nalu <= out.stats.before.nalu);
  }
}
