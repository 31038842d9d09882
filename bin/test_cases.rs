/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Constructed shader test cases, selectable by name from the driver and
//! iterated by the integration tests.  Every case is a record stream the
//! reference interpreter can execute, so optimized output is checked for
//! semantic equivalence against the original.

use sbopt::bytecode::*;
use sbopt::Options;

use crate::test_framework::{alu1, alu_in_group, dst, dst_sat, no_dst, ShaderBuilder};

pub struct TestCase {
  pub name: &'static str,
  pub records: Vec<CfRecord>,
  pub options: Options,
}

fn opts(last_input_gpr: u32) -> Options {
  Options { last_input_gpr: Some(last_input_gpr) }
}

fn tc_mov_coalesce() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![alu1(AluOp::Mov, dst(1, 0), &[AluSrc::gpr(0, 0)])])
    .export(0, 1, [0, 7, 7, 7]);
  TestCase { name: "mov-coalesce", records: b.finish(), options: opts(0) }
}

fn tc_straight20() -> TestCase {
  let mut b = ShaderBuilder::new();
  let mut insts = vec![];
  for i in 0..20 {
    let gpr = 1 + (i / 4) as u32;
    let chan = (i % 4) as u8;
    insts.push(alu1(
      AluOp::Add,
      dst(gpr, chan),
      &[AluSrc::gpr(0, (i % 4) as u8), AluSrc::literal(1.0 + i as f32)],
    ));
  }
  b.alu(insts);
  for r in 0..5 {
    b.export(r, 1 + r, [0, 1, 2, 3]);
  }
  TestCase { name: "straight20", records: b.finish(), options: opts(0) }
}

fn tc_loop_break() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![alu1(AluOp::Mov, dst(1, 0), &[AluSrc::literal(0.0)])]);
  b.begin_loop();
  {
    let mut pred = alu1(
      AluOp::PredSetGt,
      no_dst(0),
      &[AluSrc::gpr(1, 0), AluSrc::gpr(0, 0)],
    );
    pred.predicate = true;
    b.alu_push_before(vec![pred]);
    b.begin_if();
    b.loop_break();
    b.finish_if();
    b.alu(vec![alu1(
      AluOp::Add,
      dst(1, 0),
      &[AluSrc::gpr(1, 0), AluSrc::literal(1.0)],
    )]);
  }
  b.finish_loop();
  b.export(0, 1, [0, 4, 4, 5]);
  TestCase { name: "loop-break", records: b.finish(), options: opts(0) }
}

fn tc_if_else() -> TestCase {
  let mut b = ShaderBuilder::new();
  let mut pred = alu1(
    AluOp::PredSetGt,
    no_dst(0),
    &[AluSrc::gpr(0, 0), AluSrc::literal(0.5)],
  );
  pred.predicate = true;
  b.alu_push_before(vec![pred]);
  b.if_else(
    |b| {
      b.alu(vec![alu1(
        AluOp::Mul,
        dst(1, 0),
        &[AluSrc::gpr(0, 1), AluSrc::literal(2.0)],
      )]);
    },
    |b| {
      b.alu(vec![alu1(
        AluOp::Add,
        dst(1, 0),
        &[AluSrc::gpr(0, 1), AluSrc::literal(10.0)],
      )]);
    },
  );
  b.export(0, 1, [0, 4, 4, 5]);
  TestCase { name: "if-else", records: b.finish(), options: opts(0) }
}

fn tc_dot4() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu_in_group(AluOp::Dot4, dst(2, 0), &[AluSrc::gpr(0, 0), AluSrc::gpr(1, 0)]),
    alu_in_group(AluOp::Dot4, no_dst(1), &[AluSrc::gpr(0, 1), AluSrc::gpr(1, 1)]),
    alu_in_group(AluOp::Dot4, no_dst(2), &[AluSrc::gpr(0, 2), AluSrc::gpr(1, 2)]),
    alu1(AluOp::Dot4, no_dst(3), &[AluSrc::gpr(0, 3), AluSrc::gpr(1, 3)]),
  ]);
  b.export(0, 2, [0, 4, 4, 5]);
  TestCase { name: "dot4", records: b.finish(), options: opts(1) }
}

fn tc_kcache() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::kcache(0, 0, 0)]),
    alu1(AluOp::Add, dst(1, 1), &[AluSrc::gpr(0, 1), AluSrc::kcache(0, 1, 1)]),
    alu1(AluOp::Mul, dst(1, 2), &[AluSrc::gpr(0, 2), AluSrc::kcache(1, 8, 2)]),
    alu1(
      AluOp::MulAdd,
      dst(1, 3),
      &[AluSrc::gpr(0, 3), AluSrc::kcache(1, 9, 3), AluSrc::kcache(0, 2, 0)],
    ),
  ]);
  b.export(0, 1, [0, 1, 2, 3]);
  TestCase { name: "kcache", records: b.finish(), options: opts(0) }
}

fn tc_dead_code() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(1.0)]),
    // Never used downstream.
    alu1(AluOp::Mul, dst(2, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(3.0)]),
    alu1(AluOp::Add, dst(1, 1), &[AluSrc::gpr(1, 0), AluSrc::literal(2.0)]),
  ]);
  b.export(0, 1, [1, 4, 4, 5]);
  TestCase { name: "dead-code", records: b.finish(), options: opts(0) }
}

fn tc_trans_ops() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Rcp, dst(1, 0), &[AluSrc::gpr(0, 0)]),
    alu1(AluOp::Mul, dst(1, 1), &[AluSrc::gpr(0, 1), AluSrc::gpr(0, 2)]),
    alu1(AluOp::Exp, dst(1, 2), &[AluSrc::gpr(0, 3)]),
    alu1(AluOp::Add, dst(1, 3), &[AluSrc::gpr(1, 0), AluSrc::gpr(1, 1)]),
  ]);
  b.export(0, 1, [0, 1, 2, 3]);
  TestCase { name: "trans-ops", records: b.finish(), options: opts(0) }
}

fn tc_clamp_prop() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::gpr(0, 1)]),
    // Saturating copy of the sum; the only other consumer is the copy, so
    // the clamp can move onto the ADD.
    alu1(AluOp::Mov, dst_sat(2, 0), &[AluSrc::gpr(1, 0)]),
  ]);
  b.export(0, 2, [0, 4, 4, 5]);
  TestCase { name: "clamp-prop", records: b.finish(), options: opts(0) }
}

fn tc_kill() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::KillGt, no_dst(0), &[AluSrc::gpr(0, 0), AluSrc::literal(9.0)]),
    alu1(AluOp::Mul, dst(1, 0), &[AluSrc::gpr(0, 1), AluSrc::literal(0.5)]),
  ]);
  b.export(0, 1, [0, 4, 4, 5]);
  TestCase { name: "kill", records: b.finish(), options: opts(0) }
}

fn tc_tex() -> TestCase {
  let mut b = ShaderBuilder::new();
  // Compute coordinates, sample, scale the result.
  b.alu(vec![
    alu1(AluOp::Mul, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(0.5)]),
    alu1(AluOp::Mul, dst(1, 1), &[AluSrc::gpr(0, 1), AluSrc::literal(0.5)]),
    alu1(AluOp::Mov, dst(1, 2), &[AluSrc::literal(0.0)]),
    alu1(AluOp::Mov, dst(1, 3), &[AluSrc::literal(1.0)]),
  ]);
  b.tex(vec![TexRecord {
    op: TexOp::Sample,
    resource_id: 0,
    sampler_id: 0,
    src_gpr: 1,
    src_sel: [0, 1, 2, 3],
    src_rel: false,
    dst_gpr: 2,
    dst_sel: [0, 1, 2, 3],
    dst_rel: false,
  }]);
  b.alu(vec![alu1(
    AluOp::Mul,
    dst(3, 0),
    &[AluSrc::gpr(2, 0), AluSrc::literal(2.0)],
  )]);
  b.export(0, 3, [0, 4, 4, 5]);
  TestCase { name: "tex", records: b.finish(), options: opts(0) }
}

fn tc_vtx() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![alu1(AluOp::Mov, dst(1, 0), &[AluSrc::gpr(0, 0)])]);
  b.vtx(vec![VtxRecord {
    buffer_id: 0,
    fetch_offset: 16,
    src_gpr: 1,
    src_sel_x: 0,
    src_rel: false,
    dst_gpr: 2,
    dst_sel: [0, 1, 2, 3],
  }]);
  b.export(0, 2, [0, 1, 2, 3]);
  TestCase { name: "vtx", records: b.finish(), options: opts(0) }
}

fn tc_loop_continue() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Mov, dst(1, 0), &[AluSrc::literal(0.0)]),
    alu1(AluOp::Mov, dst(1, 1), &[AluSrc::literal(0.0)]),
  ]);
  b.begin_loop();
  {
    // i += 1; if (i >= bound) break; if (i == 2) continue; acc += i
    b.alu(vec![alu1(
      AluOp::Add,
      dst(1, 0),
      &[AluSrc::gpr(1, 0), AluSrc::literal(1.0)],
    )]);
    let mut pred = alu1(
      AluOp::PredSetGe,
      no_dst(0),
      &[AluSrc::gpr(1, 0), AluSrc::gpr(0, 0)],
    );
    pred.predicate = true;
    b.alu_push_before(vec![pred]);
    b.begin_if();
    b.loop_break();
    b.finish_if();

    let mut pred2 = alu1(
      AluOp::PredSetE,
      no_dst(0),
      &[AluSrc::gpr(1, 0), AluSrc::literal(2.0)],
    );
    pred2.predicate = true;
    b.alu_push_before(vec![pred2]);
    b.begin_if();
    b.loop_continue();
    b.finish_if();

    b.alu(vec![alu1(
      AluOp::Add,
      dst(1, 1),
      &[AluSrc::gpr(1, 1), AluSrc::gpr(1, 0)],
    )]);
  }
  b.finish_loop();
  b.export(0, 1, [1, 4, 4, 5]);
  TestCase { name: "loop-continue", records: b.finish(), options: opts(0) }
}

fn tc_copy_chain() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(4.0)]),
    alu1(AluOp::Mov, dst(2, 0), &[AluSrc::gpr(1, 0)]),
    alu1(AluOp::Mov, dst(3, 0), &[AluSrc::gpr(2, 0)]),
    alu1(AluOp::Add, dst(4, 0), &[AluSrc::gpr(3, 0), AluSrc::gpr(1, 0)]),
  ]);
  b.export(0, 4, [0, 4, 4, 5]);
  TestCase { name: "copy-chain", records: b.finish(), options: opts(0) }
}

fn tc_streamout() -> TestCase {
  let mut b = ShaderBuilder::new();
  b.alu(vec![
    alu1(AluOp::Add, dst(1, 0), &[AluSrc::gpr(0, 0), AluSrc::literal(1.0)]),
    alu1(AluOp::Add, dst(1, 1), &[AluSrc::gpr(0, 1), AluSrc::literal(2.0)]),
  ]);
  b.streamout(0, 0, 0, 1, 0b0011);
  b.export(0, 1, [0, 1, 4, 5]);
  TestCase { name: "streamout", records: b.finish(), options: opts(0) }
}

pub fn all_test_cases() -> Vec<TestCase> {
  vec![
    tc_mov_coalesce(),
    tc_straight20(),
    tc_loop_break(),
    tc_if_else(),
    tc_dot4(),
    tc_kcache(),
    tc_dead_code(),
    tc_trans_ops(),
    tc_clamp_prop(),
    tc_kill(),
    tc_tex(),
    tc_vtx(),
    tc_loop_continue(),
    tc_copy_chain(),
    tc_streamout(),
  ]
}

pub fn find_test_case(name: &str) -> Result<TestCase, Vec<&'static str>> {
  let cases = all_test_cases();
  let names = cases.iter().map(|c| c.name).collect();
  cases.into_iter().find(|c| c.name == name).ok_or(names)
}
