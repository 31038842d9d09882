/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Builders for bytecode record streams, and a single-lane reference
//! interpreter for them.  The interpreter exists so that a shader can be run
//! before and after optimization on the same inputs and the results
//! compared; its fetch instructions are deterministic pseudo-fetches, which
//! is all equivalence checking needs.

use sbopt::bytecode::*;

//=============================================================================
// Builders

pub fn dst(gpr: u32, chan: u8) -> AluDst {
  AluDst { gpr, chan, write: true, clamp: false, rel: false }
}

pub fn dst_sat(gpr: u32, chan: u8) -> AluDst {
  AluDst { gpr, chan, write: true, clamp: true, rel: false }
}

pub fn no_dst(chan: u8) -> AluDst {
  AluDst { gpr: 0, chan, write: false, clamp: false, rel: false }
}

/// One instruction closing its own issue group (the naive code generator's
/// usual output).
pub fn alu1(op: AluOp, d: AluDst, src: &[AluSrc]) -> AluRecord {
  let mut a = AluRecord::new(op, d, src);
  a.last = true;
  a
}

/// One instruction inside a wider group; only the final member carries
/// `last`.
pub fn alu_in_group(op: AluOp, d: AluDst, src: &[AluSrc]) -> AluRecord {
  AluRecord::new(op, d, src)
}

enum OpenBlock {
  Loop { start_pos: usize },
  If { jump_pos: usize },
  IfElse { jump_pos: usize, else_pos: Option<usize> },
}

pub struct ShaderBuilder {
  records: Vec<CfRecord>,
  next_id: u32,
  open: Vec<OpenBlock>,
}

impl ShaderBuilder {
  pub fn new() -> Self {
    Self { records: vec![], next_id: 0, open: vec![] }
  }

  fn push(&mut self, kind: CfKind) -> u32 {
    let id = self.next_id;
    self.next_id += 1;
    self.records.push(CfRecord::new(id, kind));
    id
  }

  pub fn alu(&mut self, insts: Vec<AluRecord>) -> &mut Self {
    self.push(CfKind::Alu {
      push_before: false,
      insts,
      kcache: KcacheBanks::default(),
    });
    self
  }

  pub fn alu_push_before(&mut self, insts: Vec<AluRecord>) -> &mut Self {
    self.push(CfKind::Alu {
      push_before: true,
      insts,
      kcache: KcacheBanks::default(),
    });
    self
  }

  pub fn tex(&mut self, fetches: Vec<TexRecord>) -> &mut Self {
    self.push(CfKind::Tex(fetches));
    self
  }

  pub fn vtx(&mut self, fetches: Vec<VtxRecord>) -> &mut Self {
    self.push(CfKind::Vtx(fetches));
    self
  }

  pub fn export(&mut self, base: u32, gpr: u32, swizzle: [u8; 4]) -> &mut Self {
    self.export_typed(0, base, gpr, swizzle)
  }

  pub fn export_typed(
    &mut self, out_type: u32, base: u32, gpr: u32, swizzle: [u8; 4],
  ) -> &mut Self {
    self.push(CfKind::Export {
      out: OutputRecord {
        array_base: base,
        out_type,
        gpr,
        rel: false,
        swizzle,
        comp_mask: 0,
        burst_count: 1,
      },
      done: false,
    });
    self
  }

  pub fn streamout(
    &mut self, stream: u8, buffer: u8, base: u32, gpr: u32, comp_mask: u8,
  ) -> &mut Self {
    self.push(CfKind::StreamOut {
      out: OutputRecord {
        array_base: base,
        out_type: 0,
        gpr,
        rel: false,
        swizzle: [0, 1, 2, 3],
        comp_mask,
        burst_count: 1,
      },
      stream,
      buffer,
    });
    self
  }

  pub fn callfs(&mut self) -> &mut Self {
    self.push(CfKind::CallFs);
    self
  }

  pub fn begin_loop(&mut self) -> &mut Self {
    let start_pos = self.records.len();
    self.push(CfKind::LoopStart { target: 0 });
    self.open.push(OpenBlock::Loop { start_pos });
    self
  }

  pub fn finish_loop(&mut self) -> &mut Self {
    let start_pos = match self.open.pop() {
      Some(OpenBlock::Loop { start_pos }) => start_pos,
      _ => panic!("finish_loop without begin_loop"),
    };
    let start_id = self.records[start_pos].id;
    let end_id = self.push(CfKind::LoopEnd { target: start_id + 1 });
    if let CfKind::LoopStart { target } = &mut self.records[start_pos].kind {
      *target = end_id + 1;
    }
    self
  }

  pub fn begin_if(&mut self) -> &mut Self {
    let jump_pos = self.records.len();
    self.push(CfKind::Jump { target: 0, pop_count: 1 });
    self.open.push(OpenBlock::If { jump_pos });
    self
  }

  pub fn finish_if(&mut self) -> &mut Self {
    let jump_pos = match self.open.pop() {
      Some(OpenBlock::If { jump_pos }) => jump_pos,
      _ => panic!("finish_if without begin_if"),
    };
    let pop_pos = self.records.len();
    let pop_id = self.push(CfKind::Pop { target: 0, pop_count: 1 });
    if let CfKind::Jump { target, .. } = &mut self.records[jump_pos].kind {
      *target = pop_id;
    }
    if let CfKind::Pop { target, .. } = &mut self.records[pop_pos].kind {
      *target = pop_id + 1;
    }
    self
  }

  pub fn begin_if_else(&mut self) -> &mut Self {
    let jump_pos = self.records.len();
    self.push(CfKind::Jump { target: 0, pop_count: 0 });
    self.open.push(OpenBlock::IfElse { jump_pos, else_pos: None });
    self
  }

  pub fn begin_else(&mut self) -> &mut Self {
    let else_pos = self.records.len();
    self.push(CfKind::Else { target: 0, pop_count: 1 });
    match self.open.last_mut() {
      Some(OpenBlock::IfElse { else_pos: slot, .. }) => *slot = Some(else_pos),
      _ => panic!("begin_else without begin_if_else"),
    }
    self
  }

  pub fn finish_if_else(&mut self) -> &mut Self {
    let (jump_pos, else_pos) = match self.open.pop() {
      Some(OpenBlock::IfElse { jump_pos, else_pos }) => {
        (jump_pos, else_pos.expect("if/else without else block"))
      }
      _ => panic!("finish_if_else without begin_if_else"),
    };
    let pop_pos = self.records.len();
    let pop_id = self.push(CfKind::Pop { target: 0, pop_count: 1 });
    let else_id = self.records[else_pos].id;
    if let CfKind::Jump { target, .. } = &mut self.records[jump_pos].kind {
      *target = else_id;
    }
    if let CfKind::Else { target, .. } = &mut self.records[else_pos].kind {
      *target = pop_id;
    }
    if let CfKind::Pop { target, .. } = &mut self.records[pop_pos].kind {
      *target = pop_id + 1;
    }
    self
  }

  /// `body(b)` runs between LOOP_START and LOOP_END.
  pub fn lp(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
    self.begin_loop();
    body(self);
    self.finish_loop()
  }

  /// Conditional block guarded by the preceding PRED_SET clause.
  pub fn iff(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
    self.begin_if();
    body(self);
    self.finish_if()
  }

  /// If/else, guarded by the preceding PRED_SET clause.
  pub fn if_else(
    &mut self, then_body: impl FnOnce(&mut Self),
    else_body: impl FnOnce(&mut Self),
  ) -> &mut Self {
    self.begin_if_else();
    then_body(self);
    self.begin_else();
    else_body(self);
    self.finish_if_else()
  }

  pub fn loop_break(&mut self) -> &mut Self {
    self.push(CfKind::LoopBreak { target: 0 });
    self
  }

  pub fn loop_continue(&mut self) -> &mut Self {
    self.push(CfKind::LoopContinue { target: 0 });
    self
  }

  pub fn finish(&mut self) -> Vec<CfRecord> {
    assert!(self.open.is_empty(), "unclosed block in shader builder");
    if let Some(last) = self.records.last_mut() {
      last.end_of_program = true;
    }
    std::mem::take(&mut self.records)
  }
}

//=============================================================================
// Reference interpreter

#[derive(Clone, Copy, PartialEq)]
enum LaneState {
  Active,
  Continued,
  Broken,
}

struct LoopFrame {
  body_id: u32,
  entry_active: bool,
  state: LaneState,
}

/// Result of running a shader: the exported vectors (keyed by target kind
/// and array base), the stream-out writes, and whether the lane was killed.
#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
  pub exports: Vec<((u32, u32), [f32; 4])>,
  pub streamout: Vec<((u8, u8, u32), [f32; 4])>,
  pub discarded: bool,
}

pub struct Machine<'a> {
  regs: Vec<[f32; 4]>,
  consts: &'a [Vec<[f32; 4]>],
  pv: [f32; 4],
  ps: f32,
  pred: bool,
  active: bool,
  /// (entry_active, branch_taken) per push.
  cond_stack: Vec<(bool, bool)>,
  loop_stack: Vec<LoopFrame>,
  grad_v: [f32; 4],
  grad_h: [f32; 4],
  result: RunResult,
  /// Instruction budget, to keep broken control flow from hanging tests.
  fuel: u32,
}

fn clamp01(f: f32) -> f32 {
  f.max(0.0).min(1.0)
}

impl<'a> Machine<'a> {
  pub fn new(inputs: &[[f32; 4]], consts: &'a [Vec<[f32; 4]>]) -> Self {
    let mut regs = vec![[0.0f32; 4]; MAX_GPRS as usize];
    regs[..inputs.len()].copy_from_slice(inputs);
    Self {
      regs,
      consts,
      pv: [0.0; 4],
      ps: 0.0,
      pred: false,
      active: true,
      cond_stack: vec![],
      loop_stack: vec![],
      grad_v: [0.0; 4],
      grad_h: [0.0; 4],
      result: RunResult { exports: vec![], streamout: vec![], discarded: false },
      fuel: 1_000_000,
    }
  }

  fn src_value(&self, src: &AluSrc) -> f32 {
    let base = match src.sel {
      AluSrcSel::Gpr(g) => self.regs[g as usize][src.chan as usize],
      AluSrcSel::Kcache { bank, addr } => self.consts[bank as usize]
        [addr as usize][src.chan as usize],
      AluSrcSel::Literal(bits) => f32::from_bits(bits),
      AluSrcSel::Zero => 0.0,
      AluSrcSel::Half => 0.5,
      AluSrcSel::One => 1.0,
      AluSrcSel::PrevVec => self.pv[src.chan as usize],
      AluSrcSel::PrevScalar => self.ps,
    };
    let base = if src.abs { base.abs() } else { base };
    if src.neg {
      -base
    } else {
      base
    }
  }

  /// Execute one issue group (instructions up to and including `last`).
  /// Reads happen before any write commits, matching the hardware.
  fn exec_alu_group(&mut self, group: &[AluRecord]) {
    let mut srcs: Vec<Vec<f32>> = Vec::with_capacity(group.len());
    for inst in group {
      srcs.push(inst.srcs().iter().map(|s| self.src_value(s)).collect());
    }

    // Reduction groups combine their four lanes.
    let reduction = group.iter().any(|i| i.op.is_replicate());
    let reduced: f32 = if reduction {
      let op = group.iter().find(|i| i.op.is_replicate()).unwrap().op;
      match op {
        AluOp::Dot4 | AluOp::Dot4Ieee => srcs
          .iter()
          .zip(group.iter())
          .filter(|(_, i)| i.op.is_replicate())
          .map(|(s, _)| s[0] * s[1])
          .sum(),
        AluOp::Max4 => srcs
          .iter()
          .zip(group.iter())
          .filter(|(_, i)| i.op.is_replicate())
          .map(|(s, _)| s[0])
          .fold(f32::MIN, f32::max),
        _ => unreachable!(),
      }
    } else {
      0.0
    };

    let mut new_pv = self.pv;
    let mut new_ps = self.ps;
    let mut writes: Vec<(u32, u8, f32)> = vec![];
    let mut used_chans = [false; 4];

    for (inst, s) in group.iter().zip(srcs.iter()) {
      let lane = inst.dst.chan as usize;
      let val = match inst.op {
        AluOp::Mov => s[0],
        AluOp::Add => s[0] + s[1],
        AluOp::Mul | AluOp::MulIeee => s[0] * s[1],
        AluOp::Max => s[0].max(s[1]),
        AluOp::Min => s[0].min(s[1]),
        AluOp::SetE => (s[0] == s[1]) as u32 as f32,
        AluOp::SetGt => (s[0] > s[1]) as u32 as f32,
        AluOp::SetGe => (s[0] >= s[1]) as u32 as f32,
        AluOp::SetNe => (s[0] != s[1]) as u32 as f32,
        AluOp::Fract => s[0] - s[0].floor(),
        AluOp::Floor => s[0].floor(),
        AluOp::Trunc => s[0].trunc(),
        AluOp::FltToInt => s[0].trunc(),
        AluOp::IntToFlt => s[0],
        AluOp::PredSetE => {
          if self.active {
            self.pred = s[0] == s[1];
          }
          (s[0] == s[1]) as u32 as f32
        }
        AluOp::PredSetGt => {
          if self.active {
            self.pred = s[0] > s[1];
          }
          (s[0] > s[1]) as u32 as f32
        }
        AluOp::PredSetGe => {
          if self.active {
            self.pred = s[0] >= s[1];
          }
          (s[0] >= s[1]) as u32 as f32
        }
        AluOp::PredSetNe => {
          if self.active {
            self.pred = s[0] != s[1];
          }
          (s[0] != s[1]) as u32 as f32
        }
        AluOp::KillE => {
          if self.active && s[0] == s[1] {
            self.result.discarded = true;
            self.active = false;
          }
          0.0
        }
        AluOp::KillGt => {
          if self.active && s[0] > s[1] {
            self.result.discarded = true;
            self.active = false;
          }
          0.0
        }
        AluOp::KillGe => {
          if self.active && s[0] >= s[1] {
            self.result.discarded = true;
            self.active = false;
          }
          0.0
        }
        AluOp::KillNe => {
          if self.active && s[0] != s[1] {
            self.result.discarded = true;
            self.active = false;
          }
          0.0
        }
        AluOp::Dot4 | AluOp::Dot4Ieee | AluOp::Max4 => reduced,
        AluOp::Cube => s[0] * 2.0 + s[1],
        AluOp::InterpXy | AluOp::InterpZw => {
          s[0] + s[1] * (lane as f32 + 1.0)
        }
        AluOp::InterpLoadP0 => s[0] + lane as f32,
        AluOp::MovaInt => s[0],
        AluOp::Exp => s[0].exp2(),
        AluOp::Log => if s[0] != 0.0 { s[0].abs().log2() } else { f32::MIN },
        AluOp::Rcp => 1.0 / s[0],
        AluOp::Rsq => 1.0 / s[0].abs().sqrt(),
        AluOp::Sin => s[0].sin(),
        AluOp::Cos => s[0].cos(),
        AluOp::MulAdd | AluOp::MulAddIeee => s[0] * s[1] + s[2],
        AluOp::CndE => {
          if s[0] == 0.0 {
            s[1]
          } else {
            s[2]
          }
        }
        AluOp::CndGt => {
          if s[0] > 0.0 {
            s[1]
          } else {
            s[2]
          }
        }
        AluOp::CndGe => {
          if s[0] >= 0.0 {
            s[1]
          } else {
            s[2]
          }
        }
      };

      let val = if inst.dst.clamp { clamp01(val) } else { val };

      // Slot assignment mirrors the hardware: the destination channel if it
      // is still free in this cycle, otherwise the trans slot.
      let chan = inst.dst.chan as usize;
      let trans = inst.op.is_trans_only() || used_chans[chan];
      if trans {
        new_ps = val;
      } else {
        used_chans[chan] = true;
        new_pv[chan] = val;
      }

      if inst.dst.write && self.active {
        writes.push((inst.dst.gpr, inst.dst.chan, val));
      }
    }

    for (gpr, chan, val) in writes {
      self.regs[gpr as usize][chan as usize] = val;
    }
    self.pv = new_pv;
    self.ps = new_ps;
  }

  fn exec_alu_clause(&mut self, insts: &[AluRecord]) {
    let mut start = 0;
    for (i, inst) in insts.iter().enumerate() {
      if inst.last {
        self.exec_alu_group(&insts[start..=i]);
        start = i + 1;
      }
    }
    debug_assert!(start == insts.len(), "clause ends mid-group");
  }

  /// Deterministic pseudo-fetch: a pure function of the fetch parameters.
  fn exec_tex(&mut self, tex: &TexRecord) {
    if !self.active {
      return;
    }
    let coord = |q: usize| -> f32 {
      match tex.src_sel[q] {
        c if c < 4 => self.regs[tex.src_gpr as usize][c as usize],
        4 => 0.0,
        5 => 1.0,
        _ => 0.0,
      }
    };
    match tex.op {
      TexOp::SetGradientsH => {
        self.grad_h = [coord(0), coord(1), coord(2), coord(3)];
        return;
      }
      TexOp::SetGradientsV => {
        self.grad_v = [coord(0), coord(1), coord(2), coord(3)];
        return;
      }
      _ => {}
    }

    let grad_bias = if tex.op.uses_gradients() {
      self.grad_v[0] * 0.3 + self.grad_h[0] * 0.7
    } else {
      0.0
    };

    let base = coord(0) * 1.25
      + coord(1) * 2.5
      + coord(2) * 0.75
      + coord(3) * 0.125
      + tex.resource_id as f32
      + tex.sampler_id as f32 * 0.5
      + grad_bias;

    for q in 0..4 {
      if tex.dst_sel[q] < 4 {
        self.regs[tex.dst_gpr as usize][tex.dst_sel[q] as usize] =
          base + q as f32 * 0.25;
      }
    }
  }

  fn exec_vtx(&mut self, vtx: &VtxRecord) {
    if !self.active {
      return;
    }
    let addr = match vtx.src_sel_x {
      c if c < 4 => self.regs[vtx.src_gpr as usize][c as usize],
      _ => 0.0,
    };
    for q in 0..4 {
      if vtx.dst_sel[q] < 4 {
        self.regs[vtx.dst_gpr as usize][vtx.dst_sel[q] as usize] =
          vtx.buffer_id as f32 + vtx.fetch_offset as f32 * 0.5 + addr * 2.0
            + q as f32;
      }
    }
  }

  fn exec_export(&mut self, out: &OutputRecord) {
    if !self.active {
      return;
    }
    let mut vals = [0.0f32; 4];
    for q in 0..4 {
      vals[q] = match out.swizzle[q] {
        c if c < 4 => self.regs[out.gpr as usize][c as usize],
        4 => 0.0,
        5 => 1.0,
        _ => 0.0,
      };
    }
    let key = (out.out_type, out.array_base);
    if let Some(e) = self.result.exports.iter_mut().find(|(k, _)| *k == key) {
      e.1 = vals;
    } else {
      self.result.exports.push((key, vals));
    }
  }

  fn exec_streamout(&mut self, out: &OutputRecord, stream: u8, buffer: u8) {
    if !self.active {
      return;
    }
    let mut vals = [0.0f32; 4];
    for q in 0..4 {
      if (out.comp_mask >> q) & 1 != 0 {
        vals[q] = self.regs[out.gpr as usize][q];
      }
    }
    self.result.streamout.push(((stream, buffer, out.array_base), vals));
  }

  pub fn run(mut self, records: &[CfRecord]) -> Result<RunResult, String> {
    // Branch targets address records by id; a target past the last record
    // means "end of program".
    let index_of = |id: u32| -> usize {
      records.iter().position(|r| r.id >= id).unwrap_or(records.len())
    };

    let mut pc = 0usize;
    while pc < records.len() {
      self.fuel = self.fuel.checked_sub(1).ok_or("instruction budget exhausted")?;
      let rec = &records[pc];
      match &rec.kind {
        CfKind::Alu { insts, .. } => self.exec_alu_clause(insts),
        CfKind::Tex(fetches) => {
          for t in fetches {
            self.exec_tex(t);
          }
        }
        CfKind::Vtx(fetches) => {
          for v in fetches {
            self.exec_vtx(v);
          }
        }
        CfKind::Jump { target, .. } => {
          // Push the branch state; the matching ELSE flips it, the matching
          // POP restores it.
          self.cond_stack.push((self.active, self.pred));
          self.active = self.active && self.pred;
          if !self.active {
            pc = index_of(*target);
            continue;
          }
        }
        CfKind::Else { target, .. } => {
          let (entry, taken) =
            *self.cond_stack.last().ok_or("ELSE without JUMP")?;
          self.active = entry && !taken;
          if !self.active {
            pc = index_of(*target);
            continue;
          }
        }
        CfKind::Pop { pop_count, .. } => {
          for _ in 0..*pop_count {
            let (entry, _) = self.cond_stack.pop().ok_or("POP underflow")?;
            self.active = entry;
          }
        }
        CfKind::LoopStart { target } => {
          if !self.active {
            pc = index_of(*target);
            continue;
          }
          self.loop_stack.push(LoopFrame {
            body_id: rec.id + 1,
            entry_active: self.active,
            state: LaneState::Active,
          });
        }
        CfKind::LoopEnd { .. } => {
          let frame = self.loop_stack.last_mut().ok_or("LOOP_END underflow")?;
          let resume = self.active || frame.state == LaneState::Continued;
          if resume && frame.state != LaneState::Broken {
            frame.state = LaneState::Active;
            self.active = true;
            pc = index_of(frame.body_id);
            continue;
          }
          let frame = self.loop_stack.pop().unwrap();
          self.active = frame.entry_active;
        }
        CfKind::LoopBreak { .. } => {
          if self.active {
            let frame =
              self.loop_stack.last_mut().ok_or("BREAK outside loop")?;
            frame.state = LaneState::Broken;
            self.active = false;
          }
        }
        CfKind::LoopContinue { .. } => {
          if self.active {
            let frame =
              self.loop_stack.last_mut().ok_or("CONTINUE outside loop")?;
            if frame.state != LaneState::Broken {
              frame.state = LaneState::Continued;
            }
            self.active = false;
          }
        }
        CfKind::Export { out, .. } => self.exec_export(out),
        CfKind::StreamOut { out, stream, buffer } => {
          self.exec_streamout(out, *stream, *buffer)
        }
        CfKind::CallFs => {}
      }
      pc += 1;
    }
    Ok(self.result)
  }
}

/// Run a shader on the given inputs and constant buffers.
pub fn run_shader(
  records: &[CfRecord], inputs: &[[f32; 4]], consts: &[Vec<[f32; 4]>],
) -> Result<RunResult, String> {
  Machine::new(inputs, consts).run(records)
}

/// Canned input/constant vectors for differential runs.
pub fn test_inputs() -> Vec<Vec<[f32; 4]>> {
  vec![
    vec![[0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0]],
    vec![[1.5, -2.0, 0.25, 8.0], [0.5, 4.0, -1.0, 2.0]],
    vec![[-1.0, 0.5, 3.0, -0.125], [2.5, -0.5, 7.0, 0.0]],
    vec![[10.0, 20.0, 30.0, 40.0], [-10.0, 0.675, 0.125, 5.5]],
  ]
}

pub fn test_consts() -> Vec<Vec<[f32; 4]>> {
  let mut bank0 = vec![];
  for i in 0..32 {
    let f = i as f32;
    bank0.push([f * 0.5, f * 0.25 - 1.0, f + 0.125, -f]);
  }
  let mut bank1 = vec![];
  for i in 0..32 {
    let f = i as f32;
    bank1.push([1.0 - f, f * f * 0.01, 0.5 + f, f * 3.0]);
  }
  vec![bank0, bank1]
}

/// Run `before` and `after` on every canned input set and compare.
pub fn check_equivalence(
  before: &[CfRecord], after: &[CfRecord],
) -> Result<(), String> {
  let consts = test_consts();
  for (i, inputs) in test_inputs().iter().enumerate() {
    let r0 = run_shader(before, inputs, &consts)?;
    let r1 = run_shader(after, inputs, &consts)?;
    if r0 != r1 {
      return Err(format!(
        "results diverge on input set {}:\n  before: {:?}\n  after:  {:?}",
        i, r0, r1
      ));
    }
  }
  Ok(())
}
