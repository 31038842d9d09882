/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! In-memory model of the hardware bytecode records the optimizer consumes
//! and produces.  This mirrors the fixed VLIW shader ISA: a shader is an
//! ordered sequence of control-flow records, each of which may own an ordered
//! sequence of ALU, texture-fetch or vertex-fetch sub-records.  The binary
//! encoding of these records is handled by an external builder; here they
//! stay symbolic (enum selects instead of packed opcode fields, absolute
//! kcache line addresses instead of clause-relative ones).

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

/// Number of addressable GPR slots.
pub const MAX_GPRS: u32 = 128;

/// Topmost GPRs reserved for clause-local temporaries by convention; the
/// allocator never hands them out.
pub const RESERVED_TEMP_GPRS: u32 = 4;

/// Hard limit of ALU slot instructions (plus literal slots) per clause.
pub const MAX_ALU_SLOTS_PER_CLAUSE: u32 = 128;

/// A VLIW instruction group carries at most four literal dwords.
pub const MAX_GROUP_LITERALS: usize = 4;

//=============================================================================
// Architecture capabilities

/// The capability switch between the two supported members of the ISA
/// family: 5 issue slots (4 vector + 1 trans) with extended kcache banks, or
/// 4 issue slots (vector only).  Gates the scheduler's slot count, the
/// bank-swizzle table sizes (6 vector / 4 scalar swizzles, the scalar table
/// being unused without a trans slot) and the number of kcache sets per
/// clause.
#[derive(Clone, Copy, Debug)]
pub struct IsaCaps {
  pub max_slots: usize,
  pub extended_kcache: bool,
}

impl IsaCaps {
  /// 4 vector slots + trans slot, 4 kcache sets.
  pub fn five_slot() -> Self {
    Self { max_slots: 5, extended_kcache: true }
  }

  /// 4 vector slots, no trans unit, 2 kcache sets.
  pub fn four_slot() -> Self {
    Self { max_slots: 4, extended_kcache: false }
  }

  pub fn has_trans(&self) -> bool {
    self.max_slots == 5
  }

  pub fn kcache_sets(&self) -> usize {
    if self.extended_kcache {
      4
    } else {
      2
    }
  }
}

//=============================================================================
// ALU instructions

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum AluOp {
  // op2, vector or trans
  Mov,
  Add,
  Mul,
  MulIeee,
  Max,
  Min,
  SetE,
  SetGt,
  SetGe,
  SetNe,
  Fract,
  Floor,
  Trunc,
  FltToInt,
  IntToFlt,
  PredSetE,
  PredSetGt,
  PredSetGe,
  PredSetNe,
  // op2, kill family
  KillE,
  KillGt,
  KillGe,
  KillNe,
  // op2, reduction (single result replicated across the four lanes, except
  // Cube which produces per-lane results)
  Dot4,
  Dot4Ieee,
  Max4,
  Cube,
  // op2, attribute interpolation (four-slot on this ISA)
  InterpXy,
  InterpZw,
  InterpLoadP0,
  // op2, address register load
  MovaInt,
  // op2, trans only
  Exp,
  Log,
  Rcp,
  Rsq,
  Sin,
  Cos,
  // op3
  MulAdd,
  MulAddIeee,
  CndE,
  CndGt,
  CndGe,
}

impl AluOp {
  pub fn is_op3(self) -> bool {
    matches!(
      self,
      AluOp::MulAdd | AluOp::MulAddIeee | AluOp::CndE | AluOp::CndGt | AluOp::CndGe
    )
  }

  pub fn num_src(self) -> usize {
    use AluOp::*;
    match self {
      Mov | Fract | Floor | Trunc | FltToInt | IntToFlt | MovaInt | Exp | Log
      | Rcp | Rsq | Sin | Cos | InterpLoadP0 | Max4 => 1,
      MulAdd | MulAddIeee | CndE | CndGt | CndGe => 3,
      _ => 2,
    }
  }

  pub fn is_kill(self) -> bool {
    matches!(self, AluOp::KillE | AluOp::KillGt | AluOp::KillGe | AluOp::KillNe)
  }

  pub fn is_pred_set(self) -> bool {
    matches!(
      self,
      AluOp::PredSetE | AluOp::PredSetGt | AluOp::PredSetGe | AluOp::PredSetNe
    )
  }

  /// Reduction instructions operate on all four lanes at once.
  pub fn is_reduction(self) -> bool {
    matches!(self, AluOp::Dot4 | AluOp::Dot4Ieee | AluOp::Max4 | AluOp::Cube)
  }

  /// Reductions with a single output replicated in every lane (Cube is the
  /// exception: its four lanes produce distinct values).
  pub fn is_replicate(self) -> bool {
    matches!(self, AluOp::Dot4 | AluOp::Dot4Ieee | AluOp::Max4)
  }

  /// Instructions whose four lanes must be issued together in one group.
  pub fn is_four_slot(self) -> bool {
    self.is_reduction() || matches!(self, AluOp::InterpXy | AluOp::InterpZw)
  }

  /// Transcendental unit only.
  pub fn is_trans_only(self) -> bool {
    matches!(
      self,
      AluOp::Exp | AluOp::Log | AluOp::Rcp | AluOp::Rsq | AluOp::Sin | AluOp::Cos
    )
  }

  /// Vector units only.
  pub fn is_vector_only(self) -> bool {
    self.is_reduction()
      || matches!(self, AluOp::InterpXy | AluOp::InterpZw | AluOp::InterpLoadP0)
  }

  pub fn name(self) -> &'static str {
    use AluOp::*;
    match self {
      Mov => "MOV",
      Add => "ADD",
      Mul => "MUL",
      MulIeee => "MUL_IEEE",
      Max => "MAX",
      Min => "MIN",
      SetE => "SETE",
      SetGt => "SETGT",
      SetGe => "SETGE",
      SetNe => "SETNE",
      Fract => "FRACT",
      Floor => "FLOOR",
      Trunc => "TRUNC",
      FltToInt => "FLT_TO_INT",
      IntToFlt => "INT_TO_FLT",
      PredSetE => "PRED_SETE",
      PredSetGt => "PRED_SETGT",
      PredSetGe => "PRED_SETGE",
      PredSetNe => "PRED_SETNE",
      KillE => "KILLE",
      KillGt => "KILLGT",
      KillGe => "KILLGE",
      KillNe => "KILLNE",
      Dot4 => "DOT4",
      Dot4Ieee => "DOT4_IEEE",
      Max4 => "MAX4",
      Cube => "CUBE",
      InterpXy => "INTERP_XY",
      InterpZw => "INTERP_ZW",
      InterpLoadP0 => "INTERP_LOAD_P0",
      MovaInt => "MOVA_INT",
      Exp => "EXP_IEEE",
      Log => "LOG_IEEE",
      Rcp => "RECIP_IEEE",
      Rsq => "RECIPSQRT_IEEE",
      Sin => "SIN",
      Cos => "COS",
      MulAdd => "MULADD",
      MulAddIeee => "MULADD_IEEE",
      CndE => "CNDE",
      CndGt => "CNDGT",
      CndGe => "CNDGE",
    }
  }
}

/// An ALU operand select.  Kcache addresses are absolute constant-buffer line
/// offsets; the clause-relative rebasing belongs to the binary encoder.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum AluSrcSel {
  Gpr(u32),
  Kcache { bank: u8, addr: u16 },
  Literal(u32),
  Zero,
  Half,
  One,
  /// Result of the previous cycle's vector slot selected by the chan field.
  PrevVec,
  /// Result of the previous cycle's trans slot.
  PrevScalar,
}

impl AluSrcSel {
  pub fn is_kcache(self) -> bool {
    matches!(self, AluSrcSel::Kcache { .. })
  }

  pub fn is_gpr(self) -> bool {
    matches!(self, AluSrcSel::Gpr(_))
  }
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct AluSrc {
  pub sel: AluSrcSel,
  pub chan: u8,
  pub neg: bool,
  pub abs: bool,
  pub rel: bool,
}

impl AluSrc {
  pub fn gpr(gpr: u32, chan: u8) -> Self {
    Self { sel: AluSrcSel::Gpr(gpr), chan, neg: false, abs: false, rel: false }
  }

  pub fn kcache(bank: u8, addr: u16, chan: u8) -> Self {
    Self {
      sel: AluSrcSel::Kcache { bank, addr },
      chan,
      neg: false,
      abs: false,
      rel: false,
    }
  }

  pub fn literal(value: f32) -> Self {
    Self {
      sel: AluSrcSel::Literal(value.to_bits()),
      chan: 0,
      neg: false,
      abs: false,
      rel: false,
    }
  }

  /// Value of an inline constant operand, with neg/abs applied.  None for
  /// GPR, kcache and previous-result operands (kcache values are only known
  /// to the driver).
  pub fn const_value(&self) -> Option<f32> {
    let base = match self.sel {
      AluSrcSel::Literal(bits) => f32::from_bits(bits),
      AluSrcSel::Zero => 0.0,
      AluSrcSel::Half => 0.5,
      AluSrcSel::One => 1.0,
      _ => return None,
    };
    let base = if self.abs { base.abs() } else { base };
    Some(if self.neg { -base } else { base })
  }
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct AluDst {
  pub gpr: u32,
  pub chan: u8,
  pub write: bool,
  pub clamp: bool,
  pub rel: bool,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct AluRecord {
  pub op: AluOp,
  pub dst: AluDst,
  pub src: [AluSrc; 3],
  /// Last instruction of its VLIW group.
  pub last: bool,
  /// Updates the predicate / active mask (PRED_SET* in a PUSH_BEFORE clause).
  pub predicate: bool,
  pub bank_swizzle: u8,
  pub bank_swizzle_force: bool,
}

impl AluRecord {
  pub fn new(op: AluOp, dst: AluDst, src: &[AluSrc]) -> Self {
    debug_assert!(src.len() == op.num_src());
    let mut s = [AluSrc::gpr(0, 0); 3];
    s[..src.len()].copy_from_slice(src);
    Self {
      op,
      dst,
      src: s,
      last: false,
      predicate: false,
      bank_swizzle: 0,
      bank_swizzle_force: false,
    }
  }

  pub fn srcs(&self) -> &[AluSrc] {
    &self.src[..self.op.num_src()]
  }

  pub fn srcs_mut(&mut self) -> &mut [AluSrc] {
    let n = self.op.num_src();
    &mut self.src[..n]
  }
}

//=============================================================================
// Fetch instructions

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum TexOp {
  Sample,
  SampleL,
  SampleLz,
  SampleC,
  SampleG,
  SampleCG,
  SetGradientsH,
  SetGradientsV,
}

impl TexOp {
  /// Samplers that consume the gradient pseudo-registers.
  pub fn uses_gradients(self) -> bool {
    matches!(self, TexOp::SampleG | TexOp::SampleCG)
  }
}

/// Source selects: 0-3 pick a channel of `src_gpr`, 4 is the constant 0,
/// 5 is the constant 1.  Destination selects: texel component q is written to
/// channel `dst_sel[q]`, 7 masks the component off.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TexRecord {
  pub op: TexOp,
  pub resource_id: u32,
  pub sampler_id: u32,
  pub src_gpr: u32,
  pub src_sel: [u8; 4],
  pub src_rel: bool,
  pub dst_gpr: u32,
  pub dst_sel: [u8; 4],
  pub dst_rel: bool,
}

/// Vertex fetch: one address component in, up to four dwords out, with the
/// same dst_sel semantics as TEX.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VtxRecord {
  pub buffer_id: u32,
  pub fetch_offset: u32,
  pub src_gpr: u32,
  pub src_sel_x: u8,
  pub src_rel: bool,
  pub dst_gpr: u32,
  pub dst_sel: [u8; 4],
}

//=============================================================================
// Control flow records

/// Payload of export and stream-out records.  For exports `swizzle` selects
/// what each output component reads (0-3 = channel, 4 = 0.0, 5 = 1.0, 7 =
/// undefined); for stream-out `comp_mask` gates channels instead.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct OutputRecord {
  pub array_base: u32,
  /// Export target kind (pixel / position / parameter); the final export of
  /// each kind carries the "done" flag after emission.
  pub out_type: u32,
  pub gpr: u32,
  pub rel: bool,
  pub swizzle: [u8; 4],
  pub comp_mask: u8,
  pub burst_count: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct KcacheSet {
  pub bank: u8,
  /// First locked line.
  pub addr: u16,
  /// Number of locked lines, 0 if the set is unused, at most 2.
  pub mode: u8,
}

pub type KcacheBanks = [KcacheSet; 4];

/// Reserve the kcache line `(bank, line)` in `sets`, using at most `nsets`
/// sets.  Returns false if the line cannot be covered, in which case `sets`
/// is unchanged.
pub fn alloc_kcache_line(
  sets: &mut KcacheBanks, nsets: usize, bank: u8, line: u16,
) -> bool {
  // Already covered?
  for s in sets[..nsets].iter() {
    if s.mode != 0
      && s.bank == bank
      && line >= s.addr
      && line < s.addr + s.mode as u16
    {
      return true;
    }
  }
  // Extend an adjacent single-line lock.
  for s in sets[..nsets].iter_mut() {
    if s.mode == 1 && s.bank == bank {
      if line == s.addr + 1 {
        s.mode = 2;
        return true;
      }
      if line + 1 == s.addr {
        s.addr = line;
        s.mode = 2;
        return true;
      }
    }
  }
  // Take a free set.
  for s in sets[..nsets].iter_mut() {
    if s.mode == 0 {
      s.bank = bank;
      s.addr = line;
      s.mode = 1;
      return true;
    }
  }
  false
}

/// Collect the literal dwords of `alu` into the group literal pool.  Returns
/// false if the group would need more than four literal dwords.
pub fn alu_group_literals(
  pool: &mut [u32; MAX_GROUP_LITERALS], count: &mut usize, alu: &AluRecord,
) -> bool {
  for src in alu.srcs() {
    if let AluSrcSel::Literal(bits) = src.sel {
      if pool[..*count].contains(&bits) {
        continue;
      }
      if *count == MAX_GROUP_LITERALS {
        return false;
      }
      pool[*count] = bits;
      *count += 1;
    }
  }
  true
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum CfKind {
  Alu { push_before: bool, insts: Vec<AluRecord>, kcache: KcacheBanks },
  Tex(Vec<TexRecord>),
  Vtx(Vec<VtxRecord>),
  Jump { target: u32, pop_count: u32 },
  Else { target: u32, pop_count: u32 },
  Pop { target: u32, pop_count: u32 },
  LoopStart { target: u32 },
  LoopEnd { target: u32 },
  LoopBreak { target: u32 },
  LoopContinue { target: u32 },
  Export { out: OutputRecord, done: bool },
  StreamOut { out: OutputRecord, stream: u8, buffer: u8 },
  CallFs,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CfRecord {
  /// Record address; jump/loop targets refer to these.
  pub id: u32,
  pub kind: CfKind,
  pub end_of_program: bool,
}

impl CfRecord {
  pub fn new(id: u32, kind: CfKind) -> Self {
    Self { id, kind, end_of_program: false }
  }
}

//=============================================================================
// Display (debug listing support)

impl fmt::Display for AluSrc {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    if self.neg {
      write!(fmt, "-")?;
    }
    if self.abs {
      write!(fmt, "|")?;
    }
    match self.sel {
      AluSrcSel::Gpr(g) => write!(fmt, "R{}.{}", g, CHANS[self.chan as usize])?,
      AluSrcSel::Kcache { bank, addr } => {
        write!(fmt, "KC{}[{}].{}", bank, addr, CHANS[self.chan as usize])?
      }
      AluSrcSel::Literal(bits) => write!(fmt, "[{:#x} {}]", bits, f32::from_bits(bits))?,
      AluSrcSel::Zero => write!(fmt, "0")?,
      AluSrcSel::Half => write!(fmt, "0.5")?,
      AluSrcSel::One => write!(fmt, "1")?,
      AluSrcSel::PrevVec => write!(fmt, "PV.{}", CHANS[self.chan as usize])?,
      AluSrcSel::PrevScalar => write!(fmt, "PS")?,
    }
    if self.abs {
      write!(fmt, "|")?;
    }
    Ok(())
  }
}

const CHANS: [char; 8] = ['x', 'y', 'z', 'w', '0', '1', '?', '_'];

impl fmt::Display for AluRecord {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:16}", self.op.name())?;
    if self.dst.write {
      write!(fmt, " R{}.{}", self.dst.gpr, CHANS[self.dst.chan as usize])?;
    } else {
      write!(fmt, " __.{}", CHANS[self.dst.chan as usize])?;
    }
    if self.dst.clamp {
      write!(fmt, " (clamp)")?;
    }
    for s in self.srcs() {
      write!(fmt, ", {}", s)?;
    }
    if self.last {
      write!(fmt, "  (last)")?;
    }
    Ok(())
  }
}

impl fmt::Display for CfRecord {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:4}: ", self.id)?;
    match &self.kind {
      CfKind::Alu { push_before, insts, .. } => {
        write!(fmt, "ALU{} ({} insts)", if *push_before { "_PUSH_BEFORE" } else { "" }, insts.len())
      }
      CfKind::Tex(t) => write!(fmt, "TEX ({} fetches)", t.len()),
      CfKind::Vtx(v) => write!(fmt, "VTX ({} fetches)", v.len()),
      CfKind::Jump { target, .. } => write!(fmt, "JUMP @{}", target),
      CfKind::Else { target, .. } => write!(fmt, "ELSE @{}", target),
      CfKind::Pop { target, .. } => write!(fmt, "POP @{}", target),
      CfKind::LoopStart { target } => write!(fmt, "LOOP_START @{}", target),
      CfKind::LoopEnd { target } => write!(fmt, "LOOP_END @{}", target),
      CfKind::LoopBreak { target } => write!(fmt, "LOOP_BREAK @{}", target),
      CfKind::LoopContinue { target } => write!(fmt, "LOOP_CONTINUE @{}", target),
      CfKind::Export { out, done } => write!(
        fmt,
        "EXPORT{} t{} base {} R{}",
        if *done { "_DONE" } else { "" },
        out.out_type,
        out.array_base,
        out.gpr
      ),
      CfKind::StreamOut { out, .. } => {
        write!(fmt, "MEM_STREAM base {} R{}", out.array_base, out.gpr)
      }
      CfKind::CallFs => write!(fmt, "CALL_FS"),
    }
  }
}

//=============================================================================
// Tests

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kcache_alloc_extends_and_fails() {
    let mut sets = KcacheBanks::default();
    assert!(alloc_kcache_line(&mut sets, 2, 0, 4));
    // Same line is free.
    assert!(alloc_kcache_line(&mut sets, 2, 0, 4));
    // Adjacent line extends the lock.
    assert!(alloc_kcache_line(&mut sets, 2, 0, 5));
    assert_eq!(sets[0].mode, 2);
    // Second set.
    assert!(alloc_kcache_line(&mut sets, 2, 1, 0));
    assert!(alloc_kcache_line(&mut sets, 2, 1, 1));
    // Both sets locked: a third distinct range must fail.
    assert!(!alloc_kcache_line(&mut sets, 2, 0, 9));
    // With four sets it fits.
    assert!(alloc_kcache_line(&mut sets, 4, 0, 9));
  }

  #[test]
  fn group_literals_dedup_and_limit() {
    let mut pool = [0u32; MAX_GROUP_LITERALS];
    let mut n = 0;
    let mk = |v: f32| {
      AluRecord::new(
        AluOp::Add,
        AluDst { gpr: 0, chan: 0, write: true, clamp: false, rel: false },
        &[AluSrc::gpr(0, 0), AluSrc::literal(v)],
      )
    };
    assert!(alu_group_literals(&mut pool, &mut n, &mk(1.0)));
    assert!(alu_group_literals(&mut pool, &mut n, &mk(1.0)));
    assert_eq!(n, 1);
    assert!(alu_group_literals(&mut pool, &mut n, &mk(2.0)));
    assert!(alu_group_literals(&mut pool, &mut n, &mk(3.0)));
    assert!(alu_group_literals(&mut pool, &mut n, &mk(4.0)));
    assert!(!alu_group_literals(&mut pool, &mut n, &mk(5.0)));
  }
}
