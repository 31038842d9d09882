/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Top-level interface of the optimizer.

use log::{debug, info};
use std::fmt;

use crate::analyze;
use crate::ast::OptSession;
use crate::bytecode::{CfRecord, IsaCaps};
use crate::coloring;
use crate::convert;
use crate::dump;
use crate::emit;
use crate::liveness;
use crate::parse;
use crate::sched_alu;
use crate::sched_global;
use crate::ssa;

/// Why the optimizer gave up on a shader.  On any error the caller must keep
/// using the original, unoptimized record sequence; a partially transformed
/// program is never returned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptError {
  /// The shader uses relative (indirect) addressing in a position the
  /// optimizer does not support.  Detected structurally while building the
  /// tree.
  UnsupportedRelAddr,
  /// Some phi or parallel-copy operands were left uncoalesced and the copy
  /// insertion pass is not implemented; the result would need copies we
  /// cannot place.
  InsertCopiesFailed,
  /// The clause scheduler could not make progress (an instruction group
  /// emptied out repeatedly).
  ScheduleFailed,
}

impl fmt::Display for OptError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      OptError::UnsupportedRelAddr => {
        write!(fmt, "relative addressing is not supported")
      }
      OptError::InsertCopiesFailed => {
        write!(fmt, "uncoalesced copies; copy insertion pass needed")
      }
      OptError::ScheduleFailed => write!(fmt, "clause scheduling failed"),
    }
  }
}

/// Per-shader knobs supplied by the embedder.
#[derive(Clone, Copy, Debug)]
pub struct Options {
  /// Highest GPR preloaded with shader inputs, if any.  Uses of never-defined
  /// GPRs at or below this index are pinned inputs; above it they are
  /// undefined values.
  pub last_input_gpr: Option<u32>,
}

impl Default for Options {
  fn default() -> Self {
    Self { last_input_gpr: None }
  }
}

/// Size metrics of a shader, before and after optimization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderStats {
  /// Control-flow records.
  pub ncf: u32,
  /// ALU slot instructions.
  pub nalu: u32,
  /// Texture/vertex fetches.
  pub nfetch: u32,
  /// VLIW instruction groups.
  pub nalugroups: u32,
  /// GPRs referenced.
  pub ngpr: u32,
  /// Control-flow nesting depth (stack entries).
  pub nstack: u32,
}

impl ShaderStats {
  pub fn accumulate(&mut self, other: &ShaderStats) {
    self.ncf += other.ncf;
    self.nalu += other.nalu;
    self.nfetch += other.nfetch;
    self.nalugroups += other.nalugroups;
    self.ngpr += other.ngpr;
    self.nstack += other.nstack;
  }
}

/// before -> after comparison, printable as a one-liner.
pub struct StatsDiff {
  pub before: ShaderStats,
  pub after: ShaderStats,
}

fn pct(before: u32, after: u32) -> f64 {
  if before == 0 {
    0.0
  } else {
    (-1.0 + after as f64 / before as f64) * 100.0
  }
}

impl fmt::Display for StatsDiff {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(
      fmt,
      "alu {:+.1}% ( {} -> {} ),  groups {:+.1}% ( {} -> {} ),  gpr {:+.1}% ( {} -> {} )",
      pct(self.before.nalu, self.after.nalu),
      self.before.nalu,
      self.after.nalu,
      pct(self.before.nalugroups, self.after.nalugroups),
      self.before.nalugroups,
      self.after.nalugroups,
      pct(self.before.ngpr, self.after.ngpr),
      self.before.ngpr,
      self.after.ngpr,
    )
  }
}

/// A successfully optimized shader: the new record sequence plus size
/// metrics for both versions.
pub struct OptimizedShader {
  pub records: Vec<CfRecord>,
  pub stats: StatsDiff,
}

/// Optimize one shader.  `records` is the flat control-flow record sequence
/// produced by the naive code generator; on success the returned sequence is
/// semantically equivalent and typically smaller and better packed.
pub fn optimize_shader(
  records: &[CfRecord], caps: IsaCaps, opts: &Options,
) -> Result<OptimizedShader, OptError> {
  let mut s = OptSession::new(caps, opts.last_input_gpr);

  // Parse the source records into the structured tree.
  parse::parse_shader(&mut s, records)?;
  convert::convert_cf(&mut s);

  // Construct SSA form.
  ssa::build_ssa(&mut s);
  liveness::liveness(&mut s);

  analyze::propagate_copy(&mut s);
  s.reset_interferences();
  liveness::liveness(&mut s);

  analyze::analyze_vars(&mut s);

  // Global scheduling (fetch combining and block reordering).
  sched_global::gs_schedule(&mut s);

  s.reset_interferences();
  liveness::liveness(&mut s);

  // Register allocation.
  coloring::color(&mut s);
  coloring::coalesce(&mut s);

  dump::dump_shader_tree(&s);
  dump::dump_var_table(&s);

  // Check for uncoalesced phi / live-interval-split vars.  Inserting the
  // missing copies is not implemented; fall back instead.
  if !coloring::insert_copies(&mut s) {
    info!("optimization failed: need copy insertion pass");
    return Err(OptError::InsertCopiesFailed);
  }

  s.liveness_correct = false;

  // ALU clause scheduling.
  if !sched_alu::post_schedule(&mut s) {
    info!("optimization failed: scheduler failure");
    return Err(OptError::ScheduleFailed);
  }

  dump::dump_shader_tree(&s);

  // Rebuild the record sequence.
  let records = emit::build_shader(&mut s);

  debug!(
    "shader optimized: {}",
    StatsDiff { before: s.stats[0], after: s.stats[1] }
  );

  Ok(OptimizedShader {
    records,
    stats: StatsDiff { before: s.stats[0], after: s.stats[1] },
  })
}
