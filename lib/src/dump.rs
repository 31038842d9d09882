/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Debug listing of the tree and the variable table.  Everything goes
//! through the `log` facade at trace level; this is a development aid, not a
//! stable interface.

use log::{log_enabled, trace, Level};

use crate::ast::{NodeSubtype, NodeType, OptSession};
use crate::data_structures::{NodeIx, SortedSet, VarIx};
use crate::vars::{color_chan, color_reg, REG_SPECIAL, REG_TEMP};

fn var_str(s: &OptSession, v: VarIx) -> String {
  let vd = s.var(v);
  let reg = if vd.reg & REG_TEMP != 0 {
    format!("t{}", vd.reg & !REG_TEMP)
  } else if vd.reg & REG_SPECIAL != 0 {
    format!("S{}", vd.reg & !REG_SPECIAL)
  } else {
    format!("R{}", vd.reg)
  };
  let chan = match vd.chan {
    0 => "x",
    1 => "y",
    2 => "z",
    3 => "w",
    _ => "?",
  };
  let mut out = format!("{}.{}.{}", reg, chan, vd.index);
  if vd.color != 0 {
    out.push_str(&format!("@{}.{}", color_reg(vd.color), color_chan(vd.color)));
  }
  if vd.dead {
    out.push('!');
  }
  out
}

fn vset_str(s: &OptSession, set: &SortedSet<VarIx>) -> String {
  let mut out = String::from("[");
  for (i, &v) in set.iter().enumerate() {
    if i > 0 {
      out.push(' ');
    }
    out.push_str(&var_str(s, v));
  }
  out.push(']');
  out
}

fn opt_vars_str(s: &OptSession, vars: &[Option<VarIx>]) -> String {
  let mut out = String::from("(");
  for (i, v) in vars.iter().enumerate() {
    if i > 0 {
      out.push(' ');
    }
    match v {
      Some(v) => out.push_str(&var_str(s, *v)),
      None => out.push('_'),
    }
  }
  out.push(')');
  out
}

fn node_desc(s: &OptSession, n: NodeIx) -> String {
  let node = s.node(n);
  let kind = match node.kind {
    NodeType::Region => "region",
    NodeType::Depart => "depart",
    NodeType::Repeat => "repeat",
    NodeType::If => "if",
    NodeType::List => "list",
    NodeType::Op => "op",
    NodeType::Group => "group",
  };
  let subtype = match node.subtype {
    NodeSubtype::None => "",
    NodeSubtype::Root => " root",
    NodeSubtype::Phi => " phi",
    NodeSubtype::Copy => " copy",
    NodeSubtype::AluClause => " alu_clause",
    NodeSubtype::AluGroup => " alu_group",
    NodeSubtype::AluInst => " alu",
    NodeSubtype::TexInst => " tex",
    NodeSubtype::VtxInst => " vtx",
    NodeSubtype::CfInst => " cf",
    NodeSubtype::LoopRegion => " loop",
    NodeSubtype::IfElseRegion => " if_else",
    NodeSubtype::LoopBreak => " break",
    NodeSubtype::LoopContinue => " continue",
  };
  let mut out = format!("{}{}", kind, subtype);
  if node.dead {
    out.push_str(" DEAD");
  }
  if !node.outs.is_empty() {
    out.push_str(&format!(" outs{}", opt_vars_str(s, &node.outs)));
  }
  if !node.ins.is_empty() {
    out.push_str(&format!(" ins{}", opt_vars_str(s, &node.ins)));
  }
  if let Some(alu) = &node.alu {
    out.push_str(&format!("  {}", alu));
  }
  out
}

fn dump_node(s: &OptSession, n: NodeIx, level: usize) {
  trace!("{:indent$}{}", "", node_desc(s, n), indent = level * 2);

  if s.liveness_correct {
    if let Some(live) = &s.node(n).vars_live {
      trace!("{:indent$}live: {}", "", vset_str(s, live), indent = level * 2);
    }
  }

  if let Some(p) = s.node(n).loop_phi {
    trace!("{:indent$}loop_phi:", "", indent = level * 2);
    dump_node(s, p, level + 1);
  }
  if let Some(c) = s.node(n).child {
    dump_node(s, c, level + 1);
  }
  if let Some(p) = s.node(n).phi {
    trace!("{:indent$}phi:", "", indent = level * 2);
    dump_node(s, p, level + 1);
  }
  if let Some(r) = s.node(n).rest {
    dump_node(s, r, level);
  }
}

pub fn dump_shader_tree(s: &OptSession) {
  if !log_enabled!(Level::Trace) {
    return;
  }
  trace!("===== shader tree =====");
  dump_node(s, s.root, 0);
}

pub fn dump_var_table(s: &OptSession) {
  if !log_enabled!(Level::Trace) {
    return;
  }
  trace!("===== variables =====");
  for i in 0..s.num_vars() {
    let v = VarIx::new(i as u32);
    let vd = s.var(v);
    if vd.dead && vd.uses.is_empty() {
      continue;
    }
    trace!(
      "{}  uses:{} intf:{} {}{}{}{}",
      var_str(s, v),
      vd.uses.card(),
      vd.interferences.card(),
      if vd.fixed { "fixed " } else { "" },
      if vd.pin_chan { "pin_chan " } else { "" },
      if vd.pin_reg { "pin_reg " } else { "" },
      if vd.undefined { "undef" } else { "" },
    );
  }
}
