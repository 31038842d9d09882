/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Parser for a small textual shader format, so test inputs can live in
//! files and the driver can run arbitrary shaders.  Structured statements
//! (loop / if / else) are flattened into jump/loop records with resolved
//! addresses via the ShaderBuilder.
//!
//! Example:
//!
//! ```text
//! ; counter loop
//! alu { mov r1.x, l0.0 }
//! loop {
//!   alu_push { pred_setgt! __.x, r1.x, l3.0 }
//!   if { break }
//!   alu { add r1.x, r1.x, l1.0 }
//! }
//! export pix 0 r1.x001
//! ```

use sbopt::bytecode::*;

use crate::test_framework::ShaderBuilder;

#[derive(Debug)]
pub struct ParseError {
  pub line: usize,
  pub msg: String,
}

impl std::fmt::Display for ParseError {
  fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(fmt, "line {}: {}", self.line, self.msg)
  }
}

struct Tokens {
  toks: Vec<(usize, String)>,
  pos: usize,
}

impl Tokens {
  fn new(text: &str) -> Self {
    let mut toks = vec![];
    for (ln, line) in text.lines().enumerate() {
      let line = match line.find(|c| c == ';' || c == '#') {
        Some(p) => &line[..p],
        None => line,
      };
      let mut cur = String::new();
      for c in line.chars() {
        match c {
          '{' | '}' | ',' | '[' | ']' => {
            if !cur.is_empty() {
              toks.push((ln + 1, std::mem::take(&mut cur)));
            }
            toks.push((ln + 1, c.to_string()));
          }
          c if c.is_whitespace() => {
            if !cur.is_empty() {
              toks.push((ln + 1, std::mem::take(&mut cur)));
            }
          }
          c => cur.push(c),
        }
      }
      if !cur.is_empty() {
        toks.push((ln + 1, cur));
      }
    }
    Self { toks, pos: 0 }
  }

  fn line(&self) -> usize {
    self
      .toks
      .get(self.pos.min(self.toks.len().saturating_sub(1)))
      .map_or(0, |t| t.0)
  }

  fn err<T>(&self, msg: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError { line: self.line(), msg: msg.into() })
  }

  fn peek(&self) -> Option<&str> {
    self.toks.get(self.pos).map(|t| t.1.as_str())
  }

  fn next(&mut self) -> Result<String, ParseError> {
    match self.toks.get(self.pos) {
      Some(t) => {
        self.pos += 1;
        Ok(t.1.clone())
      }
      None => self.err("unexpected end of input"),
    }
  }

  fn expect(&mut self, tok: &str) -> Result<(), ParseError> {
    let t = self.next()?;
    if t == tok {
      Ok(())
    } else {
      self.err(format!("expected '{}', found '{}'", tok, t))
    }
  }

  fn accept(&mut self, tok: &str) -> bool {
    if self.peek() == Some(tok) {
      self.pos += 1;
      true
    } else {
      false
    }
  }
}

fn chan_of(c: char) -> Option<u8> {
  match c {
    'x' => Some(0),
    'y' => Some(1),
    'z' => Some(2),
    'w' => Some(3),
    _ => None,
  }
}

fn swizzle_sel(c: char) -> Option<u8> {
  match c {
    'x' | 'y' | 'z' | 'w' => chan_of(c),
    '0' => Some(4),
    '1' => Some(5),
    '_' => Some(7),
    _ => None,
  }
}

fn parse_reg(tok: &str) -> Option<(u32, u8)> {
  // rN.c
  let rest = tok.strip_prefix('r')?;
  let dot = rest.find('.')?;
  let gpr: u32 = rest[..dot].parse().ok()?;
  let mut chans = rest[dot + 1..].chars();
  let chan = chan_of(chans.next()?)?;
  if chans.next().is_some() {
    return None;
  }
  Some((gpr, chan))
}

fn alu_op_by_name(name: &str) -> Option<AluOp> {
  use AluOp::*;
  Some(match name {
    "mov" => Mov,
    "add" => Add,
    "mul" => Mul,
    "mul_ieee" => MulIeee,
    "max" => Max,
    "min" => Min,
    "sete" => SetE,
    "setgt" => SetGt,
    "setge" => SetGe,
    "setne" => SetNe,
    "fract" => Fract,
    "floor" => Floor,
    "trunc" => Trunc,
    "flt_to_int" => FltToInt,
    "int_to_flt" => IntToFlt,
    "pred_sete" => PredSetE,
    "pred_setgt" => PredSetGt,
    "pred_setge" => PredSetGe,
    "pred_setne" => PredSetNe,
    "kille" => KillE,
    "killgt" => KillGt,
    "killge" => KillGe,
    "killne" => KillNe,
    "dot4" => Dot4,
    "dot4_ieee" => Dot4Ieee,
    "max4" => Max4,
    "cube" => Cube,
    "interp_xy" => InterpXy,
    "interp_zw" => InterpZw,
    "interp_load_p0" => InterpLoadP0,
    "mova_int" => MovaInt,
    "exp" => Exp,
    "log" => Log,
    "rcp" => Rcp,
    "rsq" => Rsq,
    "sin" => Sin,
    "cos" => Cos,
    "muladd" => MulAdd,
    "muladd_ieee" => MulAddIeee,
    "cnde" => CndE,
    "cndgt" => CndGt,
    "cndge" => CndGe,
    _ => return None,
  })
}

struct Parser<'a> {
  t: Tokens,
  b: &'a mut ShaderBuilder,
}

impl<'a> Parser<'a> {
  fn parse_src(&mut self) -> Result<AluSrc, ParseError> {
    let mut tok = self.t.next()?;

    let mut neg = false;
    let mut abs = false;
    if let Some(rest) = tok.strip_prefix('-') {
      neg = true;
      tok = rest.to_string();
    }
    if let Some(rest) = tok.strip_prefix('|') {
      abs = true;
      tok = rest
        .strip_suffix('|')
        .ok_or_else(|| ParseError {
          line: self.t.line(),
          msg: "unterminated |..|".into(),
        })?
        .to_string();
    }

    let mut src = if let Some((gpr, chan)) = parse_reg(&tok) {
      AluSrc::gpr(gpr, chan)
    } else if let Some(rest) = tok.strip_prefix("kc") {
      // kcB[addr].c
      let bank: u8 = rest
        .parse()
        .map_err(|_| ParseError { line: self.t.line(), msg: "bad kcache bank".into() })?;
      self.t.expect("[")?;
      let addr: u16 = self.t.next()?.parse().map_err(|_| ParseError {
        line: self.t.line(),
        msg: "bad kcache address".into(),
      })?;
      self.t.expect("]")?;
      let chan_tok = self.t.next()?;
      let chan = chan_tok
        .strip_prefix('.')
        .and_then(|c| c.chars().next())
        .and_then(chan_of)
        .ok_or_else(|| ParseError {
          line: self.t.line(),
          msg: "bad kcache channel".into(),
        })?;
      AluSrc::kcache(bank, addr, chan)
    } else if let Some(lit) = tok.strip_prefix('l') {
      let val: f32 = lit.parse().map_err(|_| ParseError {
        line: self.t.line(),
        msg: format!("bad literal '{}'", lit),
      })?;
      AluSrc::literal(val)
    } else if let Some(rest) = tok.strip_prefix("pv.") {
      let chan = rest.chars().next().and_then(chan_of).ok_or_else(|| {
        ParseError { line: self.t.line(), msg: "bad pv channel".into() }
      })?;
      AluSrc {
        sel: AluSrcSel::PrevVec,
        chan,
        neg: false,
        abs: false,
        rel: false,
      }
    } else if tok == "ps" {
      AluSrc {
        sel: AluSrcSel::PrevScalar,
        chan: 0,
        neg: false,
        abs: false,
        rel: false,
      }
    } else if tok == "0" {
      AluSrc { sel: AluSrcSel::Zero, chan: 0, neg: false, abs: false, rel: false }
    } else if tok == "0.5" {
      AluSrc { sel: AluSrcSel::Half, chan: 0, neg: false, abs: false, rel: false }
    } else if tok == "1" {
      AluSrc { sel: AluSrcSel::One, chan: 0, neg: false, abs: false, rel: false }
    } else {
      return self.t.err(format!("bad source operand '{}'", tok));
    };

    src.neg = neg;
    src.abs = abs;
    Ok(src)
  }

  fn parse_alu_inst(&mut self, op_tok: &str) -> Result<AluRecord, ParseError> {
    let mut grouped = false;
    let mut name = op_tok;
    if let Some(rest) = name.strip_prefix('+') {
      grouped = true;
      name = rest;
    }

    let mut predicate = false;
    let mut clamp = false;
    let mut base = name.to_string();
    if let Some(rest) = base.strip_suffix('!') {
      predicate = true;
      base = rest.to_string();
    }
    if let Some(rest) = base.strip_suffix("_sat") {
      clamp = true;
      base = rest.to_string();
    }

    let op = match alu_op_by_name(&base) {
      Some(op) => op,
      None => return self.t.err(format!("unknown alu op '{}'", base)),
    };

    // Destination: rN.c, or __ / __.c for no write.
    let dst_tok = self.t.next()?;
    let d = if let Some((gpr, chan)) = parse_reg(&dst_tok) {
      AluDst { gpr, chan, write: true, clamp, rel: false }
    } else if dst_tok == "__" || dst_tok.starts_with("__.") {
      let chan = dst_tok
        .strip_prefix("__.")
        .and_then(|c| c.chars().next())
        .and_then(chan_of)
        .unwrap_or(0);
      AluDst { gpr: 0, chan, write: false, clamp, rel: false }
    } else {
      return self.t.err(format!("bad destination '{}'", dst_tok));
    };

    let mut srcs = vec![];
    for i in 0..op.num_src() {
      if i > 0 || op.num_src() > 0 {
        self.t.expect(",")?;
      }
      srcs.push(self.parse_src()?);
    }

    // `last` flags are fixed up by the clause loop: an instruction starting
    // with '+' joins the previous group by clearing the previous `last`.
    let _ = grouped;
    let mut inst = AluRecord::new(op, d, &srcs);
    inst.predicate = predicate;
    inst.last = true;
    Ok(inst)
  }

  fn parse_alu_clause(&mut self) -> Result<Vec<AluRecord>, ParseError> {
    self.t.expect("{")?;
    let mut insts: Vec<AluRecord> = vec![];
    loop {
      let tok = self.t.next()?;
      if tok == "}" {
        break;
      }
      let grouped = tok.starts_with('+');
      let inst = self.parse_alu_inst(&tok)?;
      if grouped {
        // Joining the previous group: shift the group-end flag.
        if let Some(prev) = insts.last_mut() {
          prev.last = false;
        }
      }
      insts.push(inst);
    }
    if insts.is_empty() {
      return self.t.err("empty alu clause");
    }
    // The clause always ends a group.
    insts.last_mut().unwrap().last = true;
    Ok(insts)
  }

  fn parse_swizzled_gpr(
    &mut self, tok: &str,
  ) -> Result<(u32, [u8; 4]), ParseError> {
    // rN.ssss with s in xyzw01_
    let rest = match tok.strip_prefix('r') {
      Some(r) => r,
      None => return self.t.err(format!("bad register '{}'", tok)),
    };
    let dot = match rest.find('.') {
      Some(d) => d,
      None => return self.t.err("missing swizzle"),
    };
    let gpr: u32 = match rest[..dot].parse() {
      Ok(g) => g,
      Err(_) => return self.t.err("bad register index"),
    };
    let swz_str: Vec<char> = rest[dot + 1..].chars().collect();
    if swz_str.len() != 4 {
      return self.t.err("swizzle must have four components");
    }
    let mut swz = [7u8; 4];
    for (i, c) in swz_str.iter().enumerate() {
      swz[i] = match swizzle_sel(*c) {
        Some(s) => s,
        None => return self.t.err(format!("bad swizzle component '{}'", c)),
      };
    }
    Ok((gpr, swz))
  }

  fn parse_stmt(&mut self, tok: &str) -> Result<(), ParseError> {
    match tok {
      "alu" => {
        let insts = self.parse_alu_clause()?;
        self.b.alu(insts);
      }
      "alu_push" => {
        let insts = self.parse_alu_clause()?;
        self.b.alu_push_before(insts);
      }
      "loop" => {
        self.t.expect("{")?;
        let stmts = self.collect_block()?;
        self.b.begin_loop();
        self.replay_block(stmts)?;
        self.b.finish_loop();
      }
      "if" => {
        self.t.expect("{")?;
        let then_stmts = self.collect_block()?;
        if self.t.accept("else") {
          self.t.expect("{")?;
          let else_stmts = self.collect_block()?;
          self.b.begin_if_else();
          self.replay_block(then_stmts)?;
          self.b.begin_else();
          self.replay_block(else_stmts)?;
          self.b.finish_if_else();
        } else {
          self.b.begin_if();
          self.replay_block(then_stmts)?;
          self.b.finish_if();
        }
      }
      "break" => {
        self.b.loop_break();
      }
      "continue" => {
        self.b.loop_continue();
      }
      "export" => {
        let kind_tok = self.t.next()?;
        let out_type = match kind_tok.as_str() {
          "pix" => 0,
          "pos" => 1,
          "param" => 2,
          _ => return self.t.err("export kind must be pix/pos/param"),
        };
        let base: u32 = self.t.next()?.parse().map_err(|_| ParseError {
          line: self.t.line(),
          msg: "bad export base".into(),
        })?;
        let reg_tok = self.t.next()?;
        let (gpr, swz) = self.parse_swizzled_gpr(&reg_tok)?;
        self.b.export_typed(out_type, base, gpr, swz);
      }
      "callfs" => {
        self.b.callfs();
      }
      "sample" | "sample_g" | "gradh" | "gradv" => {
        self.parse_tex_stmt(tok)?;
      }
      "vfetch" => {
        self.parse_vtx_stmt()?;
      }
      _ => return self.t.err(format!("unknown statement '{}'", tok)),
    }
    Ok(())
  }

  fn parse_tex_stmt(&mut self, tok: &str) -> Result<(), ParseError> {
    let op = match tok {
      "sample" => TexOp::Sample,
      "sample_g" => TexOp::SampleG,
      "gradh" => TexOp::SetGradientsH,
      "gradv" => TexOp::SetGradientsV,
      _ => unreachable!(),
    };

    let (resource, sampler) = if op == TexOp::SetGradientsH
      || op == TexOp::SetGradientsV
    {
      (0, 0)
    } else {
      let r_tok = self.t.next()?;
      let resource: u32 = r_tok
        .strip_prefix('t')
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ParseError {
          line: self.t.line(),
          msg: "bad texture resource".into(),
        })?;
      let s_tok = self.t.next()?;
      let sampler: u32 = s_tok
        .strip_prefix('s')
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| ParseError {
          line: self.t.line(),
          msg: "bad sampler".into(),
        })?;
      (resource, sampler)
    };

    let (dst_gpr, dst_sel) =
      if op == TexOp::SetGradientsH || op == TexOp::SetGradientsV {
        (0, [7u8; 4])
      } else {
        let tok = self.t.next()?;
        let r = self.parse_swizzled_gpr(&tok)?;
        self.t.expect(",")?;
        r
      };

    let src_tok = self.t.next()?;
    let (src_gpr, src_sel) = self.parse_swizzled_gpr(&src_tok)?;

    self.b.tex(vec![TexRecord {
      op,
      resource_id: resource,
      sampler_id: sampler,
      src_gpr,
      src_sel,
      src_rel: false,
      dst_gpr,
      dst_sel,
      dst_rel: false,
    }]);
    Ok(())
  }

  fn parse_vtx_stmt(&mut self) -> Result<(), ParseError> {
    let b_tok = self.t.next()?;
    let buffer: u32 = b_tok
      .strip_prefix('b')
      .and_then(|t| t.parse().ok())
      .ok_or_else(|| ParseError {
        line: self.t.line(),
        msg: "bad vertex buffer".into(),
      })?;
    let o_tok = self.t.next()?;
    let offset: u32 = o_tok
      .strip_prefix('o')
      .and_then(|t| t.parse().ok())
      .ok_or_else(|| ParseError {
        line: self.t.line(),
        msg: "bad fetch offset".into(),
      })?;
    let dst_tok = self.t.next()?;
    let (dst_gpr, dst_sel) = self.parse_swizzled_gpr(&dst_tok)?;
    self.t.expect(",")?;
    let src_tok = self.t.next()?;
    let (src_gpr, src_chan) = match parse_reg(&src_tok) {
      Some(r) => r,
      None => return self.t.err("bad fetch address register"),
    };

    self.b.vtx(vec![VtxRecord {
      buffer_id: buffer,
      fetch_offset: offset,
      src_gpr,
      src_sel_x: src_chan,
      src_rel: false,
      dst_gpr,
      dst_sel,
    }]);
    Ok(())
  }

  /// Consume a brace-balanced token block (after the opening brace).
  fn collect_block(&mut self) -> Result<Vec<(usize, String)>, ParseError> {
    let mut depth = 1;
    let mut toks = vec![];
    loop {
      let line = self.t.line();
      let tok = self.t.next()?;
      match tok.as_str() {
        "{" => depth += 1,
        "}" => {
          depth -= 1;
          if depth == 0 {
            break;
          }
        }
        _ => {}
      }
      if depth > 0 {
        toks.push((line, tok));
      }
    }
    Ok(toks)
  }

  /// Parse a previously collected block in the current builder position.
  fn replay_block(
    &mut self, toks: Vec<(usize, String)>,
  ) -> Result<(), ParseError> {
    let saved = std::mem::replace(&mut self.t, Tokens { toks, pos: 0 });
    let mut result = Ok(());
    while self.t.peek().is_some() {
      let tok = match self.t.next() {
        Ok(t) => t,
        Err(e) => {
          result = Err(e);
          break;
        }
      };
      if let Err(e) = self.parse_stmt(&tok) {
        result = Err(e);
        break;
      }
    }
    self.t = saved;
    result
  }
}

/// Parse a textual shader into a record stream.
pub fn parse_shader_text(text: &str) -> Result<Vec<CfRecord>, ParseError> {
  let mut b = ShaderBuilder::new();
  {
    let mut p = Parser { t: Tokens::new(text), b: &mut b };
    while p.t.peek().is_some() {
      let tok = p.t.next()?;
      p.parse_stmt(&tok)?;
    }
  }
  Ok(b.finish())
}
