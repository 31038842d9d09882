/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Command-line driver for separate testing of the sbopt library: pick a
//! constructed test case or parse a shader file, optimize it, print both
//! record streams, and run the reference interpreter over both to check
//! equivalence.

mod parser;
mod test_cases;
mod test_framework;

use log::{error, info};

use sbopt::bytecode::{CfKind, CfRecord, IsaCaps};
use sbopt::{optimize_shader, Options};

use test_framework::check_equivalence;

fn print_records(title: &str, records: &[CfRecord]) {
  println!("---- {} ----", title);
  for r in records {
    println!("{}", r);
    match &r.kind {
      CfKind::Alu { insts, .. } => {
        for inst in insts {
          println!("      {}", inst);
        }
      }
      CfKind::Tex(fetches) => {
        for t in fetches {
          println!(
            "      {:?} t{} s{} R{} <- R{}",
            t.op, t.resource_id, t.sampler_id, t.dst_gpr, t.src_gpr
          );
        }
      }
      CfKind::Vtx(fetches) => {
        for v in fetches {
          println!(
            "      FETCH b{} o{} R{} <- R{}",
            v.buffer_id, v.fetch_offset, v.dst_gpr, v.src_gpr
          );
        }
      }
      _ => {}
    }
  }
}

fn main() {
  pretty_env_logger::init();

  let matches = clap::Command::new("sbopt-util")
    .about("a simple program to allow separate testing of the sbopt library")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("file")
        .short('f')
        .takes_value(true)
        .help("shader file to parse and optimize"),
    )
    .arg(
      clap::Arg::new("slots")
        .short('s')
        .takes_value(true)
        .default_value("5")
        .help("issue slots (4 or 5)"),
    )
    .arg(
      clap::Arg::new("inputs")
        .short('i')
        .takes_value(true)
        .default_value("0")
        .help("last GPR preloaded with inputs"),
    )
    .get_matches();

  let caps = match matches.value_of("slots") {
    Some("4") => IsaCaps::four_slot(),
    Some("5") => IsaCaps::five_slot(),
    other => {
      error!("invalid slot count {:?}", other);
      return;
    }
  };

  let (records, options) = if let Some(name) = matches.value_of("test") {
    match test_cases::find_test_case(name) {
      Ok(case) => (case.records, case.options),
      Err(names) => {
        error!("can't find test case '{}'", name);
        println!("available test cases:");
        for n in names {
          println!("     {}", n);
        }
        return;
      }
    }
  } else if let Some(path) = matches.value_of("file") {
    let text = match std::fs::read_to_string(path) {
      Ok(t) => t,
      Err(e) => {
        error!("can't read '{}': {}", path, e);
        return;
      }
    };
    let records = match parser::parse_shader_text(&text) {
      Ok(r) => r,
      Err(e) => {
        error!("parse error: {}", e);
        return;
      }
    };
    let last_input_gpr: Option<u32> =
      matches.value_of("inputs").and_then(|v| v.parse().ok());
    (records, Options { last_input_gpr })
  } else {
    error!("pass a test case (-t) or a shader file (-f)");
    return;
  };

  print_records("before optimization", &records);

  let out = match optimize_shader(&records, caps, &options) {
    Ok(out) => out,
    Err(e) => {
      println!("optimization skipped: {} (falling back to original)", e);
      return;
    }
  };

  print_records("after optimization", &out.records);
  println!("stats: {}", out.stats);

  info!("running both versions through the interpreter");
  match check_equivalence(&records, &out.records) {
    Ok(()) => println!("interpreter check: outputs identical"),
    Err(msg) => {
      println!("interpreter check FAILED: {}", msg);
      std::process::exit(1);
    }
  }
}
