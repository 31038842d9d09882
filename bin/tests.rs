/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Integration tests: every constructed test case is optimized for both
//! architecture variants and the result is executed by the reference
//! interpreter against the original on a battery of inputs.

use sbopt::bytecode::{CfKind, IsaCaps};
use sbopt::{optimize_shader, OptError};

use crate::parser::parse_shader_text;
use crate::test_cases::{all_test_cases, find_test_case};
use crate::test_framework::{check_equivalence, run_shader, test_consts, test_inputs};

/// Cases where the optimizer must succeed outright.  The remaining cases are
/// allowed to fall back (an Err means the caller keeps the original
/// bytecode, which is trivially equivalent), but must be equivalent whenever
/// they do optimize.
const MUST_OPTIMIZE: &[&str] = &[
  "mov-coalesce",
  "straight20",
  "dead-code",
  "kcache",
  "trans-ops",
  "clamp-prop",
  "kill",
  "copy-chain",
];

#[test]
fn all_cases_equivalent_after_optimization() {
  for caps in &[IsaCaps::five_slot(), IsaCaps::four_slot()] {
    for case in all_test_cases() {
      match optimize_shader(&case.records, *caps, &case.options) {
        Ok(out) => {
          if let Err(msg) = check_equivalence(&case.records, &out.records) {
            panic!(
              "case '{}' ({} slots): {}",
              case.name, caps.max_slots, msg
            );
          }
        }
        Err(e) => {
          assert!(
            !MUST_OPTIMIZE.contains(&case.name),
            "case '{}' ({} slots) unexpectedly fell back: {}",
            case.name,
            caps.max_slots,
            e
          );
          // Fallback keeps the original bytecode; nothing else to check.
          assert!(matches!(
            e,
            OptError::InsertCopiesFailed | OptError::ScheduleFailed
          ));
        }
      }
    }
  }
}

#[test]
fn optimizer_never_grows_alu_count() {
  for case in all_test_cases() {
    if let Ok(out) =
      optimize_shader(&case.records, IsaCaps::five_slot(), &case.options)
    {
      assert!(
        out.stats.after.nalu <= out.stats.before.nalu,
        "case '{}' grew from {} to {} alu instructions",
        case.name,
        out.stats.before.nalu,
        out.stats.after.nalu
      );
    }
  }
}

#[test]
fn relative_addressing_is_skipped() {
  let mut case = find_test_case("straight20").unwrap();
  if let CfKind::Alu { insts, .. } = &mut case.records[0].kind {
    insts[0].dst.rel = true;
  }
  let r = optimize_shader(&case.records, IsaCaps::five_slot(), &case.options);
  assert!(matches!(r, Err(OptError::UnsupportedRelAddr)));
}

#[test]
fn parser_roundtrips_through_interpreter() {
  let text = r#"
    ; counter loop with break
    alu { mov r1.x, l0.0 }
    loop {
      alu_push { pred_setgt! __.x, r1.x, l3.0 }
      if { break }
      alu { add r1.x, r1.x, l1.0 }
    }
    export pix 0 r1.x001
  "#;
  let records = parse_shader_text(text).expect("parse failed");

  let consts = test_consts();
  for inputs in test_inputs() {
    let r = run_shader(&records, &inputs, &consts).expect("run failed");
    // Counter counts 0..=4 (first value above 3).
    assert_eq!(r.exports.len(), 1);
    assert_eq!((r.exports[0].1)[0], 4.0);
  }
}

#[test]
fn parser_accepts_operand_forms() {
  let text = r#"
    alu {
      add r1.x, r0.x, kc0[3].y
      mul r1.y, -r0.y, l2.5
      max r1.z, |r0.z|, 0.5
      +add r1.w, r0.w, 1
    }
    export pix 0 r1.xyzw
  "#;
  let records = parse_shader_text(text).expect("parse failed");
  match &records[0].kind {
    CfKind::Alu { insts, .. } => {
      assert_eq!(insts.len(), 4);
      assert!(insts[0].last && insts[1].last);
      // The '+' form joined the last two instructions into one group.
      assert!(!insts[2].last && insts[3].last);
      assert!(insts[1].src[0].neg);
      assert!(insts[2].src[0].abs);
    }
    _ => panic!("expected an alu clause"),
  }
}

#[test]
fn parsed_shader_optimizes_equivalently() {
  let text = r#"
    alu {
      mul r1.x, r0.x, l0.5
      mul r1.y, r0.y, l0.5
      add r2.x, r1.x, r1.y
      mov r3.x, r2.x
    }
    export pix 0 r3.x001
  "#;
  let records = parse_shader_text(text).expect("parse failed");
  let opts = sbopt::Options { last_input_gpr: Some(0) };
  let out = optimize_shader(&records, IsaCaps::five_slot(), &opts)
    .expect("optimization failed");
  check_equivalence(&records, &out.records).unwrap();
}
