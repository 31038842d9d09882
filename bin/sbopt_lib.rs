/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Library view of the sbopt test harness, so the test cases, the textual
//! shader parser and the reference interpreter are usable both from the
//! command-line driver and from the integration tests.

pub mod parser;
pub mod test_cases;
pub mod test_framework;

#[cfg(test)]
mod tests;
