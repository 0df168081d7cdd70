// SPDX-License-Identifier: BSD-3-Clause
//! Loop-aware alias analysis for a compiler middle-end.
//!
//! The crate has three layers:
//!
//!  * [`ir`]: an arena-based module representation with explicit loop
//!    records, deserializable from JSON and constructible through
//!    [`ir::build::ModuleBuilder`].
//!  * [`analysis`]: whole-module passes. Inclusion-based, field-sensitive
//!    points-to ([`analysis::points_to`]), loop access-pattern
//!    classification ([`analysis::loops`]), and iteration distance
//!    ([`analysis::distance`]).
//!  * [`aa`]: a chainable stack of loop-aware alias oracles, queried with
//!    a temporal relation so cross-iteration questions are first class.

pub mod aa;
pub mod analysis;
pub mod config;
pub mod ir;
pub mod report;
