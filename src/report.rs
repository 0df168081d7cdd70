// SPDX-License-Identifier: BSD-3-Clause
//! Human-readable dumps of the analysis results.
//!
//! The `.info` files mirror what the CLI prints: the abstract memory
//! objects, the per-nest access patterns, and pairwise alias/distance
//! verdicts for the accesses of every determined nest. The format is for
//! eyeballs only and not a stable interface.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::aa::{AaStack, InstRef, LoopScope, PtrQuery, TemporalRelation};
use crate::analysis::distance::DistanceAnalysis;
use crate::analysis::loops::{LoopPatternAnalysis, LoopState};
use crate::analysis::points_to::{AllocSite, PointsToAnalysis};
use crate::config::Options;
use crate::ir::{FuncId, InstId, Module, Opcode, Operand, ValueRef};

pub fn write_info_files(
    dir: &Path,
    module: &Module,
    pa: &PointsToAnalysis,
    lpa: &LoopPatternAnalysis,
    stack: &AaStack<'_>,
    opts: &Options,
) {
    let files = [
        ("MemObject.info", render_mem_objects(module, pa)),
        ("LoopPattern.info", render_loop_patterns(module, lpa)),
        (
            "LoopAlias.info",
            render_loop_alias(module, pa, lpa, stack, opts),
        ),
    ];
    for (name, content) in files {
        let path = dir.join(name);
        if let Err(e) = fs::write(&path, content) {
            warn!(file = %path.display(), error = %e, "could not write dump");
        }
    }
}

fn fmt_value(module: &Module, v: ValueRef) -> String {
    match v {
        ValueRef::Inst(f, i) => format!("{}%{}", module.function(f).name, i.0),
        ValueRef::Param(f, p) => {
            let f = module.function(f);
            format!("{}${}", f.name, f.params[p as usize].name)
        }
        ValueRef::Global(g) => format!("@{}", module.global(g).name),
        ValueRef::Func(f) => format!("@{}", module.function(f).name),
        ValueRef::Null => "null".to_owned(),
    }
}

fn fmt_site(module: &Module, site: AllocSite) -> String {
    match site {
        AllocSite::Stack(f, i) => format!("stack {}%{}", module.function(f).name, i.0),
        AllocSite::Heap(f, i) => format!("heap {}%{}", module.function(f).name, i.0),
        AllocSite::Global(g) => format!("global @{}", module.global(g).name),
    }
}

pub fn render_points_to(module: &Module, pa: &PointsToAnalysis) -> String {
    let mut entries: Vec<(ValueRef, Vec<String>)> = pa
        .values()
        .map(|(v, pts)| {
            let mut names: Vec<String> =
                pts.iter().map(|o| pa.object(*o).name.clone()).collect();
            names.sort();
            (v, names)
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut out = String::new();
    for (v, names) in entries {
        let set = if names.is_empty() {
            "<unresolved>".to_owned()
        } else {
            names.join(", ")
        };
        let _ = writeln!(out, "{} --> {{{}}}", fmt_value(module, v), set);
    }
    out
}

pub fn render_mem_objects(module: &Module, pa: &PointsToAnalysis) -> String {
    let mut out = String::new();
    for (id, obj) in pa.objects() {
        let _ = write!(
            out,
            "[{}] {} ({})",
            id.0,
            obj.name,
            fmt_site(module, obj.site)
        );
        if !obj.dims.is_empty() {
            let dims: Vec<String> = obj.dims.iter().map(|d| d.to_string()).collect();
            let _ = write!(out, " dims={}", dims.join("x"));
        }
        if obj.element_size != 0 {
            let _ = write!(out, " elem={}B", obj.element_size);
        }
        if let Some(bytes) = obj.byte_size {
            let _ = write!(out, " size={}B", bytes);
        }
        if let Some(fi) = obj.field_index {
            let _ = write!(out, " field#{}", fi);
        }
        let _ = writeln!(out);
        if let Some(users) = pa.object_users(id) {
            let mut names: Vec<&str> = users
                .iter()
                .map(|f| module.function(*f).name.as_str())
                .collect();
            names.sort_unstable();
            let _ = writeln!(out, "    users: {}", names.join(" "));
        }
    }
    out
}

pub fn render_loop_patterns(module: &Module, lpa: &LoopPatternAnalysis) -> String {
    let mut nodes: Vec<_> = lpa.nodes().collect();
    nodes.sort_by_key(|(k, _)| **k);
    let mut out = String::new();
    for ((func, root), node) in nodes {
        let fname = &module.function(*func).name;
        match node.state {
            LoopState::StructureDetermined => {
                let _ = writeln!(out, "{} loop#{}: depth={}", fname, root.0, node.max_nest());
                for (i, level) in node.nest.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "  nest {}: indvar %{} init={} trip={}",
                        i + 1,
                        level.indvar.phi.0,
                        level.indvar.init,
                        level.trip_count
                    );
                }
            }
            LoopState::StructureUndetermined => {
                let _ = writeln!(out, "{} loop#{}: <structure unknown>", fname, root.0);
            }
        }
        if !node.objects_known {
            let _ = writeln!(out, "  (some accesses untraceable)");
        }
        let mut pats: Vec<_> = node.patterns.iter().collect();
        pats.sort_by_key(|(o, _)| **o);
        for (obj, pat) in pats {
            // Object names come from the points-to pass; here only the
            // id ties them together.
            let _ = writeln!(out, "  object [{}]: {:?}", obj.0, pat.summary);
            for a in &pat.accesses {
                let strides: Vec<String> = a
                    .strides
                    .iter()
                    .map(|(n, s)| format!("({n},{s})"))
                    .collect();
                let _ = writeln!(
                    out,
                    "    %{} {:?} {}",
                    a.inst.0,
                    a.class,
                    strides.join(" ")
                );
            }
        }
    }
    out
}

pub fn render_loop_alias(
    module: &Module,
    pa: &PointsToAnalysis,
    lpa: &LoopPatternAnalysis,
    stack: &AaStack<'_>,
    opts: &Options,
) -> String {
    let mut nodes: Vec<_> = lpa.nodes().collect();
    nodes.sort_by_key(|(k, _)| **k);
    let mut out = String::new();
    let dist = DistanceAnalysis::new(module, pa);
    for ((func, root), node) in nodes {
        if node.state != LoopState::StructureDetermined {
            continue;
        }
        let Some(innermost) = node.innermost() else {
            continue;
        };
        let f = module.function(*func);
        let _ = writeln!(out, "{} loop#{}:", f.name, root.0);
        let scope = LoopScope {
            func: *func,
            loop_id: innermost.loop_id,
        };
        let mut accesses: Vec<InstId> = node.inst_object.keys().copied().collect();
        accesses.sort();
        for (ai, a) in accesses.iter().enumerate() {
            for b in &accesses[ai + 1..] {
                if opts.skip_register_dependence && is_load(f, *a) && is_load(f, *b) {
                    continue;
                }
                let Some(((ptr_a, qa), (ptr_b, qb))) = (ptr_query(module, *func, stack, *a))
                    .zip(ptr_query(module, *func, stack, *b))
                else {
                    continue;
                };
                let same = stack.alias(module, qa, TemporalRelation::Same, qb, Some(scope));
                let cross = stack.alias(module, qa, TemporalRelation::Before, qb, Some(scope));
                let (exact, k) = dist.get_distance(node, ptr_a, qa.size, ptr_b, qb.size);
                let _ = writeln!(
                    out,
                    "  %{} vs %{}: same={:?} cross={:?} distance={}",
                    a.0,
                    b.0,
                    same,
                    cross,
                    if exact {
                        format!("{k}")
                    } else if k == 0 {
                        "none".to_owned()
                    } else {
                        "unknown".to_owned()
                    }
                );
            }
        }
    }
    out
}

fn is_load(f: &crate::ir::Function, inst: InstId) -> bool {
    matches!(f.inst(inst).opcode, Opcode::Load { .. })
}

/// The pointer operand of a load or store, both raw (for the distance
/// analysis) and resolved into a sized query (for the oracle stack).
fn ptr_query(
    module: &Module,
    func: FuncId,
    stack: &AaStack<'_>,
    inst: InstId,
) -> Option<(Operand, PtrQuery)> {
    let ptr = match &module.function(func).inst(inst).opcode {
        Opcode::Load { ptr } => *ptr,
        Opcode::Store { ptr, .. } => *ptr,
        _ => return None,
    };
    let v = module.value_ref(func, ptr)?;
    let q = PtrQuery::new(v, stack.access_size(module, InstRef { func, inst }));
    Some((ptr, q))
}
