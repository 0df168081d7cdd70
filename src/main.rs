// SPDX-License-Identifier: BSD-3-Clause
use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;

use tracing_subscriber::{fmt, prelude::*};

mod cli;

use loopaa::aa::basic::BasicAa;
use loopaa::aa::global::GlobalMallocAa;
use loopaa::aa::points_to::PointsToAa;
use loopaa::aa::AaStack;
use loopaa::analysis::loops::LoopPatternAnalysis;
use loopaa::analysis::points_to::PointsToAnalysis;
use loopaa::config::{AllocRegistry, Options};
use loopaa::ir::Module;
use loopaa::report;

fn setup_global_subscriber() {
    let filter_layer = tracing::level_filters::LevelFilter::TRACE;
    let fmt_layer = fmt::Layer::default();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn main() -> Result<()> {
    let args = cli::Args::parse();

    if args.tracing {
        setup_global_subscriber();
    }

    let mut registry = AllocRegistry::default();
    if let Some(path) = &args.allocators {
        let json = std::fs::read_to_string(path).context("Couldn't read allocator registry")?;
        registry
            .extend_from_json(&json)
            .context("Couldn't parse allocator registry")?;
    }

    let module_string =
        std::fs::read_to_string(&args.module).with_context(|| {
            format!("Couldn't read IR module at {}", args.module.display())
        })?;
    let module: Module =
        serde_json::from_str(&module_string).context("Couldn't deserialize IR module")?;

    let opts = Options {
        full_universal: args.full_universal,
        skip_register_dependence: args.skip_register_dependence,
        skip_internal_calls: args.skip_internal_calls,
    };

    let pa = PointsToAnalysis::run(&module, &registry, &opts);
    let lpa = LoopPatternAnalysis::run(&module, &pa);

    let mut stack = AaStack::default();
    stack.register(Box::new(BasicAa::new(registry.clone())));
    stack.register(Box::new(GlobalMallocAa::build(&module, &registry, &opts)));
    stack.register(Box::new(PointsToAa::new(&pa)));

    if !args.quiet {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "points_to")?;
        writeln!(stdout, "---------")?;
        write!(stdout, "{}", report::render_points_to(&module, &pa))?;
        writeln!(stdout)?;
        writeln!(stdout, "mem_objects")?;
        writeln!(stdout, "-----------")?;
        write!(stdout, "{}", report::render_mem_objects(&module, &pa))?;
        writeln!(stdout)?;
        writeln!(stdout, "loop_patterns")?;
        writeln!(stdout, "-------------")?;
        write!(stdout, "{}", report::render_loop_patterns(&module, &lpa))?;
        writeln!(stdout)?;
        writeln!(stdout, "loop_alias")?;
        writeln!(stdout, "----------")?;
        write!(
            stdout,
            "{}",
            report::render_loop_alias(&module, &pa, &lpa, &stack, &opts)
        )?;
    }

    if let Some(dir) = &args.dump_dir {
        report::write_info_files(dir, &module, &pa, &lpa, &stack, &opts);
    }

    Ok(())
}
