// SPDX-License-Identifier: BSD-3-Clause
use std::path::PathBuf;

/// Loop-aware alias analysis over a serialized IR module
#[derive(Debug, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Extra allocator registry entries (JSON)
    #[arg(short, long)]
    pub allocators: Option<PathBuf>,

    /// Directory for MemObject.info / LoopPattern.info / LoopAlias.info
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,

    /// Treat externally visible globals as fully known
    #[arg(long)]
    pub full_universal: bool,

    /// IR module (JSON)
    #[arg()]
    pub module: PathBuf,

    /// Quiet
    #[arg(long)]
    pub quiet: bool,

    /// Do not fold callee memory footprints into callers
    #[arg(long)]
    pub skip_internal_calls: bool,

    /// Leave load-load pairs out of the loop alias dump
    #[arg(long)]
    pub skip_register_dependence: bool,

    /// Tracing
    #[arg(long)]
    pub tracing: bool,
}
