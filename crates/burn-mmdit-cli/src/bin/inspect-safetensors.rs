//! Safetensors inspection tool
//!
//! Prints tensor names, shapes, and dtypes from safetensors files, e.g. to
//! check a checkpoint's key layout before loading it into an MMDiT.

use std::path::PathBuf;

use burn_mmdit_convert::SafeTensorFile;
use clap::Parser;

#[derive(Parser)]
#[command(name = "inspect-safetensors")]
#[command(about = "Inspect safetensors files")]
struct Args {
    /// Path to safetensors file
    path: PathBuf,

    /// Filter tensor names (substring match)
    #[arg(short, long)]
    filter: Option<String>,

    /// Show only shapes, not dtypes
    #[arg(long)]
    shapes_only: bool,

    /// Summarize joint blocks instead of listing every tensor
    #[arg(long)]
    summary: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file = SafeTensorFile::open(&args.path)?;
    let mut names: Vec<&str> = file.names().collect();
    names.sort();

    println!("File: {}", args.path.display());
    println!("Total tensors: {}\n", names.len());

    if args.summary {
        let depth = names
            .iter()
            .filter_map(|name| name.strip_prefix("joint_blocks."))
            .filter_map(|rest| rest.split('.').next()?.parse::<usize>().ok())
            .max()
            .map_or(0, |last| last + 1);
        println!("Joint blocks: {depth}");
        for key in ["x_embedder.proj.weight", "context_embedder.weight", "pos_embed", "register"] {
            match file.shape(key) {
                Some(shape) => println!("{key}: {shape:?}"),
                None => println!("{key}: (absent)"),
            }
        }
        return Ok(());
    }

    for name in names {
        if let Some(ref filter) = args.filter {
            if !name.contains(filter) {
                continue;
            }
        }

        let shape = file.shape(name).unwrap_or_default();
        if args.shapes_only {
            println!("{}: {:?}", name, shape);
        } else if let Some(dtype) = file.dtype(name) {
            println!("{}: {:?} ({:?})", name, shape, dtype);
        }
    }

    Ok(())
}
