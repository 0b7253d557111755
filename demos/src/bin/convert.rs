//! Checkpoint converter
//!
//! Builds a DeepLab model, merges a PyTorch checkpoint into it by parameter
//! name and saves the result as a Burn record.
//!
//! ## Usage
//!
//! ```bash
//! # Convert with the default configuration (ResNet-101, stride 16, 21 classes)
//! cargo run --bin convert -- deeplab-resnet.pth deeplab-resnet
//!
//! # Convert with a custom configuration
//! cargo run --bin convert -- model.pth model --config deeplab.json --num-classes 16
//! ```

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::prelude::*;
use clap::Parser;
use deeplab_demos::{backend_label, default_device, init_logging, InferenceBackend, ModelArgs};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PyTorch checkpoint (.pth file with a `state_dict` entry)
    input: PathBuf,

    /// Output Burn record path (the .mpk extension is added)
    output: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Characters stripped from the front of every checkpoint key
    #[arg(long, default_value_t = 7)]
    prefix_len: usize,

    /// Fail when the checkpoint leaves model parameters uninitialized
    #[arg(long)]
    strict: bool,

    /// Force overwrite output file
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    ensure!(
        args.input.exists(),
        "Input checkpoint does not exist: {}",
        args.input.display()
    );
    let output_file = args.output.with_extension("mpk");
    ensure!(
        args.force || !output_file.exists(),
        "Output file already exists: {} (use --force to overwrite)",
        output_file.display()
    );

    let config = args.model.resolve()?;
    let device = default_device();
    println!("Backend: {}", backend_label());
    println!("Configuration:\n{}", serde_json::to_string_pretty(&config)?);

    let model = config
        .init::<InferenceBackend>(&device)
        .context("Failed to build the model")?;
    let (model, report) = model
        .load_pretrained(&args.input, args.prefix_len, &device)
        .with_context(|| format!("Failed to merge checkpoint: {}", args.input.display()))?;

    println!("Loaded tensors:  {}", report.loaded.len());
    println!("Missing tensors: {}", report.missing.len());
    println!("Unused entries:  {}", report.unused.len());
    ensure!(
        !args.strict || report.missing.is_empty(),
        "Checkpoint does not cover the model, first missing parameter: {}",
        report.missing.first().map(String::as_str).unwrap_or_default()
    );

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::default();
    model
        .save_file(args.output.clone(), &recorder)
        .with_context(|| format!("Failed to save record: {}", output_file.display()))?;

    println!("Saved {}", output_file.display());
    Ok(())
}
