//! Model inspector
//!
//! Builds a DeepLab model, optionally loads a Burn record, and reports the
//! trainable parameter groups and the output shape of every entry point on a
//! random input.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin inspect -- --backbone 50 --output-stride 8 --height 321 --width 321
//! cargo run --bin inspect -- --config deeplab.json --weights deeplab-resnet.mpk
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::Distribution,
};
use clap::Parser;
use deeplab_burn::ParamGroup;
use deeplab_demos::{
    backend_label, default_device, init_logging, InferenceBackend, ModelArgs, TrainingBackend,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    model: ModelArgs,

    /// Burn record to load (.mpk)
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Batch size of the random input
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Height of the random input
    #[arg(long, default_value_t = 513)]
    height: usize,

    /// Width of the random input
    #[arg(long, default_value_t = 513)]
    width: usize,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = args.model.resolve()?;
    let device = default_device();
    println!("Backend: {}", backend_label());
    println!("Configuration:\n{}", serde_json::to_string_pretty(&config)?);

    // Built with autodiff so the trainable tensors can be told apart
    let mut model = config
        .init::<TrainingBackend>(&device)
        .context("Failed to build the model")?;
    if let Some(weights) = &args.weights {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::default();
        model = model
            .load_file(weights.clone(), &recorder, &device)
            .with_context(|| format!("Failed to load record: {}", weights.display()))?;
    }

    println!("Trainable tensors:");
    for (name, group) in [("backbone", ParamGroup::Backbone), ("head", ParamGroup::Head)] {
        println!(
            "  {name:<8} (lr x{}): {}",
            group.lr_multiplier(),
            model.group_params(group).len()
        );
    }
    println!("Values (including running statistics): {}", model.num_params());

    let model = model.valid();
    let input = Tensor::<InferenceBackend, 4>::random(
        [args.batch_size, 3, args.height, args.width],
        Distribution::Normal(0.0, 1.0),
        &device,
    );

    println!("Shapes:");
    println!("  input: {:?}", input.dims());
    println!("  forward: {:?}", model.forward(input.clone()).dims());

    let features = model.forward_before_class_prediction(input.clone());
    println!("  forward_before_class_prediction: {:?}", features.dims());
    let logits = model.forward_class_prediction(features, [args.height, args.width]);
    println!("  forward_class_prediction: {:?}", logits.dims());

    let features = model.forward_before_last_conv_finetune(input);
    println!("  forward_before_last_conv_finetune: {:?}", features.dims());
    let logits = model.forward_class_last_conv_finetune(features);
    println!("  forward_class_last_conv_finetune: {:?}", logits.dims());

    Ok(())
}
