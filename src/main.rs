//! Trains a small DiffPool graph classifier on stochastic block model graphs.
//!
//! The model is `GraphConv -> DiffPool -> GlobalAvgPool -> Linear -> softmax`
//! and learns to predict how many blocks a graph has. The loss is the
//! cross-entropy plus the DiffPool link and entropy losses.

use clap::Parser;
use rustygnn::asg::Value;
use rustygnn::data::{BatchLoader, BlockGraphs, Dataset, GraphSource, OneHotLabels, DATASET_FOLDER_ENV};
use rustygnn::losses::{add_losses, categorical_crossentropy};
use rustygnn::metrics::{Accuracy, Metric, RunningMean};
use rustygnn::nn::{Activation, DiffPool, DiffPoolConfig, GlobalAvgPool, GraphConv, Linear, Module};
use rustygnn::optimizers::Sgd;
use rustygnn::runtime::Session;
use rustygnn::serialization::{save_dataset, save_safetensors, SafetensorsSource};
use rustygnn::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a DiffPool graph classifier", long_about = None)]
struct Args {
    /// Number of generated graphs
    #[arg(long, default_value_t = 200)]
    graphs: usize,

    /// Largest node count of a generated graph
    #[arg(long, default_value_t = 20)]
    nodes: usize,

    /// Largest block count of a generated graph; also the number of classes
    #[arg(long, default_value_t = 3)]
    blocks: usize,

    /// Clusters kept by DiffPool
    #[arg(long, default_value_t = 4)]
    clusters: usize,

    /// Hidden channels of the graph convolution
    #[arg(long, default_value_t = 16)]
    hidden: usize,

    #[arg(long, default_value_t = 30)]
    epochs: u64,

    #[arg(long, default_value_t = 0.05)]
    lr: f32,

    #[arg(long, default_value_t = 0.9)]
    momentum: f32,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Read the dataset from a SafeTensors file instead of generating it
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// Write the dataset used for training to this file
    #[arg(long)]
    export_dataset: Option<PathBuf>,

    /// Write the trained parameters to this file
    #[arg(long)]
    save: Option<PathBuf>,

    /// Root folder for named datasets
    #[arg(long, env = DATASET_FOLDER_ENV)]
    dataset_folder: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dataset = load_dataset(&args)?;
    info!(%dataset, "dataset ready");
    if let Some(path) = &args.export_dataset {
        save_dataset(&dataset, path)?;
        info!(path = %path.display(), "dataset exported");
    }

    train(&args, &dataset)
}

fn load_dataset(args: &Args) -> Result<Dataset, Box<dyn std::error::Error>> {
    if let Some(path) = &args.dataset {
        let path = match &args.dataset_folder {
            Some(folder) if path.is_relative() => folder.join(path),
            _ => path.clone(),
        };
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        return Ok(Dataset::load(&SafetensorsSource::new(name, path), &[])?);
    }

    let source = BlockGraphs {
        n_graphs: args.graphs,
        min_nodes: args.blocks.max(args.nodes / 2),
        max_nodes: args.nodes,
        max_blocks: args.blocks,
        seed: args.seed,
        ..BlockGraphs::default()
    };
    if args.dataset_folder.is_some() {
        warn!(source = %source.name(), "generated datasets ignore the dataset folder");
    }
    Ok(Dataset::load(&source, &[&OneHotLabels::new(args.blocks)])?)
}

fn train(args: &Args, dataset: &Dataset) -> Result<(), Box<dyn std::error::Error>> {
    let loader = BatchLoader::new(dataset, args.batch_size).shuffle(true).seed(args.seed).drop_last(true);
    if loader.num_batches() == 0 {
        return Err(format!("batch size {} exceeds the {} graphs of {}", args.batch_size, dataset.len(), dataset).into());
    }
    let n_classes = dataset.n_labels().ok_or("graphs carry no labels")?;
    let (b, n, f) = (loader.batch_size(), loader.n_max(), loader.n_features());

    // ---------- Model ----------
    let context = Rc::new(RefCell::new(GraphContext::new()));
    let x = Tensor::new_input_with_shape(&context, "x", &[b, n, f]);
    let a = Tensor::new_input_with_shape(&context, "a", &[b, n, n]);
    let y = Tensor::new_input_with_shape(&context, "y", &[b, n_classes]);

    let conv = GraphConv::new(&context, f, args.hidden, Activation::ReLU, "conv");
    let mut pool = DiffPool::new("pool", DiffPoolConfig::new(args.clusters).activation(Activation::ReLU))?;
    let head = Linear::new(&context, args.hidden, n_classes, "head");

    let h = conv.call(&x, &a)?;
    let pooled = pool.call(&h, &a)?;
    let probs = head.forward(&GlobalAvgPool.forward(&pooled.x)).softmax();

    let mut losses = vec![categorical_crossentropy(&probs, &y, 1e-7)];
    losses.extend(pooled.losses());
    let loss = add_losses(&losses).ok_or("no loss terms")?;

    let mut session = Session::new(&context, &[&probs, &pooled.link_loss, &pooled.entropy_loss], Some(&loss))?;
    session.init_parameters(args.seed)?;
    info!(
        batches = loader.num_batches(),
        batch_size = b,
        padded_nodes = n,
        parameters = session.parameter_names().len(),
        "model built"
    );

    // ---------- Training ----------
    let mut optimizer = Sgd::new(args.lr).with_momentum(args.momentum);
    let mut accuracy = Accuracy::new();
    for epoch in 0..args.epochs {
        let start = Instant::now();
        let (mut epoch_loss, mut link, mut entropy) = (RunningMean::new(), RunningMean::new(), RunningMean::new());
        accuracy.reset();

        for batch in loader.iter_epoch(epoch) {
            let labels = batch.y.clone().ok_or("batch without stacked labels")?;
            let feed = HashMap::from([
                ("x".to_string(), Value::Tensor(batch.x.into_dyn())),
                ("a".to_string(), Value::Tensor(batch.a.into_dyn())),
                ("y".to_string(), Value::Tensor(labels.clone())),
            ]);
            let step = session.forward_backward(&feed)?;
            session.apply_gradients(&mut optimizer, &step.gradients);

            epoch_loss.update(f64::from(step.loss));
            link.update(step.outputs[1].as_scalar().map_or(0.0, f64::from));
            entropy.update(step.outputs[2].as_scalar().map_or(0.0, f64::from));
            accuracy.update(&step.outputs[0].to_tensor(), &labels);
        }

        info!(
            epoch = epoch + 1,
            loss = epoch_loss.compute(),
            link_loss = link.compute(),
            entropy_loss = entropy.compute(),
            accuracy = accuracy.compute(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "epoch finished"
        );
    }

    if let Some(path) = &args.save {
        save_safetensors(path, session.parameters())?;
        info!(path = %path.display(), "parameters saved");
    }
    Ok(())
}
