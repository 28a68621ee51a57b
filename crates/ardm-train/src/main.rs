//! Training entry point
//!
//! Wires the corpus, tokenizer, pretrained backbone, and the training
//! loop together. With `--world-size N` greater than one, N
//! data-parallel replica threads run the loop over one shared replica
//! group; rank 0 carries all logging and checkpointing.

use anyhow::{Context, Result};
use ardm_model::{load_checkpoint, Ardm};
use ardm_tokenizer::{Tokenizer, TurnEncoder};
use ardm_train::checkpointer::Checkpointer;
use ardm_train::config::{Args, ConfigFile, RunConfig};
use ardm_train::corpus::load_corpus;
use ardm_train::dataset::{DialogDataset, EpochOrder};
use ardm_train::distributed::{DistributedConfig, DistributedManager, ReplicaGroup};
use ardm_train::metrics::ScalarWriter;
use ardm_train::optimizer::OptimizerConfig;
use ardm_train::reporter::{MainReporter, NullReporter, Reporter};
use ardm_train::sampler::DialogFragmentSampler;
use ardm_train::train::{train, TrainSummary, TrainingConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let file = match &args.config {
        Some(path) => Some(ConfigFile::from_file(path)?),
        None => None,
    };
    let mut config = RunConfig::resolve(&args, file);

    // The launcher environment may set the replica count. Replicas run
    // in-process, so only a rank-0 launch is meaningful.
    if let Some(env) = DistributedConfig::from_env()? {
        if env.rank != 0 {
            anyhow::bail!(
                "Replicas run in-process; launch once with RANK=0 and WORLD_SIZE set to the replica count"
            );
        }
        if args.world_size.is_none() {
            config.world_size = env.world_size;
        }
    }

    let tokenizer =
        Tokenizer::from_file(&config.tokenizer).context("Failed to load pretrained tokenizer")?;
    let encoder = TurnEncoder::new(tokenizer)?;

    let corpus = load_corpus(&config.train_corpus).context("Failed to load dialogue corpus")?;
    info!(dialogues = corpus.len(), corpus = %config.train_corpus.display(), "corpus loaded");

    let dataset = DialogDataset::new(
        &corpus,
        &encoder,
        DialogFragmentSampler::new(config.fragment_budget),
    )
    .context("Failed to tokenize corpus")?;

    // One concrete seed even for unseeded runs: distributed shards must
    // agree on the epoch permutation.
    let data_seed = config.seed.unwrap_or_else(rand::random);

    let training_config = TrainingConfig {
        batch_size: config.batch_size,
        num_train_epochs: config.num_train_epochs,
        gradient_accumulation_steps: config.gradient_accumulation_steps,
        logging_steps: config.logging_steps,
        save_steps: config.save_steps,
        max_grad_norm: config.max_grad_norm,
        seed: data_seed,
    };
    let optimizer_config = OptimizerConfig {
        learning_rate: config.learning_rate,
        warmup_steps: config.warmup_steps,
        warmup_ratio: config.warmup_ratio,
    };

    let vocab_size = encoder.tokenizer().vocab_size();

    let summary = if config.world_size <= 1 {
        let mut model = load_replica(&config, vocab_size)?;
        let manager = DistributedManager::single();
        let order = EpochOrder::Shuffled { seed: data_seed };
        let mut reporter = build_main_reporter(&config)?;

        train(
            &mut model,
            &dataset,
            &order,
            &manager,
            &mut reporter,
            &training_config,
            &optimizer_config,
        )?
    } else {
        run_replicated(
            &config,
            vocab_size,
            &dataset,
            data_seed,
            &training_config,
            &optimizer_config,
        )?
    };

    info!(
        updates = summary.updates,
        optimizer_steps = summary.optimizer_steps,
        checkpoints = summary.checkpoints,
        "run complete"
    );

    Ok(())
}

/// Load one model replica from the pretrained backbone checkpoint
fn load_replica(config: &RunConfig, tokenizer_vocab: usize) -> Result<Ardm> {
    let (backbone, _) =
        load_checkpoint(&config.backbone).context("Failed to load pretrained backbone")?;
    backbone
        .config()
        .validate_vocab_size(tokenizer_vocab)
        .context("Tokenizer does not match the backbone")?;
    Ok(Ardm::new(backbone))
}

/// Build the main rank's reporter over the run's output directory
fn build_main_reporter(config: &RunConfig) -> Result<MainReporter> {
    let writer = ScalarWriter::create(config.output_dir.join("scalars.jsonl"))?;
    let checkpointer = Checkpointer::new(config.output_dir.join("checkpoints"))?;
    Ok(MainReporter::new(writer, checkpointer))
}

/// Drive `world_size` replica threads over one shared group
fn run_replicated(
    config: &RunConfig,
    vocab_size: usize,
    dataset: &DialogDataset,
    data_seed: u64,
    training_config: &TrainingConfig,
    optimizer_config: &OptimizerConfig,
) -> Result<TrainSummary> {
    let world_size = config.world_size;
    let group = ReplicaGroup::new(world_size)?;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(world_size);

        for rank in 0..world_size {
            let group = group.clone();
            handles.push(scope.spawn(move || -> Result<TrainSummary> {
                let mut model = load_replica(config, vocab_size)?;
                let manager = DistributedManager::replicated(group, rank)?;
                let order = EpochOrder::Sharded {
                    rank,
                    world_size,
                    seed: data_seed,
                };

                let mut reporter: Box<dyn Reporter> = if rank == 0 {
                    Box::new(build_main_reporter(config)?)
                } else {
                    Box::new(NullReporter)
                };

                train(
                    &mut model,
                    dataset,
                    &order,
                    &manager,
                    &mut *reporter,
                    training_config,
                    optimizer_config,
                )
            }));
        }

        let mut main_summary = None;
        for (rank, handle) in handles.into_iter().enumerate() {
            let summary = handle
                .join()
                .map_err(|_| anyhow::anyhow!("Replica thread {} panicked", rank))??;
            if rank == 0 {
                main_summary = Some(summary);
            }
        }

        main_summary.ok_or_else(|| anyhow::anyhow!("No replica completed"))
    })
}
