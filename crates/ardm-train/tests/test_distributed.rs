//! Data-parallel replica training tests

use anyhow::Result;
use ardm_model::{Ardm, BackboneConfig, TransformerLM};
use ardm_tokenizer::{Tokenizer, TurnEncoder};
use ardm_train::checkpointer::Checkpointer;
use ardm_train::dataset::{DialogDataset, EpochOrder};
use ardm_train::distributed::{DistributedManager, ReplicaGroup};
use ardm_train::metrics::ScalarWriter;
use ardm_train::optimizer::OptimizerConfig;
use ardm_train::reporter::{MainReporter, NullReporter, Reporter};
use ardm_train::sampler::DialogFragmentSampler;
use ardm_train::train::{train, TrainSummary, TrainingConfig};
use std::thread;
use tempfile::TempDir;

fn test_encoder() -> TurnEncoder {
    let corpus = [
        "one\n\n\n",
        "two\n\n\n",
        "three\n\n\n",
        "four\n\n\n",
        "five\n\n\n",
        "six\n\n\n",
    ];
    let tokenizer =
        Tokenizer::train_from_iterator(corpus.iter(), 400).expect("Failed to train test tokenizer");
    TurnEncoder::new(tokenizer).expect("Failed to build turn encoder")
}

fn test_dataset(encoder: &TurnEncoder) -> DialogDataset {
    let corpus = ardm_train::corpus::parse_corpus(
        r#"{
            "d1": ["one", "two"],
            "d2": ["three", "four"],
            "d3": ["five", "six"],
            "d4": ["one", "three"],
            "d5": ["two", "five"],
            "d6": ["four", "six"]
        }"#,
    )
    .expect("Failed to parse corpus");
    DialogDataset::new(&corpus, encoder, DialogFragmentSampler::new(40))
        .expect("Failed to build dataset")
}

fn tiny_model(encoder: &TurnEncoder) -> Ardm {
    let mut config = BackboneConfig::tiny(encoder.tokenizer().vocab_size());
    config.n_positions = 96;
    Ardm::new(TransformerLM::new(config))
}

#[test]
fn test_two_replicas_stay_in_lockstep() -> Result<()> {
    let encoder = test_encoder();
    let dataset = test_dataset(&encoder);
    let dir = TempDir::new()?;

    let world_size = 2;
    let group = ReplicaGroup::new(world_size)?;

    let training_config = TrainingConfig {
        batch_size: 1,
        num_train_epochs: 2,
        gradient_accumulation_steps: 3,
        logging_steps: 100,
        save_steps: 3,
        max_grad_norm: 1.0,
        seed: 9,
    };
    let optimizer_config = OptimizerConfig {
        learning_rate: 1e-4,
        warmup_steps: 1,
        warmup_ratio: 0.1,
    };

    let summaries: Vec<TrainSummary> = thread::scope(|scope| {
        let mut handles = Vec::new();
        for rank in 0..world_size {
            let group = group.clone();
            let dataset = &dataset;
            let encoder = &encoder;
            let training_config = training_config.clone();
            let optimizer_config = optimizer_config.clone();
            let output = dir.path().to_path_buf();

            handles.push(scope.spawn(move || -> Result<TrainSummary> {
                let mut model = tiny_model(encoder);
                let manager = DistributedManager::replicated(group, rank)?;
                let order = EpochOrder::Sharded {
                    rank,
                    world_size,
                    seed: 9,
                };

                let mut reporter: Box<dyn Reporter> = if rank == 0 {
                    let writer = ScalarWriter::create(output.join("scalars.jsonl"))?;
                    let checkpointer = Checkpointer::new(output.join("checkpoints"))?;
                    Box::new(MainReporter::new(writer, checkpointer))
                } else {
                    Box::new(NullReporter)
                };

                train(
                    &mut model,
                    dataset,
                    &order,
                    &manager,
                    &mut *reporter,
                    &training_config,
                    &optimizer_config,
                )
            }));
        }

        handles
            .into_iter()
            .map(|h| h.join().expect("replica thread panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    // 6 dialogues over 2 ranks: 3 per epoch per rank, 6 over 2 epochs.
    for summary in &summaries {
        assert_eq!(summary.updates, 6);
        assert_eq!(summary.optimizer_steps, 2);
    }

    // Only rank 0 wrote checkpoints.
    assert!(dir
        .path()
        .join("checkpoints")
        .join("checkpoint_step_3.json")
        .exists());
    assert!(dir
        .path()
        .join("checkpoints")
        .join("checkpoint_step_6.json")
        .exists());

    Ok(())
}

#[test]
fn test_replica_rank_bounds() {
    let group = ReplicaGroup::new(2).unwrap();
    assert!(DistributedManager::replicated(group.clone(), 1).is_ok());
    assert!(DistributedManager::replicated(group, 5).is_err());
}
