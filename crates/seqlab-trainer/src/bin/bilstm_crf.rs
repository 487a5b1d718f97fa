use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use tracing::info;

use seqlab_core::data::{Split, TaggingData};
use seqlab_core::vocab::{BOL, BOS, EOL, EOS};
use seqlab_trainer::optim::adam;
use seqlab_trainer::tagger::write_tagged;
use seqlab_trainer::{Mode, TaggerArgs, TaggerModel, TaggerProcessor, create_output, init_logging, seed_everything};

fn main() {
    let args = TaggerArgs::parse();
    init_logging(args.common.verbose);

    if let Err(e) = run(args) {
        eprintln!("bilstm-crf failed: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: TaggerArgs) -> Result<()> {
    args.validate()?;
    let device = Device::cuda_if_available(0)?;
    seed_everything(&device, args.common.random_seed)?;

    match args.common.mode {
        Mode::Train => train(&args, device),
        Mode::Predict => predict(&args, device),
    }
}

fn train(args: &TaggerArgs, device: Device) -> Result<()> {
    let mut train_data = TaggingData::new(Split::Train);
    let mut valid_data = TaggingData::new(Split::Valid);
    let (mut words, mut labels) = train_data
        .load(&args.train_data_path, args.common.max_length)
        .with_context(|| format!("loading training data {}", args.train_data_path.display()))?;
    valid_data
        .load(&args.valid_data_path, args.common.max_length)
        .with_context(|| format!("loading validation data {}", args.valid_data_path.display()))?;

    words.append(&[BOS, EOS]);
    labels.append(&[BOL, EOL]);

    let tagger = TaggerModel::load_or_build(&args.model_path, &device, || {
        TaggerModel::build(
            words,
            labels,
            args.embedding_dim,
            args.hidden_dim,
            args.common.dropout_rate,
            &device,
        )
    })?
    .with_scheme_constraints(args.scheme_constraints);

    let mut optimizer = adam(tagger.varmap().all_vars(), args.common.learning_rate)?;
    let processor = TaggerProcessor::new(args.common.batch_size, tagger, device)
        .with_seed(args.common.random_seed)
        .with_gradient_logging(args.common.log_gradients);

    let best = processor.fit(&mut optimizer, args.epoch, &args.model_path, &train_data, &valid_data)?;
    match best {
        Some(m) => info!(
            "Best validation F1: {:.2}% (P {:.2}%, R {:.2}%, accuracy {:.2}%)",
            m.f1 * 100.0,
            m.precision * 100.0,
            m.recall * 100.0,
            m.accuracy * 100.0
        ),
        None => info!("No epochs run, nothing saved"),
    }
    Ok(())
}

fn predict(args: &TaggerArgs, device: Device) -> Result<()> {
    let mut test_data = TaggingData::new(Split::Test);
    test_data
        .load(&args.predict_data_path, args.common.max_length)
        .with_context(|| format!("loading prediction data {}", args.predict_data_path.display()))?;

    let mut processor = TaggerProcessor::for_prediction(args.common.batch_size, device);
    processor.load(&args.model_path)?;
    let predictions = processor.predict(&test_data)?;

    write_tagged(create_output(&args.save_path)?, &test_data.words(), &predictions)?;

    info!("Wrote {} tagged sentences to {}", predictions.len(), args.save_path.display());
    Ok(())
}
