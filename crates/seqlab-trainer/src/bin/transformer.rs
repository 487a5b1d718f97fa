use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use tracing::info;

use seqlab_core::data::{ParallelData, Split};
use seqlab_trainer::optim::adam;
use seqlab_trainer::translator::write_translations;
use seqlab_trainer::{
    Mode, TransformerArgs, TranslatorModel, TranslatorProcessor, TranslatorShape, create_output, init_logging,
    seed_everything,
};

fn main() {
    let args = TransformerArgs::parse();
    init_logging(args.common.verbose);

    if let Err(e) = run(args) {
        eprintln!("transformer failed: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: TransformerArgs) -> Result<()> {
    args.validate()?;
    let device = Device::cuda_if_available(0)?;
    seed_everything(&device, args.common.random_seed)?;

    match args.common.mode {
        Mode::Train => train(&args, device),
        Mode::Predict => predict(&args, device),
    }
}

fn train(args: &TransformerArgs, device: Device) -> Result<()> {
    let mut train_data = ParallelData::new(Split::Train);
    let mut valid_data = ParallelData::new(Split::Valid);
    let (source, target) = train_data
        .load(&args.train_data_path, args.common.max_length)
        .with_context(|| format!("loading training data {}", args.train_data_path.display()))?;
    valid_data
        .load(&args.valid_data_path, args.common.max_length)
        .with_context(|| format!("loading validation data {}", args.valid_data_path.display()))?;

    let translator = TranslatorModel::load_or_build(&args.model_path, &device, || {
        let shape = TranslatorShape {
            embedding_dim: args.embedding_dim,
            head_num: args.head_num,
            layer_num: args.layer_num,
            dropout: args.common.dropout_rate,
            max_length: args.common.max_length,
        };
        TranslatorModel::build(source, target, shape, &device)
    })?;

    let mut optimizer = adam(translator.varmap().all_vars(), args.common.learning_rate)?;
    let processor = TranslatorProcessor::new(args.common.batch_size, translator, device)
        .with_seed(args.common.random_seed)
        .with_teacher_forcing(args.teacher_forcing_ratio)
        .with_gradient_logging(args.common.log_gradients);

    let best = processor.fit(&mut optimizer, args.epoch, &args.model_path, &train_data, &valid_data)?;
    match best {
        Some(m) => info!(
            "Best validation BLEU: {:.2} (loss {:.4}, accuracy {:.2}%)",
            m.bleu * 100.0,
            m.loss,
            m.accuracy * 100.0
        ),
        None => info!("No epochs run, nothing saved"),
    }
    Ok(())
}

fn predict(args: &TransformerArgs, device: Device) -> Result<()> {
    let mut test_data = ParallelData::new(Split::Test);
    test_data
        .load(&args.predict_data_path, args.common.max_length)
        .with_context(|| format!("loading prediction data {}", args.predict_data_path.display()))?;

    let mut processor = TranslatorProcessor::for_prediction(args.common.batch_size, device);
    processor.load(&args.model_path)?;
    let predictions = processor.predict(&test_data)?;

    write_translations(create_output(&args.save_path)?, &test_data.sources(), &predictions)?;

    info!("Wrote {} translations to {}", predictions.len(), args.save_path.display());
    Ok(())
}
