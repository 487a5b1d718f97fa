//! Streams whitespace-tokenized sentences from stdin through a saved
//! checkpoint and prints one JSON object per input line.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::info;

use seqlab_trainer::{TaggerModel, TranslatorModel, init_logging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    /// BiLSTM-CRF sequence labeling
    Tag,
    /// Transformer translation
    Translate,
}

#[derive(Parser)]
#[command(name = "seqlab-infer")]
#[command(about = "Tag or translate stdin lines with a saved checkpoint")]
#[command(version)]
struct Cli {
    /// Which kind of checkpoint `model_path` holds
    #[arg(short, long, value_enum)]
    task: Task,

    /// Checkpoint path, without extension
    #[arg(short = 'p', long)]
    model_path: PathBuf,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct InferOutput {
    input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    translation: Option<String>,
    error: Option<String>,
}

enum Loaded {
    Tagger(TaggerModel),
    Translator(TranslatorModel),
}

impl Loaded {
    fn run(&self, tokens: Vec<String>, device: &Device) -> Result<InferOutput> {
        let input = tokens.join(" ");
        let batch = [tokens];
        Ok(match self {
            Loaded::Tagger(model) => InferOutput {
                input,
                labels: model.tag(&batch, device)?.pop(),
                translation: None,
                error: None,
            },
            Loaded::Translator(model) => InferOutput {
                input,
                labels: None,
                translation: model.translate(&batch, device)?.pop().map(|t| t.join(" ")),
                error: None,
            },
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let device = Device::cuda_if_available(0)?;
    let model = match cli.task {
        Task::Tag => Loaded::Tagger(TaggerModel::load(&cli.model_path, &device)?),
        Task::Translate => Loaded::Translator(TranslatorModel::load(&cli.model_path, &device)?),
    };

    let count = stream(&model, io::stdin().lock(), io::stdout().lock(), &device)?;
    info!("Processed {count} lines");
    Ok(())
}

/// One JSON object per non-blank input line. Returns the number written.
fn stream<R: BufRead, W: Write>(model: &Loaded, input: R, mut output: W, device: &Device) -> Result<usize> {
    let mut count = 0usize;
    for line in input.lines() {
        let line = line?;
        let tokens: Vec<String> = line.split_whitespace().map(String::from).collect();
        if tokens.is_empty() {
            continue;
        }

        let record = model.run(tokens, device).unwrap_or_else(|e| InferOutput {
            input: line.trim().to_string(),
            labels: None,
            translation: None,
            error: Some(format!("{e:#}")),
        });
        serde_json::to_writer(&mut output, &record)?;
        writeln!(output)?;
        count += 1;
    }
    output.flush()?;
    Ok(count)
}
