//! geosample CLI: inspect a corpus, run batches, export samples as GeoTIFF.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use geosample::config::CorpusConfig;
use geosample::pipeline::Pipeline;
use geosample::SampleEngine;

#[derive(Parser)]
#[command(name = "geosample")]
#[command(version, about = "Windowed sampling over georeferenced rasters", long_about = None)]
struct Cli {
    /// Corpus configuration (JSON)
    #[arg(short, long, global = true, default_value = "corpus.json")]
    config: PathBuf,

    /// Split to use
    #[arg(short, long, global = true, default_value = "train")]
    split: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the indexed sources and working grid
    Info,
    /// Draw batches and print run statistics as JSON
    Run {
        /// Stop after this many batches
        #[arg(short, long)]
        batches: Option<usize>,
    },
    /// Write samples as GeoTIFF image/label pairs
    Export {
        /// Output directory
        output: PathBuf,
        /// Number of samples to write
        #[arg(short, long, default_value_t = 16)]
        count: usize,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "geosample failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let corpus = CorpusConfig::from_path(&cli.config)?;
    let engine = SampleEngine::for_split(&corpus, &cli.split)?;

    match &cli.command {
        Commands::Info => {
            let (rx, ry) = engine.aligner().resolution();
            println!("working CRS: {}", engine.aligner().crs());
            println!("resolution:  {rx} x {ry}");
            println!("extent:      {}", engine.index().extent()?);
            for (id, desc) in engine.index().iter() {
                println!(
                    "{:>5} {:<6} {:<24} {} {}x{}x{}",
                    id.to_string(),
                    desc.role.as_str(),
                    desc.name,
                    desc.crs,
                    desc.bands,
                    desc.height,
                    desc.width
                );
            }
        }
        Commands::Run { batches } => {
            let pipeline = Pipeline::new(engine);
            let mut stream = pipeline.batches()?;
            let start = Instant::now();
            let mut count = 0_usize;
            let mut samples = 0_usize;
            for batch in stream.by_ref().take(batches.unwrap_or(usize::MAX)) {
                let batch = batch?;
                count += 1;
                samples += batch.len();
            }
            let elapsed = start.elapsed();
            info!(batches = count, samples, elapsed_ms = elapsed.as_millis(), "Run complete");
            println!("{}", serde_json::to_string_pretty(&stream.stream().stats())?);
        }
        Commands::Export { output, count } => {
            std::fs::create_dir_all(output)?;
            let pipeline = Pipeline::new(engine);
            let mut written = 0_usize;
            let samples = pipeline
                .samples()?
                .filter_map(|s| match s {
                    Ok(sample) => Some(Ok(sample)),
                    Err(e) if e.is_fatal() => Some(Err(e)),
                    Err(_) => None,
                })
                .take(*count);
            for sample in samples {
                let sample = sample?;
                let stem = format!("sample_{:06}", sample.meta.seq);
                sample.write_image_geotiff(output.join(format!("{stem}.tif")))?;
                if sample.label.is_some() {
                    sample.write_label_geotiff(output.join(format!("{stem}_label.tif")))?;
                }
                written += 1;
            }
            info!(written, output = %output.display(), "Export complete");
        }
    }
    Ok(())
}
