use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser, Subcommand};
use colored::Colorize;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use modgate::config::Config;
use modgate::frames;
use modgate::output::{json, terminal};
use modgate::phash::ListKind;
use modgate::pipeline::{input, Pipeline, Report};
use modgate::state::SharedState;

/// modgate: multi-detector image moderation.
///
/// Runs perceptual-hash lists, OCR, offline ONNX models and (optionally)
/// paid moderation APIs over each image, then decides OK, REVIEW or BLOCK.
#[derive(Parser)]
#[command(name = "modgate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan images, directories or URLs and print a verdict for each
    Scan {
        /// Files, directories or http(s) URLs
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Skip OpenAI and Sightengine (offline detectors only)
        #[arg(long)]
        no_apis: bool,

        /// Frames sampled from animated images (default: SAMPLE_FRAMES)
        #[arg(long)]
        sample_frames: Option<usize>,

        /// Descend into subdirectories
        #[arg(long)]
        recursive: bool,

        /// Also write the reports as JSON ("-" for stdout)
        #[arg(long)]
        json: Option<PathBuf>,

        /// Inputs scanned in parallel (default: MODGATE_CONCURRENCY)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Print the perceptual hash of an image
    Hash {
        /// Image file or URL
        image: String,
    },

    /// Add an image's perceptual hash to the allow- or blocklist
    #[command(group(ArgGroup::new("list").required(true).args(["allow", "block"])))]
    Learn {
        /// Image file or URL
        image: String,

        #[arg(long)]
        allow: bool,

        #[arg(long)]
        block: bool,

        /// Label stored next to the hash (default: ok / not_ok)
        #[arg(long)]
        label: Option<String>,
    },

    /// Show detector availability, list sizes and cache sizes
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    // Logs go to stderr so JSON on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("modgate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            inputs,
            no_apis,
            sample_frames,
            recursive,
            json,
            concurrency,
        } => {
            let config = Config::load()?;
            let state = SharedState::from_config(&config);
            let mut pipeline = Pipeline::from_config(&config, &state, no_apis)?;
            if let Some(n) = sample_frames {
                pipeline = pipeline.with_sample_frames(n);
            }

            let mut targets = Vec::new();
            for raw in &inputs {
                targets.extend(input::collect_inputs(raw, recursive)?);
            }
            if targets.is_empty() {
                bail!("No images found in: {}", inputs.join(", "));
            }

            let concurrency = concurrency.unwrap_or(config.pipeline.concurrency).max(1);
            info!(inputs = targets.len(), concurrency, no_apis, "Starting scan");

            let reports = scan_all(&pipeline, &targets, concurrency).await;

            let json_to_stdout = json.as_deref().is_some_and(|p| p.as_os_str() == "-");
            if !json_to_stdout {
                for report in &reports {
                    terminal::display_report(report, &config.display);
                }
                if reports.len() > 1 {
                    terminal::display_summary(&reports);
                }
            }
            if let Some(path) = &json {
                json::write_reports(path, &reports)?;
                if !json_to_stdout {
                    println!("\n{}", format!("JSON report saved to: {}", path.display()).bold());
                }
            }

            // Failures are already logged; a cache write never changes verdicts.
            let _ = state.flush();

            if !reports.iter().all(Report::is_ok) {
                std::process::exit(2);
            }
        }

        Commands::Hash { image } => {
            let (frame_path, _download) = resolve_image(&image).await?;
            let frames = frames::load_frames(&frame_path, 1)?;
            match frames.first() {
                Some(frame) => println!("{}  {}", frame.phash(), image),
                None => bail!("No frames decoded from {image}"),
            }
        }

        Commands::Learn {
            image,
            allow,
            block: _,
            label,
        } => {
            let config = Config::load()?;
            let state = SharedState::from_config(&config);
            let kind = if allow { ListKind::Allow } else { ListKind::Block };
            let label = label.unwrap_or_else(|| kind.default_label().to_string());

            let (frame_path, _download) = resolve_image(&image).await?;
            let frames = frames::load_frames(&frame_path, 1)?;
            let Some(frame) = frames.first() else {
                bail!("No frames decoded from {image}");
            };

            let path = config.list_path(kind);
            if state.phash.append(path, frame.phash(), &label)? {
                println!(
                    "{} {} -> {} ({})",
                    "Added".green(),
                    frame.phash(),
                    kind.as_str(),
                    path.display()
                );
            } else {
                println!("{} {} already in {}", "Skipped".dimmed(), frame.phash(), kind.as_str());
            }
        }

        Commands::Status => {
            let config = Config::load()?;
            let state = SharedState::from_config(&config);
            let pipeline = Pipeline::from_config(&config, &state, false)?;
            modgate::status::show(&config, &state, &pipeline)?;
        }
    }

    Ok(())
}

/// Scan every target, `concurrency` at a time, returning reports in input order.
async fn scan_all(pipeline: &Pipeline, targets: &[String], concurrency: usize) -> Vec<Report> {
    let pb = if targets.len() > 1 {
        let pb = ProgressBar::new(targets.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  Scanning [{bar:30}] {pos}/{len} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut indexed: Vec<(usize, Report)> =
        stream::iter(targets.iter().enumerate().map(|(idx, target)| {
            let pb = &pb;
            async move {
                let report = pipeline.run_on_input(target).await;
                pb.inc(1);
                (idx, report)
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await;
    pb.finish_and_clear();

    indexed.sort_by_key(|(idx, _)| *idx);
    indexed.into_iter().map(|(_, report)| report).collect()
}

/// Local path for `image`, downloading URLs into a temp file kept alive by the guard.
async fn resolve_image(image: &str) -> Result<(PathBuf, Option<input::TempInput>)> {
    if input::is_url(image) {
        let temp = input::download_to_temp(&reqwest::Client::new(), image).await?;
        Ok((temp.path.clone(), Some(temp)))
    } else {
        Ok((Path::new(image).to_path_buf(), None))
    }
}
