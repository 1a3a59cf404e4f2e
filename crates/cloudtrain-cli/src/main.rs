//! cloudtrain - train, deploy and query a CIFAR-10 classifier on a managed
//! ML service.
//!
//! ## Commands
//!
//! - `run`: the whole pipeline, endpoint torn down at the end
//! - `fetch` / `upload` / `train` / `artifacts`: individual steps
//! - `deploy` / `predict` / `teardown`: endpoint lifecycle
//! - `show-config`: print the effective configuration as TOML

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use cloudtrain_core::dataset::{package, sample_images, DatasetFetcher, Split};
use cloudtrain_core::{
    dataset_prefixes, deploy, launch, predict, reclaim, retrieve_artifacts, training_channels,
    upload_directory, DeploySpec, EndpointHandle, PipelineConfig, PipelineReport, Session,
    TrainingJobSpec, TrainingPipeline,
};
use cloudtrain_service::{ManagedCloud, ObjectUri, RestCloud, RestConfig};

#[derive(Parser)]
#[command(name = "cloudtrain")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Train and serve an image classifier on a managed ML service", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CLOUDTRAIN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage: fetch, upload, train, deploy, predict, reclaim
    Run {
        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Leave the endpoint running after predictions
        #[arg(long)]
        keep_endpoint: bool,
    },

    /// Download the dataset and package it as .npy partitions
    Fetch,

    /// Upload the packaged partitions to the session bucket
    Upload,

    /// Launch a training job and wait for it to finish
    Train {
        /// Train channel location (default: uploaded train prefix)
        #[arg(long)]
        train: Option<ObjectUri>,

        /// Test channel location (default: uploaded test prefix)
        #[arg(long)]
        test: Option<ObjectUri>,
    },

    /// Download and unpack a job's output data archive
    Artifacts {
        /// Location of output.tar.gz
        #[arg(long)]
        output_data: ObjectUri,

        /// Destination directory (default: run.artifacts_dir)
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Host a trained model artifact on a new endpoint
    Deploy {
        /// Location of model.tar.gz
        #[arg(long)]
        model_artifact: ObjectUri,
    },

    /// Classify test images with a live endpoint
    Predict {
        #[arg(long)]
        endpoint: String,

        /// Number of test images to send (default: run.sample_count)
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Delete an endpoint and its model
    Teardown {
        #[arg(long)]
        endpoint: String,

        /// Model name (default: same as the endpoint)
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cloudtrain_core::init_tracing(cli.json, level);

    let config = PipelineConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;

    if let Commands::ShowConfig = cli.command {
        return cmd_show_config(&config);
    }

    let mut rest = RestConfig::new(&config.service.base_url);
    if let Some(token) = &config.service.token {
        rest = rest.with_token(token);
    }
    let cloud = RestCloud::new(rest).context("Failed to build service client")?;

    match cli.command {
        Commands::Run {
            report,
            keep_endpoint,
        } => cmd_run(&cloud, config, report.as_deref(), keep_endpoint).await,
        Commands::Fetch => cmd_fetch(&config).await,
        Commands::Upload => cmd_upload(&cloud, &config).await,
        Commands::Train { train, test } => cmd_train(&cloud, &config, train, test).await,
        Commands::Artifacts { output_data, dest } => {
            cmd_artifacts(&cloud, &config, &output_data, dest.as_deref()).await
        }
        Commands::Deploy { model_artifact } => cmd_deploy(&cloud, &config, &model_artifact).await,
        Commands::Predict { endpoint, count } => {
            cmd_predict(&cloud, &config, &endpoint, count).await
        }
        Commands::Teardown { endpoint, model } => {
            let model = model.unwrap_or_else(|| endpoint.clone());
            cmd_teardown(&cloud, &endpoint, &model).await
        }
        Commands::ShowConfig => Ok(()),
    }
}

async fn cmd_run<C: ManagedCloud>(
    cloud: &C,
    mut config: PipelineConfig,
    report_path: Option<&Path>,
    keep_endpoint: bool,
) -> Result<()> {
    if keep_endpoint {
        config.run.reclaim_endpoint = false;
    }
    let report = TrainingPipeline::run(cloud, &config)
        .await
        .context("Pipeline failed")?;

    print_report(&report);
    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!("Run {}", report.run_id);
    println!("  Job:      {}", report.job.job_name);
    println!("  Model:    {}", report.job.model_artifact);
    if let Some(artifacts) = &report.artifacts {
        println!("  Plots:    {}", artifacts.plots.len());
    }
    for (prediction, truth) in report.predictions.iter().zip(&report.true_labels) {
        println!(
            "  predicted {:<10} ({:.2})  actual {}",
            prediction.class_name, prediction.confidence, truth
        );
    }
    if let Some(accuracy) = report.accuracy() {
        println!("  Accuracy: {:.1}%", accuracy * 100.0);
    }
    if let Some(endpoint) = &report.endpoint {
        println!(
            "  Endpoint {} is still running; remove it with `cloudtrain teardown --endpoint {}`",
            endpoint.endpoint_name, endpoint.endpoint_name
        );
    }
    println!("  Duration: {} ms", report.duration_ms);
}

async fn cmd_fetch(config: &PipelineConfig) -> Result<()> {
    let fetcher = DatasetFetcher::from_config(&config.dataset);
    let fetched = fetcher.fetch().await.context("Failed to fetch dataset")?;
    let packaged = package(&fetched.dataset, &config.dataset.data_dir())
        .context("Failed to package dataset")?;
    println!("train: {}", packaged.train_dir.display());
    println!("test:  {}", packaged.test_dir.display());
    Ok(())
}

async fn cmd_upload<C: ManagedCloud>(cloud: &C, config: &PipelineConfig) -> Result<()> {
    let session = Session::resolve(cloud, config)
        .await
        .context("Failed to resolve session")?;
    let data_dir = config.dataset.data_dir();
    let (train_prefix, test_prefix) = dataset_prefixes(&session, &config.dataset);
    for (split, prefix) in [(Split::Train, train_prefix), (Split::Test, test_prefix)] {
        let dir = data_dir.join(split.name());
        let report = upload_directory(cloud, &dir, &prefix)
            .await
            .with_context(|| format!("Failed to upload {}", dir.display()))?;
        println!(
            "{}: {} ({} files, {} bytes)",
            split.name(),
            report.prefix,
            report.objects.len(),
            report.total_bytes()
        );
    }
    Ok(())
}

async fn cmd_train<C: ManagedCloud>(
    cloud: &C,
    config: &PipelineConfig,
    train: Option<ObjectUri>,
    test: Option<ObjectUri>,
) -> Result<()> {
    let session = Session::resolve(cloud, config)
        .await
        .context("Failed to resolve session")?;
    let (train_prefix, test_prefix) = dataset_prefixes(&session, &config.dataset);
    let channels = training_channels(
        &train.unwrap_or(train_prefix),
        &test.unwrap_or(test_prefix),
    );
    let spec = TrainingJobSpec::from_config(&config.training, channels);
    let job = launch(cloud, &session, &spec)
        .await
        .context("Training job failed")?;
    println!("job:         {}", job.job_name);
    println!("model:       {}", job.model_artifact);
    if let Some(output) = &job.output_data {
        println!("output data: {}", output);
    }
    Ok(())
}

async fn cmd_artifacts<C: ManagedCloud>(
    cloud: &C,
    config: &PipelineConfig,
    output_data: &ObjectUri,
    dest: Option<&Path>,
) -> Result<()> {
    let dest = dest.unwrap_or(config.run.artifacts_dir.as_path());
    let retrieved = retrieve_artifacts(cloud, output_data, dest)
        .await
        .with_context(|| format!("Failed to retrieve {}", output_data))?;
    println!("unpacked to {}", retrieved.dir.display());
    for plot in &retrieved.plots {
        println!("  {}", plot.display());
    }
    Ok(())
}

async fn cmd_deploy<C: ManagedCloud>(
    cloud: &C,
    config: &PipelineConfig,
    model_artifact: &ObjectUri,
) -> Result<()> {
    let session = Session::resolve(cloud, config)
        .await
        .context("Failed to resolve session")?;
    let handle = deploy(
        cloud,
        &session,
        model_artifact,
        &DeploySpec::from_config(&config.hosting),
    )
    .await
    .context("Failed to deploy endpoint")?;
    println!("endpoint: {}", handle.endpoint_name);
    println!("model:    {}", handle.model_name);
    println!(
        "The endpoint bills until removed: cloudtrain teardown --endpoint {} --model {}",
        handle.endpoint_name, handle.model_name
    );
    Ok(())
}

async fn cmd_predict<C: ManagedCloud>(
    cloud: &C,
    config: &PipelineConfig,
    endpoint: &str,
    count: Option<usize>,
) -> Result<()> {
    let count = count.unwrap_or(config.run.sample_count);
    let batches_dir = DatasetFetcher::from_config(&config.dataset).batches_dir();
    let samples = sample_images(&batches_dir, count)
        .with_context(|| format!("Failed to read samples from {}", batches_dir.display()))?;
    let (images, labels): (Vec<_>, Vec<_>) = samples.into_iter().unzip();

    let handle = EndpointHandle::attach(endpoint, endpoint);
    let predictions = predict(cloud, &handle, &images)
        .await
        .context("Prediction failed")?;
    for (prediction, truth) in predictions.iter().zip(&labels) {
        println!(
            "predicted {:<10} ({:.2})  actual {}",
            prediction.class_name, prediction.confidence, truth
        );
    }
    Ok(())
}

async fn cmd_teardown<C: ManagedCloud>(cloud: &C, endpoint: &str, model: &str) -> Result<()> {
    reclaim(cloud, EndpointHandle::attach(endpoint, model))
        .await
        .with_context(|| format!("Failed to tear down endpoint {}", endpoint))?;
    println!("deleted endpoint {} and model {}", endpoint, model);
    Ok(())
}

fn cmd_show_config(config: &PipelineConfig) -> Result<()> {
    print!("{}", config.to_toml().context("Failed to render configuration")?);
    Ok(())
}
