//! AgentLong benchmark CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agentlong_bench::{
    analysis::{EvalOptions, Evaluator},
    config::Config,
    dataset::{find_dataset_files, load_dataset, LoadedDataset},
    prompt::build_prompt,
    providers::{create_backend, InferenceBackend, VllmOptions, VllmServer},
    reporting::{print_console_report, print_run_summary, JsonSummary},
    runner::{select_records, ConsoleProgress, Executor, ExecutorConfig, RunOptions, RunSummary},
};

#[derive(Parser)]
#[command(name = "agentlong-bench")]
#[command(about = "Long-context agent-interaction benchmark: inference and evaluation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a dataset file against a configured service
    Run {
        /// Dataset JSONL file
        #[arg(short, long)]
        dataset: PathBuf,

        /// Prediction JSONL file to write
        #[arg(short, long)]
        output: PathBuf,

        /// Service name from the config (default: [runner].service or the first one)
        #[arg(short, long)]
        service: Option<String>,

        /// Only the first N records after the offset
        #[arg(long)]
        limit: Option<usize>,

        /// Skip the first N records
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Concurrent backend calls
        #[arg(short, long)]
        workers: Option<usize>,

        /// Overwrite the output instead of skipping completed records
        #[arg(long)]
        no_resume: bool,

        /// Request whole responses instead of streamed ones
        #[arg(long)]
        no_stream: bool,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        top_p: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Start a local vLLM engine and run a dataset file against it
    RunOffline {
        /// Dataset JSONL file
        #[arg(short, long)]
        dataset: PathBuf,

        /// Prediction JSONL file to write
        #[arg(short, long)]
        output: PathBuf,

        /// Model path or hub name
        #[arg(short, long)]
        model: String,

        #[arg(long)]
        tokenizer: Option<String>,

        #[arg(long, default_value = "512")]
        max_new_tokens: u32,

        #[arg(long, default_value = "0.2")]
        temperature: f32,

        #[arg(long, default_value = "0.9")]
        top_p: f32,

        #[arg(long, default_value = "1")]
        tensor_parallel_size: u32,

        #[arg(long, default_value = "1")]
        pipeline_parallel_size: u32,

        #[arg(long, default_value = "auto")]
        dtype: String,

        #[arg(long, default_value = "0.9")]
        gpu_memory_utilization: f32,

        #[arg(long)]
        trust_remote_code: bool,

        /// Server port (default: [offline].port)
        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value = "0")]
        offset: usize,

        #[arg(long)]
        no_resume: bool,

        /// Concurrent requests to the engine
        #[arg(short, long, default_value = "8")]
        workers: usize,
    },

    /// Score prediction files against their datasets
    Evaluate {
        /// Dataset JSONL file; repeat together with --pred
        #[arg(short, long, required = true)]
        dataset: Vec<PathBuf>,

        /// Prediction JSONL file, paired with the --dataset at the same position
        #[arg(short, long, required = true)]
        pred: Vec<PathBuf>,

        /// Parse raw responses again instead of trusting stored answers
        #[arg(long)]
        reparse: bool,

        /// Write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show what a dataset file (or directory of them) contains
    Inspect {
        #[arg(short, long)]
        dataset: PathBuf,
    },

    /// Write the prompts of a dataset file to text files for review
    DumpPrompts {
        #[arg(short, long)]
        dataset: PathBuf,

        /// Output directory for prompt files
        #[arg(short, long, default_value = "results/prompts")]
        output: PathBuf,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// List configured services
    ListServices,

    /// Generate sample configuration
    InitConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config/models.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("agentlong_bench=debug,info")
        } else {
            EnvFilter::new("agentlong_bench=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            dataset,
            output,
            service,
            limit,
            offset,
            workers,
            no_resume,
            no_stream,
            temperature,
            top_p,
            max_tokens,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let (name, service_config) = config.select_service(service.as_deref())?;
            let backend = create_backend(name, service_config)?;

            let mut settings = config.runner.clone();
            if let Some(workers) = workers {
                settings.workers = workers;
            }
            if no_stream {
                settings.stream = false;
            }
            if let Some(t) = temperature {
                settings.temperature = t;
            }
            if top_p.is_some() {
                settings.top_p = top_p;
            }
            if max_tokens.is_some() {
                settings.max_tokens = max_tokens;
            }

            let options = RunOptions {
                offset,
                limit,
                resume: !no_resume,
            };
            let dataset = load_dataset(&dataset)?;
            let summary = run_dataset(
                backend,
                ExecutorConfig::from_settings(&settings),
                &dataset,
                &output,
                &options,
            )
            .await?;
            match summary {
                Some(summary) => print_run_summary(&summary),
                None => std::process::exit(130),
            }
        }

        Commands::RunOffline {
            dataset,
            output,
            model,
            tokenizer,
            max_new_tokens,
            temperature,
            top_p,
            tensor_parallel_size,
            pipeline_parallel_size,
            dtype,
            gpu_memory_utilization,
            trust_remote_code,
            port,
            limit,
            offset,
            no_resume,
            workers,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let mut offline = config.offline.clone();
            if let Some(port) = port {
                offline.port = port;
            }
            let dataset = load_dataset(&dataset)?;

            let vllm = VllmOptions {
                model,
                tokenizer,
                tensor_parallel_size,
                pipeline_parallel_size,
                dtype,
                gpu_memory_utilization,
                trust_remote_code,
            };
            let server = VllmServer::launch(&vllm, &offline).await?;

            let mut executor_config = ExecutorConfig::from_settings(&config.runner);
            executor_config.workers = workers.max(1);
            executor_config.params.max_tokens = Some(max_new_tokens);
            executor_config.params.temperature = Some(temperature);
            executor_config.params.top_p = Some(top_p);

            let options = RunOptions {
                offset,
                limit,
                resume: !no_resume,
            };
            let result = run_dataset(
                Arc::new(server.backend()),
                executor_config,
                &dataset,
                &output,
                &options,
            )
            .await;
            server.shutdown().await?;

            match result? {
                Some(summary) => print_run_summary(&summary),
                None => std::process::exit(130),
            }
        }

        Commands::Evaluate {
            dataset,
            pred,
            reparse,
            output,
        } => {
            evaluate(dataset, pred, reparse, output)?;
        }

        Commands::Inspect { dataset } => {
            inspect(&dataset)?;
        }

        Commands::DumpPrompts {
            dataset,
            output,
            limit,
        } => {
            dump_prompts(&dataset, &output, limit)?;
        }

        Commands::ListServices => {
            let config = load_config(cli.config.as_deref())?;
            list_services(&config);
        }

        Commands::InitConfig { output } => {
            init_config(output)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(Config::load(path)?.with_env_services(std::env::vars()))
}

/// Run until done or Ctrl-C; `None` means interrupted
async fn run_dataset(
    backend: Arc<dyn InferenceBackend>,
    config: ExecutorConfig,
    dataset: &LoadedDataset,
    output: &Path,
    options: &RunOptions,
) -> Result<Option<RunSummary>, Box<dyn std::error::Error>> {
    println!("\n=== AgentLong Inference ===\n");
    println!("Dataset:  {} ({} records, {})", dataset.source, dataset.len(), dataset.question_type);
    println!("Backend:  {} ({})", backend.name(), backend.default_model());
    println!("Workers:  {}", config.workers);
    println!("Output:   {}", output.display());
    println!();

    let executor =
        Executor::new(backend, config).with_progress(Arc::new(ConsoleProgress { every: 10 }));

    tokio::select! {
        result = executor.run(dataset, output, options) => Ok(Some(result?)),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; completed predictions are kept in {}", output.display());
            Ok(None)
        }
    }
}

fn evaluate(
    datasets: Vec<PathBuf>,
    predictions: Vec<PathBuf>,
    reparse: bool,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    if datasets.len() != predictions.len() {
        return Err(format!(
            "{} --dataset given but {} --pred; they pair up by position",
            datasets.len(),
            predictions.len()
        )
        .into());
    }

    let pairs: Vec<(PathBuf, PathBuf)> = datasets.into_iter().zip(predictions).collect();
    let report = Evaluator::new(EvalOptions { reparse }).evaluate_pairs(&pairs)?;
    print_console_report(&report);

    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        JsonSummary::new(report).write_to_file(&path)?;
        println!("Report written to: {}", path.display());
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let files = if path.is_dir() {
        find_dataset_files(path)?
    } else {
        vec![path.to_path_buf()]
    };

    println!("Dataset Files ({}):", files.len());
    println!("{:-<60}", "");

    let mut failures = 0;
    for file in &files {
        match load_dataset(file) {
            Ok(dataset) => {
                println!(
                    "  {} | {} records | {} | {} | {}{}",
                    file.display(),
                    dataset.len(),
                    dataset.question_type,
                    dataset.knowledge_type.label(),
                    dataset.history_type.label(),
                    if dataset.malformed > 0 {
                        format!(" | {} malformed", dataset.malformed)
                    } else {
                        String::new()
                    }
                );
            }
            Err(e) => {
                failures += 1;
                eprintln!("  [ERROR] {}: {}", file.display(), e);
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} of {} dataset files failed to load", failures, files.len()).into());
    }
    Ok(())
}

fn dump_prompts(
    dataset_path: &Path,
    output_dir: &Path,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dataset = load_dataset(dataset_path)?;
    let records = select_records(&dataset.records, 0, limit);

    std::fs::create_dir_all(output_dir)?;

    println!("=== Dumping Prompts ===");
    println!("Records: {}", records.len());
    println!("Output: {}", output_dir.display());
    println!();

    let mut written = 0;
    for record in records {
        match build_prompt(record) {
            Ok(prompt) => {
                let filename = format!(
                    "{}-{}.txt",
                    record.question_type.slug(),
                    file_safe(&record.id)
                );
                let content = format!(
                    "=== Prompt: {} ===\n\
                     Question Type: {}\n\
                     Knowledge:     {}\n\
                     History:       {}\n\
                     Messages:      {}\n\
                     {}\n\n\
                     {}",
                    record.id,
                    record.question_type,
                    record.knowledge_type.label(),
                    record.history_type.label(),
                    prompt.messages.len(),
                    "=".repeat(50),
                    prompt.render_text(),
                );
                std::fs::write(output_dir.join(&filename), &content)?;
                println!("  {} -> {}", record.id, filename);
                written += 1;
            }
            Err(e) => {
                eprintln!("  [ERROR] {}: {}", record.id, e);
            }
        }
    }

    println!("\nDone. {} files written to {}", written, output_dir.display());
    Ok(())
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn list_services(config: &Config) {
    println!("Configured Services ({}):", config.services.len());
    println!("{:-<60}", "");

    for (name, service) in &config.services {
        let default = if config.runner.service.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        println!(
            "  {}{} | {:?} | {} | {}",
            name, default, service.api_style, service.model_name, service.base_url
        );
    }
}

fn init_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::sample();

    // Ensure parent directory exists
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    config.save_toml(&output)?;
    println!("Configuration written to: {}", output.display());
    Ok(())
}
