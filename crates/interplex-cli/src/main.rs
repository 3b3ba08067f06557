//! Interplex CLI
//!
//! A command-line tool for running code on supervised interpreter engines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use interplex::{
    Config, EXAMPLE_CONFIG, ExecutionContext, ExecutionResult, Fragment, InterpreterHost,
    JobEventKind,
};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "interplex")]
#[command(about = "A tool for running code on supervised interpreter engines")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: interplex.toml)
        #[arg(short, long, default_value = "interplex.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run code on a binding and print its output
    Run {
        /// Binding ID (e.g., calc, calc-notebook)
        #[arg(short, long)]
        binding: String,

        /// File containing the code (default: stdin)
        #[arg(value_name = "FILE", conflicts_with = "expr")]
        source: Option<PathBuf>,

        /// Code given inline
        #[arg(short, long)]
        expr: Option<String>,

        /// Owner of the execution context
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Collection of the execution context
        #[arg(long, default_value = "default")]
        collection: String,

        /// Scope of the execution context
        #[arg(long, default_value = "main")]
        scope: String,

        /// Print progress as it is reported
        #[arg(long)]
        progress: bool,
    },

    /// List configured bindings
    Bindings,

    /// Show default configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            binding,
            source,
            expr,
            owner,
            collection,
            scope,
            progress,
        } => {
            let code = match (expr, source) {
                (Some(expr), _) => expr,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?,
                (None, None) => read_stdin().await?,
            };
            let context = ExecutionContext::new(owner, collection, scope);
            run_code(config, &binding, &context, code, progress).await
        }
        Commands::Bindings => {
            list_bindings(&config);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

async fn read_stdin() -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut code = String::new();
    tokio::io::stdin()
        .read_to_string(&mut code)
        .await
        .context("failed to read code from stdin")?;
    Ok(code)
}

async fn run_code(
    config: Config,
    binding_id: &str,
    context: &ExecutionContext,
    code: String,
    show_progress: bool,
) -> Result<()> {
    config
        .get_binding(binding_id)
        .context("unknown binding")?;

    let host = InterpreterHost::new(config).context("failed to start interpreter host")?;
    let mut events = host.subscribe();

    info!(binding = binding_id, %context, "submitting job");
    let ticket = host
        .submit(binding_id, context, code)
        .context("failed to submit job")?;
    let job_id = ticket.job_id();

    // Print output as it streams in; the final result only adds what was not streamed
    let wait = ticket.wait();
    tokio::pin!(wait);
    let mut streamed = 0usize;
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            Ok(event) = events.recv() => {
                if event.job_id != job_id {
                    continue;
                }
                match event.kind {
                    JobEventKind::Output(fragment) => {
                        print_fragment(&fragment);
                        streamed += 1;
                    }
                    JobEventKind::Progress(percent) if show_progress => {
                        eprintln!("[{percent:>3}%]");
                    }
                    _ => {}
                }
            }
        }
    };

    host.shutdown().await;
    report(&result, streamed)
}

fn print_fragment(fragment: &Fragment) {
    match fragment {
        Fragment::Text(text) => println!("{text}"),
        Fragment::Html(html) => println!("{html}"),
        Fragment::Error(message) => eprintln!("error: {message}"),
        Fragment::Table(table) => {
            println!("{}", table.columns.join("\t"));
            for row in &table.rows {
                println!("{}", row.join("\t"));
            }
        }
    }
}

fn report(result: &ExecutionResult, streamed: usize) -> Result<()> {
    for fragment in result.fragments.iter().skip(streamed) {
        print_fragment(fragment);
    }

    info!(
        status = %result.status,
        elapsed = format_args!("{:.3}s", result.elapsed.as_secs_f64()),
        handle = ?result.handle,
        "job finished"
    );

    match &result.error {
        None => Ok(()),
        Some(error) => {
            for line in &error.stderr_tail {
                eprintln!("  | {line}");
            }
            eprintln!("{}: {error}", result.status);
            std::process::exit(1);
        }
    }
}

fn list_bindings(config: &Config) {
    println!("Available bindings:\n");

    let mut bindings: Vec<_> = config.bindings.iter().collect();
    bindings.sort_by_key(|(id, _)| *id);

    for (id, binding) in bindings {
        println!(
            "  {:<15} {} ({}, {})",
            id, binding.name, binding.engine, binding.policy
        );
    }
}

fn show_config(config: &Config) {
    let limits = &config.default_limits;
    println!("Default engine limits:");
    println!("  Concurrency limit: {:?}", limits.concurrency_limit);
    println!("  Queue depth: {:?}", limits.queue_depth);
    println!("  Job timeout: {:?} s", limits.job_timeout);
    println!("  Startup timeout: {:?} s", limits.startup_timeout);
    println!("  Idle timeout: {:?} s", limits.idle_timeout);
    println!("  Cancel grace: {:?} s", limits.cancel_grace);
    println!("  Shutdown grace: {:?} s", limits.shutdown_grace);
    println!();
    println!("Callback host: {}", config.callback_host);
    println!("Reap interval: {:?}", config.reap_interval());
    println!("Handshake retries: {}", config.handshake_retries);
    println!();
    println!("Bindings configured: {}", config.bindings.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
