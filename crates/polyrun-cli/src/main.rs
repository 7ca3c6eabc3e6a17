//! polyrun CLI - run code fragments in many languages from one place.

mod cache_cmd;
mod colors;
mod output;
mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use polyrun_core::EngineConfig;

#[derive(Parser)]
#[command(name = "polyrun")]
#[command(about = "Polyglot execution engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker threads in the shared pool
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Engine home (cache and scratch directories)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a code fragment in a registered language
    Run {
        /// Language tag (shell, python, javascript, rust, ...)
        #[arg(short, long)]
        lang: String,

        /// Inline code to run
        code: Option<String>,

        /// Read the code from a file instead
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Timeout in milliseconds (0 waits forever)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Argument passed to the code, as JSON (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Retry a failing run this many times
        #[arg(long, default_value = "0")]
        retries: usize,

        /// Delay between retries in milliseconds
        #[arg(long, default_value = "1000")]
        retry_delay_ms: u64,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a code fragment through an ad-hoc command template
    Exec {
        /// Command template; `{}` is replaced with the source file path
        #[arg(short, long)]
        template: String,

        /// Extension of the temporary source file
        #[arg(long, default_value = ".txt")]
        ext: String,

        /// Name reported for the language
        #[arg(long, default_value = "custom")]
        name: String,

        /// Inline code to run
        code: String,

        /// Timeout in milliseconds (0 waits forever)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run every block of a JSON file concurrently
    Parallel {
        /// JSON array of {"language", "code", "args"} objects
        blocks: PathBuf,

        /// Timeout per block in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Race fragments in one language; the first success wins
    Race {
        /// Language tag shared by all fragments
        #[arg(short, long)]
        lang: String,

        /// Code fragments to race
        #[arg(required = true)]
        codes: Vec<String>,

        /// Overall timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or maintain the compiled-artifact cache
    Cache {
        #[command(subcommand)]
        action: cache_cmd::CacheAction,
    },

    /// List registered languages
    Languages,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = EngineConfig::from_env();
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }
    if let Some(home) = cli.home {
        config.home = home;
    }

    // Surface the variant's kind next to its message
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<polyrun_core::Error>() {
            anyhow::anyhow!("{} ({})", core_err, core_err.kind_name())
        } else {
            err
        }
    };

    let succeeded = match cli.command {
        Commands::Run {
            lang,
            code,
            file,
            timeout_ms,
            args,
            retries,
            retry_delay_ms,
            json,
        } => {
            let request = run::RunRequest {
                lang,
                code,
                file,
                timeout_ms,
                args,
                retries,
                retry_delay_ms,
                json,
            };
            run::execute(config, request).map_err(format_error)?
        }

        Commands::Exec {
            template,
            ext,
            name,
            code,
            timeout_ms,
            json,
        } => run::exec(config, &name, &template, &ext, &code, timeout_ms, json)
            .map_err(format_error)?,

        Commands::Parallel {
            blocks,
            timeout_ms,
            json,
        } => run::parallel(config, &blocks, timeout_ms, json).map_err(format_error)?,

        Commands::Race {
            lang,
            codes,
            timeout_ms,
            json,
        } => run::race(config, &lang, &codes, timeout_ms, json).map_err(format_error)?,

        Commands::Cache { action } => {
            cache_cmd::execute(&config, action).map_err(format_error)?;
            true
        }

        Commands::Languages => {
            run::languages(config).map_err(format_error)?;
            true
        }
    };

    if !succeeded {
        std::process::exit(1);
    }

    Ok(())
}
