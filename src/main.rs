/*!
 * Covtrail CLI - Command Line Interface
 */

use clap::{Parser, Subcommand};
use covtrail::{
    config::UploadConfig,
    error::{Result, EXIT_SUCCESS},
    logging,
    upload::{
        progress::format_bytes, ChunkSink, ChunkedUploader, StagingSink, StateStore,
        UploadOptions, UploadProgress, UploadState,
    },
    CancellationToken,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "covtrail")]
#[command(version, about = "Chunked, resumable upload of coverage artifacts", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Directory for persisted session state
    #[arg(long, value_name = "DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Concurrent chunk workers
    #[arg(long, global = true)]
    parallel: Option<usize>,

    /// Chunk size in bytes
    #[arg(long, value_name = "BYTES", global = true)]
    chunk_size: Option<u64>,

    /// Attempts per chunk, including the first
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Initial retry delay in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    retry_delay_ms: Option<u64>,

    /// Always plan a fresh session
    #[arg(long, global = true)]
    no_resume: bool,

    /// Skip per-chunk SHA-256
    #[arg(long, global = true)]
    no_checksum: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file in chunks through a staging directory
    Upload {
        file: PathBuf,

        /// Directory receiving staged chunks
        #[arg(long, value_name = "DIR")]
        staging: PathBuf,

        /// Reassemble and verify the artifact here once every chunk landed
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Keep session state and staged chunks after a successful assembly
        #[arg(long)]
        keep_state: bool,
    },

    /// Continue an interrupted session
    Resume {
        session_id: String,
        file: PathBuf,

        #[arg(long, value_name = "DIR")]
        staging: PathBuf,

        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        #[arg(long)]
        keep_state: bool,
    },

    /// List incomplete sessions, oldest first
    List,

    /// Show progress of a session
    Status { session_id: String },

    /// Remove a session's persisted state
    Cleanup {
        session_id: String,

        /// Also remove staged chunks under this directory
        #[arg(long, value_name = "DIR")]
        staging: Option<PathBuf>,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    logging::init_logging(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(cli.command, config))
}

/// Merge the config file (if any) with command-line overrides
fn build_config(cli: &Cli) -> Result<UploadConfig> {
    let mut config = match &cli.config {
        Some(path) => UploadConfig::from_file(path)?,
        None => UploadConfig::default(),
    };

    if let Some(dir) = &cli.state_dir {
        config.state_dir = dir.clone();
    }
    if let Some(parallel) = cli.parallel {
        config.parallel_chunks = parallel;
    }
    if let Some(chunk_size) = cli.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(delay) = cli.retry_delay_ms {
        config.retry_delay_ms = delay;
    }
    if cli.no_resume {
        config.enable_resume = false;
    }
    if cli.no_checksum {
        config.checksum_verify = false;
    }
    if cli.verbose {
        config.verbose = true;
    }
    if cli.log_file.is_some() {
        config.log_file = cli.log_file.clone();
    }

    Ok(config)
}

async fn dispatch(command: Commands, config: UploadConfig) -> Result<()> {
    let uploader = ChunkedUploader::new(StateStore::new(&config.state_dir));

    match command {
        Commands::Upload {
            file,
            staging,
            output,
            keep_state,
        } => {
            let options = config.to_options()?;
            let cancel = cancel_on_ctrl_c();
            let state = uploader.start_partial_upload(&file, &options).await?;
            println!("Session: {}", state.session_id());

            let staging = StagingSink::new(staging);
            let state = transfer(&uploader, &file, state, options, &staging, &cancel).await?;
            finish(&uploader, &staging, &state, output.as_deref(), keep_state).await
        }

        Commands::Resume {
            session_id,
            file,
            staging,
            output,
            keep_state,
        } => {
            let options = config.to_options()?;
            let cancel = cancel_on_ctrl_c();
            let staging = StagingSink::new(staging);

            let state = uploader.store().load(&session_id).await?;
            let bar = progress_bar(&state);
            let sink: Arc<dyn ChunkSink> = Arc::new(staging.clone());
            let result = uploader
                .resume_upload(&session_id, &file, &with_bar(options, &bar), sink, &cancel)
                .await;
            let state = settle_bar(&bar, &session_id, result)?;
            finish(&uploader, &staging, &state, output.as_deref(), keep_state).await
        }

        Commands::List => {
            let states = uploader.list_incomplete_uploads().await?;
            if states.is_empty() {
                println!("No incomplete uploads");
            }
            let now = chrono::Utc::now();
            for state in &states {
                let progress = UploadProgress::from_state(state, now);
                println!("{}  {}  {}", state.session_id(), state.session.file_name, progress);
            }
            Ok(())
        }

        Commands::Status { session_id } => {
            let progress = uploader.get_upload_progress(&session_id).await?;
            println!("Session:  {}", progress.session_id);
            println!("File:     {}", progress.file_name);
            println!(
                "Status:   {}",
                if progress.completed { "completed" } else { "incomplete" }
            );
            println!("Progress: {}", progress);

            let state = uploader.store().load(&session_id).await?;
            for chunk in state.chunks.values().filter(|c| !c.uploaded) {
                if let Some(error) = &chunk.last_error {
                    println!(
                        "  chunk {} ({} retries): {}",
                        chunk.index, chunk.retries, error
                    );
                }
            }
            Ok(())
        }

        Commands::Cleanup {
            session_id,
            staging,
        } => {
            uploader.cleanup_upload_state(&session_id).await?;
            if let Some(staging) = staging {
                StagingSink::new(staging).discard(&session_id).await?;
            }
            println!("Removed session {}", session_id);
            Ok(())
        }
    }
}

/// Cancellation token fired by Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight chunks finish");
            trigger.cancel();
        }
    });
    cancel
}

fn progress_bar(state: &UploadState) -> ProgressBar {
    let bar = ProgressBar::new(state.session.file_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_position(state.uploaded_bytes);
    bar
}

fn with_bar(options: UploadOptions, bar: &ProgressBar) -> UploadOptions {
    let bar = bar.clone();
    options.with_progress_callback(move |update| bar.set_position(update.uploaded_bytes))
}

fn settle_bar<T>(bar: &ProgressBar, session_id: &str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            bar.finish();
            Ok(value)
        }
        Err(e) => {
            bar.abandon();
            if e.is_resumable() {
                eprintln!(
                    "Session {} can be resumed with: covtrail resume {} <FILE> --staging <DIR>",
                    session_id, session_id
                );
            }
            Err(e)
        }
    }
}

async fn transfer(
    uploader: &ChunkedUploader,
    file: &Path,
    mut state: UploadState,
    options: UploadOptions,
    staging: &StagingSink,
    cancel: &CancellationToken,
) -> Result<UploadState> {
    let bar = progress_bar(&state);
    let sink: Arc<dyn ChunkSink> = Arc::new(staging.clone());
    let session_id = state.session_id().to_string();

    let result = uploader
        .upload_chunks(file, &mut state, &with_bar(options, &bar), sink, cancel)
        .await;
    settle_bar(&bar, &session_id, result)?;
    Ok(state)
}

/// Verify, optionally assemble, and clean up a finished session
async fn finish(
    uploader: &ChunkedUploader,
    staging: &StagingSink,
    state: &UploadState,
    output: Option<&Path>,
    keep_state: bool,
) -> Result<()> {
    uploader.verify_upload(state)?;

    let Some(output) = output else {
        println!(
            "All {} chunks staged under {}",
            state.session.total_chunks,
            staging.session_dir(state.session_id()).display()
        );
        return Ok(());
    };

    let written = staging.assemble(state, output).await?;
    println!(
        "Assembled {} ({}) -> {}",
        state.session.file_name,
        format_bytes(written),
        output.display()
    );

    if !keep_state {
        uploader.cleanup_upload_state(state.session_id()).await?;
        staging.discard(state.session_id()).await?;
        info!(session_id = state.session_id(), "session cleaned up");
    }
    Ok(())
}
