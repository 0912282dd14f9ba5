//! Main module for the sigma-rag CLI.
//!
//! Parses the command line, loads configuration and runs the requested command.
//!
//! # Examples
//!
//! Writing a starter config and template:
//!
//! ```sh
//! sigma-rag init
//! ```
//!
//! Indexing a knowledge base and asking a question:
//!
//! ```sh
//! sigma-rag index ./knowledge_base
//! sigma-rag ask "What are the phases of DMAIC?" -s green-belt
//! ```

use clap::Parser;
use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor},
};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::OnceCell;
use std::{error::Error, fs, io::stdout, path::Path};
use tracing::{debug, info};

use sigma_rag::{
    build_service,
    commands::{Cli, Commands},
    config::{self, RagConfig},
    config_dir,
    conversation::Turn,
    ingest,
    rag::{GenerationResult, Outcome},
    session_messages::SessionStore,
    template::PromptTemplate,
};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run())
}

/// Parse arguments, load configuration and dispatch.
///
/// # Errors
///
/// Returns an error if the configuration can't be loaded, the vector store can't
/// be bootstrapped, or the session database is unusable.
async fn run() -> Result<(), Box<dyn Error>> {
    let Cli { config, command } = Cli::parse();

    if let Commands::Init { force } = command {
        return init(force);
    }

    let config_path = match config {
        Some(path) => path,
        None => config_dir()?.join("config.yaml"),
    };
    debug!("Loading config from: {}", config_path.display());
    let rag_config = config::load_config(&config_path.to_string_lossy())?;

    match command {
        Commands::Ask { question, session } => ask(&rag_config, &question, &session).await,
        Commands::Index { directory } => index(&rag_config, &directory).await,
        Commands::Forget { session } => forget(&rag_config, &session),
        Commands::Init { .. } => Ok(()),
    }
}

async fn ask(config: &RagConfig, question: &str, session: &str) -> Result<(), Box<dyn Error>> {
    let mut store = SessionStore::open(&config.session_db_url)?;
    let history = store.load_turns(session, config.generation.memory_turns)?;
    debug!("Loaded {} turns for session {}", history.len(), session);

    let service = build_service(config).await?;
    if service.is_degraded() {
        print_colored(
            Color::Yellow,
            "Knowledge base unavailable; answering without retrieval.\n",
        )?;
    }

    let result = service.generate_response(question, &history).await;
    print_answer(&result)?;

    if result.outcome == Outcome::Answered {
        store.append_turns(
            session,
            &[Turn::user(question.trim()), Turn::assistant(&result.response)],
        )?;
    }
    Ok(())
}

async fn index(config: &RagConfig, directory: &Path) -> Result<(), Box<dyn Error>> {
    let service = build_service(config).await?;
    if service.is_degraded() {
        return Err(format!(
            "vector store at {} is unavailable; nothing indexed",
            config.vector_index.url
        )
        .into());
    }

    let files = ingest::markdown_files(directory)?;
    info!("Found {} documents under {}", files.len(), directory.display());

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")?
            .progress_chars("=> "),
    );
    let report = ingest::index_files(&service, directory, &files, &progress).await;
    progress.finish_and_clear();

    print_colored(
        Color::Green,
        &format!("Indexed {} documents", report.indexed),
    )?;
    if report.skipped.is_empty() {
        println!();
    } else {
        print_colored(
            Color::Yellow,
            &format!(", skipped {}:\n", report.skipped.len()),
        )?;
        for path in &report.skipped {
            println!("  {}", ingest::source_for(directory, path));
        }
    }
    Ok(())
}

fn forget(config: &RagConfig, session: &str) -> Result<(), Box<dyn Error>> {
    let removed = SessionStore::open(&config.session_db_url)?.clear(session)?;
    println!("Removed {} turns from session {}", removed, session);
    Ok(())
}

fn print_colored(color: Color, text: &str) -> Result<(), Box<dyn Error>> {
    stdout()
        .execute(SetForegroundColor(color))?
        .execute(Print(text))?
        .execute(ResetColor)?;
    Ok(())
}

fn print_answer(result: &GenerationResult) -> Result<(), Box<dyn Error>> {
    let color = match result.outcome {
        Outcome::Answered => Color::White,
        _ => Color::Yellow,
    };
    print_colored(color, &format!("{}\n", result.response))?;

    if !result.sources.is_empty() {
        stdout()
            .execute(SetAttribute(Attribute::Bold))?
            .execute(Print("\nSources:\n"))?
            .execute(SetAttribute(Attribute::Reset))?;
        for (i, source) in result.sources.iter().enumerate() {
            let meta = &source.metadata;
            let title = if meta.title.is_empty() {
                meta.source.as_str()
            } else {
                meta.title.as_str()
            };
            print_colored(
                Color::DarkGrey,
                &format!("  [{}] {} ({}) {}\n", i + 1, title, meta.category, meta.source),
            )?;
        }
    }
    Ok(())
}

/// Write a starter config and the default template into the config directory.
///
/// Existing files are left alone unless `force` is set.
fn init(force: bool) -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates = config_dir.join("templates");
    info!("Creating template config directory: {}", templates.display());
    fs::create_dir_all(&templates)?;

    let template_path = templates.join("lean_six_sigma.yaml");
    write_unless_present(
        &template_path,
        &serde_yaml::to_string(&PromptTemplate::default())?,
        force,
    )?;

    let mut starter = RagConfig::default();
    starter.llm.api_key = "CHANGEME".to_string();
    starter.generation.template = Some("lean_six_sigma".to_string());
    starter.session_db_url = config_dir.join("sessions.db").to_string_lossy().into_owned();
    write_unless_present(
        &config_dir.join("config.yaml"),
        &serde_yaml::to_string(&starter)?,
        force,
    )?;

    Ok(())
}

fn write_unless_present(path: &Path, content: &str, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        println!("Keeping existing {}", path.display());
        return Ok(());
    }
    info!("Creating file: {}", path.display());
    fs::write(path, content)?;
    println!("Wrote {}", path.display());
    Ok(())
}
