//! This module defines the command-line interface for the application using `clap`.
//!
//! It provides a `Cli` struct that represents the parsed command-line arguments,
//! and a `Commands` enum that represents the available subcommands and their
//! options.
//!
//! # Examples
//!
//! ```no_run
//! use clap::Parser;
//! use sigma_rag::commands::{Cli, Commands};
//!
//! let cli = Cli::parse();
//! match cli.command {
//!     Commands::Ask { question, session } => println!("{session}: {question}"),
//!     Commands::Index { directory } => println!("indexing {}", directory.display()),
//!     Commands::Forget { session } => println!("forgetting {session}"),
//!     Commands::Init { force } => println!("init (force: {force})"),
//! }
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// Config file. Defaults to `config.yaml` in the platform config directory.
    #[arg(short, long, global = true, env = "SIGMA_RAG_CONFIG")]
    pub config: Option<PathBuf>,

    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// Represents the available subcommands and their options.
#[derive(Subcommand, Debug, PartialEq, Eq)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Ask a question against the knowledge base.
    #[clap(name = "ask", alias = "a")]
    Ask {
        question: String,

        /// Conversation to continue; its recent turns are sent as history.
        #[arg(name = "session", short = 's', long, default_value = "default")]
        session: String,
    },

    /// Index every markdown document under a directory.
    #[clap(name = "index")]
    Index { directory: PathBuf },

    /// Drop the stored history of a session.
    #[clap(name = "forget")]
    Forget {
        #[arg(name = "session", short = 's', long, default_value = "default")]
        session: String,
    },

    /// Write a starter config and prompt template to the config directory.
    Init {
        /// Overwrite existing files.
        #[arg(long)]
        force: bool,
    },
}
