//! Command-line surface. Flags map onto [`JobConfig`] fields; the
//! controller does the rest.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{ApiVersion, EpubFormat, JobConfig};

/// Resumable crawler and EPUB builder for a subscription digital library.
#[derive(Debug, Parser)]
#[command(name = "skillshelf", version, about)]
pub struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (debug level).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// EPUB build variant, as a CLI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Legacy,
    Enhanced,
    Kindle,
    Dual,
}

impl From<FormatArg> for EpubFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Legacy => Self::Legacy,
            FormatArg::Enhanced => Self::Enhanced,
            FormatArg::Kindle => Self::Kindle,
            FormatArg::Dual => Self::Dual,
        }
    }
}

/// Search API dialect, as a CLI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ApiVersionArg {
    V1,
    V2,
}

impl From<ApiVersionArg> for ApiVersion {
    fn from(value: ApiVersionArg) -> Self {
        match value {
            ApiVersionArg::V1 => Self::V1,
            ApiVersionArg::V2 => Self::V2,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover books for each topic and write per-topic manifests.
    Discover {
        /// Topic catalogue file (overrides the configured one).
        #[arg(long)]
        skills_file: Option<PathBuf>,

        /// Only topics whose names contain one of these strings.
        #[arg(short, long, num_args = 1..)]
        skills: Vec<String>,

        /// Re-discover topics that already have manifests.
        #[arg(short, long)]
        update: bool,

        /// Search API dialect.
        #[arg(long, value_enum)]
        api: Option<ApiVersionArg>,

        /// Hard cap on search pages per topic.
        #[arg(long)]
        max_pages: Option<u32>,
    },

    /// Download discovered books and build their EPUB packages.
    Download {
        /// Only topics whose names contain one of these strings.
        #[arg(short, long, num_args = 1..)]
        skills: Vec<String>,

        /// Per-topic book cap.
        #[arg(long)]
        max_books: Option<usize>,

        /// EPUB variant(s) to build.
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Ignore the on-disk existence check and re-download everything.
        #[arg(long)]
        force: bool,
    },

    /// Print the current progress file as a human summary.
    Status,
}

impl Cli {
    /// Applies command-line overrides on top of a loaded configuration.
    #[must_use]
    pub fn apply_overrides(&self, mut config: JobConfig) -> JobConfig {
        match &self.command {
            Command::Discover {
                skills_file,
                api,
                max_pages,
                ..
            } => {
                if let Some(skills_file) = skills_file {
                    config.skills_file.clone_from(skills_file);
                }
                if let Some(api) = api {
                    config.discovery_api_version = (*api).into();
                }
                if let Some(max_pages) = max_pages {
                    config.max_pages_per_skill = *max_pages;
                }
            }
            Command::Download {
                max_books,
                format,
                force,
                ..
            } => {
                if let Some(max_books) = max_books {
                    config.max_books_per_skill = Some(*max_books);
                }
                if let Some(format) = format {
                    config.epub_format = (*format).into();
                }
                if *force {
                    config.force_redownload = true;
                }
            }
            Command::Status => {}
        }
        config
    }
}
