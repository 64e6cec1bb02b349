use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// YAML config file.
    #[arg(long, global = true, env = "NOVELSHELF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the content store.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Maximum concurrent chapter downloads per novel.
    #[arg(long, global = true)]
    pub pool_size: Option<usize>,

    /// Host profile file (extraction rules, listing and search selectors).
    #[arg(long, global = true)]
    pub hosts: Option<PathBuf>,

    /// Debug logs for this crate unless RUST_LOG is set.
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

impl GlobalArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            data_dir: self.data_dir.clone(),
            pool_size: self.pool_size,
            hosts_file: self.hosts.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search every host with a search profile.
    Search(SearchArgs),
    /// Fetch a novel's chapter listing and merge it into the library.
    Add(NovelArgs),
    /// List stored novels.
    List,
    /// List chapters of a stored novel.
    Chapters(ChaptersArgs),
    /// Download missing chapters of enabled groups.
    Download(DownloadArgs),
    Read(ChapterArgs),
    Unread(ChapterArgs),
    /// Drop a chapter's downloaded content, keeping its place in the catalogue.
    Delete(ChapterArgs),
    /// Enable or disable a translation group.
    Group(GroupArgs),
    /// Print a downloaded chapter.
    Show(ShowArgs),
    /// Run extraction on a local markup file.
    Extract(ExtractArgs),
    /// Re-run extraction over stored markup of a novel.
    Reextract(NovelArgs),
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long)]
    pub query: String,
}

#[derive(Debug, Args)]
pub struct NovelArgs {
    /// Novel (catalogue) URL.
    #[arg(long)]
    pub url: String,
}

#[derive(Debug, Args)]
pub struct ChapterArgs {
    /// Chapter URL.
    #[arg(long)]
    pub url: String,
}

#[derive(Debug, Args)]
pub struct ChaptersArgs {
    /// Novel (catalogue) URL.
    #[arg(long)]
    pub url: String,

    /// One of: all, downloaded, enabled.
    #[arg(long, default_value = "all")]
    pub filter: String,
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Novel (catalogue) URL.
    #[arg(long)]
    pub url: String,

    /// Refresh the chapter listing before downloading.
    #[arg(long, default_value_t = false)]
    pub refresh: bool,
}

#[derive(Debug, Args)]
pub struct GroupArgs {
    /// Novel (catalogue) URL.
    #[arg(long)]
    pub url: String,

    #[arg(long)]
    pub name: String,

    #[arg(long, conflicts_with = "enable")]
    pub disable: bool,

    #[arg(long)]
    pub enable: bool,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Chapter URL.
    #[arg(long)]
    pub url: String,

    /// Print the sanitized HTML as Markdown instead of plain text.
    #[arg(long, default_value_t = false)]
    pub markdown: bool,

    /// Mark the chapter as read after printing.
    #[arg(long, default_value_t = false)]
    pub mark_read: bool,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Markup file to extract from.
    #[arg(long)]
    pub file: PathBuf,

    /// URL the markup was fetched from; selects the host rule set.
    #[arg(long)]
    pub url: String,
}
