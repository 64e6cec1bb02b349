use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cli::{
    ChapterArgs, ChaptersArgs, Command, DownloadArgs, ExtractArgs, GroupArgs, NovelArgs,
    SearchArgs, ShowArgs,
};
use crate::config::Config;
use crate::download::{DownloadEvent, DownloadRequest, Downloader, TaskProgress};
use crate::extract::{ExtractionEngine, ExtractionSource};
use crate::hosts::HostProfiles;
use crate::library::Library;
use crate::model::{Chapter, ChapterFilter};
use crate::provider::{HttpNovelProvider, NovelProvider};
use crate::store::{ContentStore, LocalFsProvider};

/// Long-lived handles shared by every command.
pub struct Shelf {
    pub config: Config,
    pub library: Arc<Library>,
    pub engine: Arc<ExtractionEngine>,
    pub profiles: Arc<HostProfiles>,
}

impl Shelf {
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let profiles = match &config.hosts_file {
            Some(path) => HostProfiles::load(path)?,
            None => HostProfiles::default(),
        };
        let store_dir = config.store_dir();
        tracing::debug!(store = %store_dir.display(), hosts = profiles.hosts.len(), "opening shelf");

        let store = ContentStore::new(Arc::new(LocalFsProvider::new(store_dir)));
        Ok(Self {
            library: Arc::new(Library::new(Arc::new(store))),
            engine: Arc::new(ExtractionEngine::with_readability(profiles.rule_book())),
            profiles: Arc::new(profiles),
            config,
        })
    }

    pub fn provider(&self) -> anyhow::Result<Arc<dyn NovelProvider>> {
        let provider = HttpNovelProvider::new(
            Arc::clone(&self.profiles),
            self.config.request_timeout(),
            self.config.user_agent.as_str(),
        )?;
        Ok(Arc::new(provider))
    }
}

pub async fn run(shelf: &Shelf, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Search(args) => search(shelf, args).await.context("search"),
        Command::Add(args) => add(shelf, args).await.context("add"),
        Command::List => list(shelf).await.context("list"),
        Command::Chapters(args) => chapters(shelf, args).await.context("chapters"),
        Command::Download(args) => download(shelf, args).await.context("download"),
        Command::Read(ChapterArgs { url }) => {
            let chapter = shelf.library.mark_as_read(&url).await.context("read")?;
            println!("read: {}", chapter.name);
            Ok(())
        }
        Command::Unread(ChapterArgs { url }) => {
            let chapter = shelf.library.mark_as_unread(&url).await.context("unread")?;
            println!("unread: {}", chapter.name);
            Ok(())
        }
        Command::Delete(ChapterArgs { url }) => {
            let chapter = shelf.library.delete_chapter(&url).await.context("delete")?;
            println!("deleted content of: {}", chapter.name);
            Ok(())
        }
        Command::Group(args) => group(shelf, args).await.context("group"),
        Command::Show(args) => show(shelf, args).await.context("show"),
        Command::Extract(args) => extract(shelf, args).await.context("extract"),
        Command::Reextract(NovelArgs { url }) => {
            let updated = shelf
                .library
                .reextract(&url, &shelf.engine)
                .await
                .context("reextract")?;
            println!("re-extracted {updated} chapters");
            Ok(())
        }
    }
}

async fn search(shelf: &Shelf, args: SearchArgs) -> anyhow::Result<()> {
    let results = shelf.provider()?.search(&args.query).await?;
    if results.is_empty() {
        println!("no results");
    }
    for novel in results {
        println!("{}\t{}", novel.title, novel.url);
    }
    Ok(())
}

async fn add(shelf: &Shelf, args: NovelArgs) -> anyhow::Result<()> {
    let provider = shelf.provider()?;
    let listing = provider
        .fetch_catalogue(&args.url)
        .await
        .with_context(|| format!("fetch catalogue: {}", args.url))?;
    let catalogue = shelf.library.merge_listing(&args.url, &listing).await?;
    println!(
        "{}: {} chapters in {} groups",
        catalogue.title.as_deref().unwrap_or(&catalogue.url),
        catalogue.len(),
        catalogue.groups().count()
    );
    Ok(())
}

async fn list(shelf: &Shelf) -> anyhow::Result<()> {
    for catalogue in shelf.library.catalogues().await? {
        let downloaded = catalogue.chapters_matching(ChapterFilter::Downloaded).len();
        println!(
            "{}\t{}\t{downloaded}/{} downloaded",
            catalogue.title.as_deref().unwrap_or("-"),
            catalogue.url,
            catalogue.len()
        );
    }
    Ok(())
}

async fn chapters(shelf: &Shelf, args: ChaptersArgs) -> anyhow::Result<()> {
    let filter = ChapterFilter::parse(&args.filter)?;
    let chapters = shelf.library.load_chapters(&args.url, filter).await?;
    for chapter in &chapters {
        println!("{}", chapter_line(chapter));
    }
    Ok(())
}

fn chapter_line(chapter: &Chapter) -> String {
    let mut flags = String::new();
    flags.push(if chapter.downloaded { 'D' } else { '-' });
    flags.push(if chapter.read { 'R' } else { '-' });
    format!(
        "{:>5} {flags} [{}] {}\t{}",
        chapter.id, chapter.group, chapter.name, chapter.url
    )
}

async fn download(shelf: &Shelf, args: DownloadArgs) -> anyhow::Result<()> {
    let provider = shelf.provider()?;
    if args.refresh || shelf.library.catalogue(&args.url).await?.is_none() {
        let listing = provider
            .fetch_catalogue(&args.url)
            .await
            .with_context(|| format!("fetch catalogue: {}", args.url))?;
        shelf.library.merge_listing(&args.url, &listing).await?;
    }

    let downloader = Downloader::new(
        Arc::clone(&shelf.library),
        Arc::clone(&shelf.engine),
        shelf.config.pool_size,
    );
    let mut events = downloader.subscribe();
    let request = DownloadRequest::missing(&shelf.library, &args.url).await?;
    let added = downloader.download(request, provider).await?;
    if added == 0 {
        println!("nothing to download");
        return Ok(());
    }
    println!("{added} chapters queued");

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DownloadEvent::TaskProgress(progress)) if progress.novel_url == args.url => {
                    println!("{}", progress_line(&progress));
                }
                Ok(DownloadEvent::TaskCompleted { novel_url, completed, failed, cancelled })
                    if novel_url == args.url =>
                {
                    println!("{completed} downloaded, {} failed{}", failed.len(), if cancelled { " (cancelled)" } else { "" });
                    for failure in &failed {
                        println!("  {}: {}", failure.url, failure.reason);
                    }
                    if !failed.is_empty() {
                        anyhow::bail!("{} chapters failed", failed.len());
                    }
                    return Ok(());
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => anyhow::bail!("download events closed"),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for ctrl-c")?;
                if interrupted {
                    tracing::warn!("aborting in-flight downloads");
                    downloader.shutdown();
                } else {
                    interrupted = true;
                    tracing::warn!("cancelling; in-flight chapters will finish (ctrl-c again to abort)");
                    downloader.cancel(&args.url).await;
                }
            }
        }
    }
}

fn progress_line(progress: &TaskProgress) -> String {
    let eta = progress
        .eta
        .map(format_eta)
        .unwrap_or_else(|| "unknown".to_owned());
    format!(
        "{} done, {} pending, {} failed, ETA {eta}",
        progress.completed, progress.pending, progress.failed
    )
}

fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

async fn group(shelf: &Shelf, args: GroupArgs) -> anyhow::Result<()> {
    if !args.enable && !args.disable {
        anyhow::bail!("pass --enable or --disable");
    }
    let catalogue = shelf
        .library
        .set_group_enabled(&args.url, &args.name, args.enable)
        .await?;
    println!(
        "group {} {}; {} chapters enabled",
        args.name,
        if args.enable { "enabled" } else { "disabled" },
        catalogue.enabled_chapter_urls().len()
    );
    Ok(())
}

async fn show(shelf: &Shelf, args: ShowArgs) -> anyhow::Result<()> {
    let chapter = shelf
        .library
        .chapter(&args.url)
        .await?
        .ok_or_else(|| anyhow::anyhow!("chapter not found: {}", args.url))?;
    if !chapter.downloaded {
        anyhow::bail!("chapter is not downloaded: {}", args.url);
    }
    let content = chapter.content.clone().unwrap_or_default();
    if content.is_empty() {
        tracing::warn!(chapter = %chapter.url, "nothing was extracted; try `reextract` after adding rules");
    }

    println!("# {}", content.title.as_deref().unwrap_or(&chapter.name));
    println!();
    let body = match (&content.html, &content.text) {
        (Some(html), _) if args.markdown => html2md::parse_html(html),
        (_, Some(text)) => text.clone(),
        (Some(html), None) => html2md::parse_html(html),
        (None, None) => String::new(),
    };
    println!("{}", body.trim_end());

    if args.mark_read {
        shelf.library.mark_as_read(&args.url).await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ExtractOutput {
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<String>,
    failures: Vec<String>,
}

async fn extract(shelf: &Shelf, args: ExtractArgs) -> anyhow::Result<()> {
    let markup = read_markup(&args.file).await?;
    let engine = Arc::clone(&shelf.engine);
    let url = args.url.clone();
    let extraction = tokio::task::spawn_blocking(move || engine.extract(&markup, &url))
        .await
        .context("join extraction")?;

    let output = ExtractOutput {
        source: match extraction.source {
            ExtractionSource::Rules => "rules",
            ExtractionSource::Fallback => "fallback",
        },
        title: extraction.content.title,
        text: extraction.content.text,
        html: extraction.content.html,
        failures: extraction
            .failures
            .iter()
            .map(|failure| format!("{:?}: {}", failure.field, failure.error))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&output).context("serialize extraction")?;
    println!("{json}");
    Ok(())
}

async fn read_markup(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read markup: {}", path.display()))
}
