use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use novelshelf::download::{DownloadEvent, DownloadRequest, Downloader};
use novelshelf::extract::ExtractionEngine;
use novelshelf::hosts::HostProfiles;
use novelshelf::library::Library;
use novelshelf::model::ChapterFilter;
use novelshelf::provider::{HttpNovelProvider, NovelProvider};
use novelshelf::store::{ContentStore, LocalFsProvider};
use predicates::prelude::*;

const HOSTS_YAML: &str = r#"
hosts:
  - host: "127.0.0.1"
    chapter:
      title:
        - id: chapter-title
        - render: text
      text:
        - class: { name: chapter-body }
        - render: text
      html:
        - class: { name: chapter-body }
        - render: html
    listing:
      chapter_selector: "ul.toc a"
      group_attribute: data-group
      title_selector: "h1.novel"
"#;

fn chapter_page(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
  <head><title>{title} | Shelf Test</title><script>track()</script></head>
  <body>
    <nav>Home / Novel</nav>
    <h2 id="chapter-title">{title}</h2>
    <div class="chapter-body">{body}</div>
    <footer>comments</footer>
  </body>
</html>
"#
    )
}

fn spawn_novel_server() -> (String, mpsc::Sender<()>, thread::JoinHandle<()>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
    let addr = server.server_addr();
    let base_url = format!("http://{addr}");

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };

            let url = request.url().to_string();
            let path = url.split('?').next().unwrap_or(&url);

            let (status, body) = match path {
                "/novel" => (
                    200,
                    r#"<!doctype html>
<html>
  <head><title>Listing</title></head>
  <body>
    <h1 class="novel">The Long Road</h1>
    <ul class="toc">
      <li><a href="/novel/c/1" data-group="Sun TL">Chapter One</a></li>
      <li><a href="/novel/c/2" data-group="Moon TL">Chapter Two</a></li>
      <li><a href="/novel/c/3" data-group="Sun TL">Chapter Three</a></li>
    </ul>
  </body>
</html>
"#
                    .to_owned(),
                ),
                "/novel/c/1" => (
                    200,
                    chapter_page(
                        "Chapter One",
                        "<p>First paragraph.</p><p>Second &amp; last.</p>",
                    ),
                ),
                "/novel/c/2" => (200, chapter_page("Chapter Two", "<p>Moon text.</p>")),
                "/novel/c/3" => (
                    200,
                    chapter_page("Chapter Three", "<p>Third <a href=\"javascript:x()\">link</a>.</p>"),
                ),
                _ => (404, "not found".to_owned()),
            };

            let header = tiny_http::Header::from_bytes(
                &b"Content-Type"[..],
                &b"text/html; charset=utf-8"[..],
            )
            .expect("build header");
            let response = tiny_http::Response::from_string(body)
                .with_status_code(status)
                .with_header(header);
            let _ = request.respond(response);
        }
    });

    (base_url, shutdown_tx, handle)
}

fn write_hosts(dir: &Path) -> anyhow::Result<std::path::PathBuf> {
    let path = dir.join("hosts.yaml");
    fs::write(&path, HOSTS_YAML)?;
    Ok(path)
}

#[test]
fn cli_adds_downloads_and_reads_a_novel() -> anyhow::Result<()> {
    let (base_url, shutdown_tx, handle) = spawn_novel_server();
    let temp = tempfile::tempdir()?;
    let hosts = write_hosts(temp.path())?;
    let data_dir = temp.path().join("data");
    let novel_url = format!("{base_url}/novel");

    let shelf = |args: &[&str]| {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
        cmd.arg("--data-dir")
            .arg(&data_dir)
            .arg("--hosts")
            .arg(&hosts)
            .args(args);
        cmd
    };

    shelf(&["add", "--url", novel_url.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "The Long Road: 3 chapters in 2 groups",
        ));

    shelf(&["group", "--url", novel_url.as_str(), "--name", "Moon TL", "--disable"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 chapters enabled"));

    shelf(&["download", "--url", novel_url.as_str(), "--pool-size", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 downloaded, 0 failed"));

    shelf(&["chapters", "--url", novel_url.as_str(), "--filter", "downloaded"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Chapter One")
                .and(predicate::str::contains("Chapter Three"))
                .and(predicate::str::contains("Chapter Two").not()),
        );

    let chapter_one = format!("{novel_url}/c/1");
    shelf(&["show", "--url", chapter_one.as_str(), "--mark-read"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("# Chapter One")
                .and(predicate::str::contains("First paragraph."))
                .and(predicate::str::contains("Second & last."))
                .and(predicate::str::contains("comments").not()),
        );

    shelf(&["chapters", "--url", novel_url.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("DR [Sun TL] Chapter One"));

    let chapter_two = format!("{novel_url}/c/2");
    shelf(&["show", "--url", chapter_two.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not downloaded"));

    let _ = shutdown_tx.send(());
    let _ = handle.join();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn downloads_survive_reopening_the_store() -> anyhow::Result<()> {
    let (base_url, shutdown_tx, handle) = spawn_novel_server();
    let temp = tempfile::tempdir()?;
    let novel_url = format!("{base_url}/novel");

    let profiles = Arc::new(HostProfiles::parse(HOSTS_YAML)?);
    let provider = Arc::new(HttpNovelProvider::new(
        Arc::clone(&profiles),
        Duration::from_secs(10),
        "novelshelf-test",
    )?);
    let open_library = || {
        let store = ContentStore::new(Arc::new(LocalFsProvider::new(temp.path().join("store"))));
        Arc::new(Library::new(Arc::new(store)))
    };

    let library = open_library();
    let listing = provider.fetch_catalogue(&novel_url).await?;
    library.merge_listing(&novel_url, &listing).await?;

    let engine = Arc::new(ExtractionEngine::with_readability(profiles.rule_book()));
    let downloader = Downloader::new(Arc::clone(&library), Arc::clone(&engine), 10);
    let mut events = downloader.subscribe();
    let request = DownloadRequest::missing(&library, &novel_url).await?;
    assert_eq!(downloader.download(request, provider.clone()).await?, 3);

    let failed = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(DownloadEvent::TaskCompleted { failed, .. }) = events.recv().await {
                return failed;
            }
        }
    })
    .await?;
    assert!(failed.is_empty(), "{failed:?}");

    let reopened = open_library();
    let chapters = reopened
        .load_chapters(&novel_url, ChapterFilter::Downloaded)
        .await?;
    assert_eq!(chapters.len(), 3);
    assert!(chapters.iter().all(|chapter| chapter.is_consistent()));

    let third = &chapters[2];
    let content = third.content.as_ref().expect("content");
    assert_eq!(content.title.as_deref(), Some("Chapter Three"));
    let html = content.html.as_deref().expect("html");
    assert!(!html.contains("javascript:"), "{html}");
    assert!(third.raw_markup.as_deref().is_some_and(|raw| raw.contains("<footer>")));

    let catalogue = reopened.catalogue(&novel_url).await?.expect("catalogue");
    assert_eq!(catalogue.title.as_deref(), Some("The Long Road"));
    assert!(
        catalogue
            .chapters_matching(ChapterFilter::All)
            .iter()
            .all(|summary| summary.downloaded && summary.raw_markup.is_none())
    );

    let _ = shutdown_tx.send(());
    let _ = handle.join();
    Ok(())
}
