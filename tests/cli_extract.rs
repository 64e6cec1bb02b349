use std::fs;

use predicates::prelude::*;

const MARKUP: &str = r#"<html><body>
<h1 id="title">Chapter 7: Rain</h1>
<div class="content"><p>It rained &amp; rained.</p></div>
</body></html>"#;

const HOSTS_YAML: &str = r#"
hosts:
  - host: novels.example
    chapter:
      title: [{ id: title }, { render: text }]
      text: [{ class: { name: content } }, { render: text }]
      html: [{ id: missing }, { render: html }]
"#;

#[test]
fn extract_uses_host_rules_and_reports_failed_fields() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let markup = temp.path().join("chapter.html");
    let hosts = temp.path().join("hosts.yaml");
    fs::write(&markup, MARKUP)?;
    fs::write(&hosts, HOSTS_YAML)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
    cmd.arg("--data-dir")
        .arg(temp.path().join("data"))
        .arg("--hosts")
        .arg(&hosts)
        .args(["extract", "--url", "https://www.novels.example/c/7", "--file"])
        .arg(&markup)
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""source": "rules""#)
                .and(predicate::str::contains(r#""title": "Chapter 7: Rain""#))
                .and(predicate::str::contains("It rained & rained."))
                .and(predicate::str::contains("missing")),
        );
    Ok(())
}

#[test]
fn extract_without_rules_uses_fallback() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let markup = temp.path().join("chapter.html");
    fs::write(&markup, MARKUP)?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
    cmd.arg("--data-dir")
        .arg(temp.path().join("data"))
        .args(["extract", "--url", "https://unknown.example/c/7", "--file"])
        .arg(&markup)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""source": "fallback""#));
    Ok(())
}

#[test]
fn missing_markup_file_fails_with_context() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
    cmd.args([
        "extract",
        "--url",
        "https://novels.example/c/1",
        "--file",
        "/nonexistent/novelshelf/chapter.html",
    ])
    .env("NOVELSHELF_DATA_DIR", std::env::temp_dir().join("novelshelf-cli-test"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("read markup"));
}

#[test]
fn invalid_pool_size_env_is_reported() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
    cmd.env("NOVELSHELF_POOL_SIZE", "lots")
        .args(["list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NOVELSHELF_POOL_SIZE"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("novelshelf");
    cmd.env("RUST_LOG", "debug")
        .arg("--data-dir")
        .arg(temp.path())
        .args(["list"])
        .assert()
        .success()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
