use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::extract::render::render_text;
use crate::hosts::{HostProfile, HostProfiles, ListingProfile};
use crate::model::{CatalogueListing, DEFAULT_GROUP, ListedChapter, NovelDetails, NovelSummary};

/// Everything the reader needs from a remote site.
#[async_trait]
pub trait NovelProvider: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<NovelSummary>>;

    async fn fetch_catalogue(&self, novel_url: &str) -> anyhow::Result<CatalogueListing>;

    /// Raw markup of one chapter page.
    async fn load_chapter(&self, chapter_url: &str) -> anyhow::Result<String>;

    async fn load_details(&self, novel_url: &str) -> anyhow::Result<NovelDetails>;
}

#[derive(Debug, Clone)]
pub struct HttpNovelProvider {
    client: reqwest::Client,
    user_agent: String,
    profiles: Arc<HostProfiles>,
}

impl HttpNovelProvider {
    pub fn new(
        profiles: Arc<HostProfiles>,
        timeout: Duration,
        user_agent: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            user_agent: user_agent.into(),
            profiles,
        })
    }

    async fn get_html(&self, url: &Url) -> anyhow::Result<String> {
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, self.user_agent.as_str())
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} failed ({status})");
        }
        response
            .text()
            .await
            .with_context(|| format!("read body: {url}"))
    }

    fn profile_for(&self, url: &Url) -> anyhow::Result<&HostProfile> {
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("url must have host: {url}"))?;
        self.profiles
            .profile(host)
            .ok_or_else(|| anyhow::anyhow!("no host profile for {host}"))
    }
}

#[async_trait]
impl NovelProvider for HttpNovelProvider {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<NovelSummary>> {
        let encoded = url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>();
        let mut results = Vec::new();
        for profile in &self.profiles.hosts {
            let Some(search) = &profile.search else {
                continue;
            };
            let search_url = search.url_template.replace("{query}", &encoded);
            let search_url = match Url::parse(&search_url) {
                Ok(url) => url,
                Err(err) => {
                    tracing::warn!(host = %profile.host, %err, "invalid search url template");
                    continue;
                }
            };
            match self.get_html(&search_url).await {
                Ok(html) => results.extend(
                    parse_search_results(&html, &search_url, &search.result_selector)
                        .with_context(|| format!("parse search results: {search_url}"))?,
                ),
                Err(err) => tracing::warn!(host = %profile.host, ?err, "search failed; skipping host"),
            }
        }
        Ok(results)
    }

    async fn fetch_catalogue(&self, novel_url: &str) -> anyhow::Result<CatalogueListing> {
        let url = Url::parse(novel_url).context("parse novel url")?;
        let listing = self
            .profile_for(&url)?
            .listing
            .clone()
            .ok_or_else(|| anyhow::anyhow!("host has no listing profile: {url}"))?;
        let html = self.get_html(&url).await?;
        parse_listing(&html, &url, &listing)
    }

    async fn load_chapter(&self, chapter_url: &str) -> anyhow::Result<String> {
        let url = Url::parse(chapter_url).context("parse chapter url")?;
        self.get_html(&url).await
    }

    async fn load_details(&self, novel_url: &str) -> anyhow::Result<NovelDetails> {
        let url = Url::parse(novel_url).context("parse novel url")?;
        let listing = self.profile_for(&url).ok().and_then(|p| p.listing.clone());
        let html = self.get_html(&url).await?;
        parse_details(&html, &url, listing.as_ref())
    }
}

pub fn parse_listing(
    html: &str,
    base: &Url,
    profile: &ListingProfile,
) -> anyhow::Result<CatalogueListing> {
    let document = Html::parse_document(html);
    let selector = parse_selector(&profile.chapter_selector)?;

    let mut seen = HashSet::new();
    let mut chapters = Vec::new();
    for anchor in document.select(&selector) {
        let Some(url) = resolve_href(base, anchor) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        let name = render_text(anchor);
        let group = profile
            .group_attribute
            .as_deref()
            .and_then(|attr| anchor.value().attr(attr))
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .unwrap_or(DEFAULT_GROUP);
        chapters.push(ListedChapter {
            name: if name.is_empty() { url.clone() } else { name },
            url,
            group: group.to_owned(),
        });
    }
    if profile.newest_first {
        chapters.reverse();
    }

    let title = match &profile.title_selector {
        Some(selector) => select_text(&document, selector)?,
        None => page_title(&document),
    };
    Ok(CatalogueListing { title, chapters })
}

pub fn parse_details(
    html: &str,
    url: &Url,
    profile: Option<&ListingProfile>,
) -> anyhow::Result<NovelDetails> {
    let document = Html::parse_document(html);
    let title = match profile.and_then(|p| p.title_selector.as_deref()) {
        Some(selector) => select_text(&document, selector)?,
        None => page_title(&document),
    };
    let description = match profile.and_then(|p| p.description_selector.as_deref()) {
        Some(selector) => select_text(&document, selector)?,
        None => None,
    };
    Ok(NovelDetails {
        url: url.to_string(),
        title,
        description,
    })
}

fn parse_search_results(
    html: &str,
    base: &Url,
    result_selector: &str,
) -> anyhow::Result<Vec<NovelSummary>> {
    let document = Html::parse_document(html);
    let selector = parse_selector(result_selector)?;
    Ok(document
        .select(&selector)
        .filter_map(|anchor| {
            let url = resolve_href(base, anchor)?;
            let title = render_text(anchor);
            Some(NovelSummary {
                title: if title.is_empty() { url.clone() } else { title },
                url,
            })
        })
        .collect())
}

fn parse_selector(selector: &str) -> anyhow::Result<Selector> {
    Selector::parse(selector).map_err(|err| anyhow::anyhow!("invalid selector {selector:?}: {err}"))
}

fn resolve_href(base: &Url, anchor: ElementRef<'_>) -> Option<String> {
    let href = anchor.value().attr("href")?.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn select_text(document: &Html, selector: &str) -> anyhow::Result<Option<String>> {
    let selector = parse_selector(selector)?;
    Ok(document
        .select(&selector)
        .next()
        .map(render_text)
        .filter(|text| !text.is_empty()))
}

fn page_title(document: &Html) -> Option<String> {
    ["h1", "title"].into_iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        document
            .select(&selector)
            .map(render_text)
            .find(|text| !text.is_empty())
    })
}
