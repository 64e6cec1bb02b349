use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Storable;

pub const DEFAULT_GROUP: &str = "default";

/// Structured content produced by the extraction engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

impl ChapterContent {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.text.is_none() && self.html.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub catalogue_url: String,
    pub url: String,
    pub id: u64,
    pub name: String,
    pub group: String,

    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_markup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChapterContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Chapter {
    pub fn new(
        catalogue_url: impl Into<String>,
        url: impl Into<String>,
        id: u64,
        name: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            catalogue_url: catalogue_url.into(),
            url: url.into(),
            id,
            name: name.into(),
            group: group.into(),
            downloaded: false,
            read: false,
            last_read_at: None,
            raw_markup: None,
            content: None,
            size: None,
        }
    }

    /// Moves the chapter into the downloaded state and computes its byte size.
    ///
    /// The size is the length of the serialized record, measured before the
    /// size field itself is set.
    pub fn set_downloaded(
        &mut self,
        raw_markup: String,
        content: ChapterContent,
    ) -> Result<(), serde_json::Error> {
        self.raw_markup = Some(raw_markup);
        self.content = Some(content);
        self.size = None;
        let size = serde_json::to_vec(self)?.len() as u64;
        self.size = Some(size);
        self.downloaded = true;
        Ok(())
    }

    /// Clears downloaded data. Identity, ordering and read state survive.
    pub fn clear_download(&mut self) {
        self.downloaded = false;
        self.raw_markup = None;
        self.content = None;
        self.size = None;
    }

    pub fn mark_read(&mut self, at: DateTime<Utc>) {
        self.read = true;
        self.last_read_at = Some(at);
    }

    pub fn mark_unread(&mut self) {
        self.read = false;
        self.last_read_at = None;
    }

    pub fn is_consistent(&self) -> bool {
        let has_payload =
            self.raw_markup.is_some() && self.content.is_some() && self.size.is_some();
        self.downloaded == has_payload
    }

    /// Copy kept inside the owning catalogue, without the heavy payload.
    pub fn summary(&self) -> Chapter {
        Chapter {
            raw_markup: None,
            content: None,
            ..self.clone()
        }
    }
}

impl Storable for Chapter {
    const KIND: &'static str = "chapter";

    fn key(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub enabled: bool,
    pub chapter_urls: Vec<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            chapter_urls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterFilter {
    #[default]
    All,
    Downloaded,
    EnabledGroups,
}

impl ChapterFilter {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "downloaded" => Ok(Self::Downloaded),
            "enabled" | "enabled_groups" => Ok(Self::EnabledGroups),
            other => anyhow::bail!("unsupported chapter filter: {other}"),
        }
    }
}

/// Per-novel record. Group membership and enablement can only change through
/// methods that recompute `enabled_chapter_urls` in the same call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalogue {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    groups: BTreeMap<String, Group>,
    chapter_order: HashMap<String, u64>,
    chapters: HashMap<String, Chapter>,
    #[serde(default)]
    enabled_chapter_urls: Vec<String>,

    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_chapter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Catalogue {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            groups: BTreeMap::new(),
            chapter_order: HashMap::new(),
            chapters: HashMap::new(),
            enabled_chapter_urls: Vec::new(),
            last_modified: Utc::now(),
            last_read_chapter: None,
            last_read_at: None,
        }
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn enabled_chapter_urls(&self) -> &[String] {
        &self.enabled_chapter_urls
    }

    pub fn chapter(&self, url: &str) -> Option<&Chapter> {
        self.chapters.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.chapter_order.contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.chapter_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapter_order.is_empty()
    }

    pub fn next_sequence_id(&self) -> u64 {
        self.chapter_order
            .values()
            .max()
            .map_or(1, |max| max.saturating_add(1))
    }

    /// All chapter URLs ordered by sequence id.
    pub fn ordered_chapter_urls(&self) -> Vec<String> {
        let mut urls = self.chapter_order.keys().cloned().collect::<Vec<_>>();
        self.sort_by_order(&mut urls);
        urls
    }

    /// Inserts or replaces the denormalized copy of `chapter`, moving it to
    /// its group if the group changed.
    pub fn upsert_chapter(&mut self, chapter: &Chapter) {
        let previous_group = self
            .chapters
            .get(&chapter.url)
            .map(|c| c.group.clone())
            .filter(|group| group != &chapter.group);
        if let Some(previous_group) = previous_group {
            let now_empty = match self.groups.get_mut(&previous_group) {
                Some(group) => {
                    group.chapter_urls.retain(|url| url != &chapter.url);
                    group.chapter_urls.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.groups.remove(&previous_group);
            }
        }

        let group = self
            .groups
            .entry(chapter.group.clone())
            .or_insert_with(|| Group::new(chapter.group.clone()));
        if !group.chapter_urls.contains(&chapter.url) {
            group.chapter_urls.push(chapter.url.clone());
        }

        self.chapter_order.insert(chapter.url.clone(), chapter.id);
        self.chapters.insert(chapter.url.clone(), chapter.summary());
        self.refresh_enabled();
    }

    /// Replaces the denormalized copy of a chapter the catalogue already knows.
    pub fn replace_chapter(&mut self, chapter: &Chapter) -> bool {
        if !self.contains(&chapter.url) {
            return false;
        }
        self.upsert_chapter(chapter);
        true
    }

    pub fn set_group_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let Some(group) = self.groups.get_mut(name) else {
            return false;
        };
        group.enabled = enabled;
        self.refresh_enabled();
        true
    }

    pub fn chapters_matching(&self, filter: ChapterFilter) -> Vec<&Chapter> {
        let urls = match filter {
            ChapterFilter::EnabledGroups => self.enabled_chapter_urls.clone(),
            ChapterFilter::All | ChapterFilter::Downloaded => self.ordered_chapter_urls(),
        };
        urls.iter()
            .filter_map(|url| self.chapters.get(url))
            .filter(|chapter| filter != ChapterFilter::Downloaded || chapter.downloaded)
            .collect()
    }

    /// The chapter with the most recent read timestamp, if any.
    pub fn most_recently_read(&self) -> Option<&Chapter> {
        self.chapters
            .values()
            .filter(|chapter| chapter.read)
            .filter_map(|chapter| chapter.last_read_at.map(|at| (at, chapter)))
            .max_by(|(a_at, a), (b_at, b)| a_at.cmp(b_at).then_with(|| a.id.cmp(&b.id)))
            .map(|(_, chapter)| chapter)
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }

    fn refresh_enabled(&mut self) {
        let mut urls = self
            .groups
            .values()
            .filter(|group| group.enabled)
            .flat_map(|group| group.chapter_urls.iter().cloned())
            .collect::<Vec<_>>();
        self.sort_by_order(&mut urls);
        urls.dedup();
        self.enabled_chapter_urls = urls;
    }

    fn sort_by_order(&self, urls: &mut [String]) {
        urls.sort_by(|a, b| {
            let a_id = self.chapter_order.get(a).copied().unwrap_or(u64::MAX);
            let b_id = self.chapter_order.get(b).copied().unwrap_or(u64::MAX);
            a_id.cmp(&b_id).then_with(|| a.cmp(b))
        });
    }
}

impl Storable for Catalogue {
    const KIND: &'static str = "catalogue";

    fn key(&self) -> &str {
        &self.url
    }

    fn after_decode(&mut self) {
        self.refresh_enabled();
    }
}

/// A chapter as observed on a remote catalogue page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedChapter {
    pub url: String,
    pub name: String,
    pub group: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueListing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub chapters: Vec<ListedChapter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelSummary {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelDetails {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOVEL: &str = "https://novels.example/n/1";

    fn chapter(id: u64, group: &str) -> Chapter {
        Chapter::new(
            NOVEL,
            format!("{NOVEL}/c/{id}"),
            id,
            format!("Chapter {id}"),
            group,
        )
    }

    fn catalogue_with(chapters: &[Chapter]) -> Catalogue {
        let mut catalogue = Catalogue::new(NOVEL);
        for chapter in chapters {
            catalogue.upsert_chapter(chapter);
        }
        catalogue
    }

    #[test]
    fn enabled_urls_follow_group_toggles() {
        let mut catalogue = catalogue_with(&[
            chapter(3, "beta"),
            chapter(1, "alpha"),
            chapter(2, "beta"),
            chapter(4, "alpha"),
        ]);
        let ids = |c: &Catalogue| {
            c.enabled_chapter_urls()
                .iter()
                .map(|url| c.chapter(url).map(|ch| ch.id).unwrap_or_default())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&catalogue), vec![1, 2, 3, 4]);

        assert!(catalogue.set_group_enabled("beta", false));
        assert_eq!(ids(&catalogue), vec![1, 4]);

        assert!(catalogue.set_group_enabled("beta", true));
        assert!(catalogue.set_group_enabled("alpha", false));
        assert_eq!(ids(&catalogue), vec![2, 3]);

        assert!(!catalogue.set_group_enabled("missing", false));
    }

    #[test]
    fn moving_chapter_between_groups_keeps_single_membership() {
        let mut catalogue = catalogue_with(&[chapter(1, "alpha"), chapter(2, "alpha")]);
        let mut moved = chapter(2, "beta");
        moved.read = true;
        catalogue.upsert_chapter(&moved);

        let alpha = catalogue.group("alpha").expect("alpha group");
        let beta = catalogue.group("beta").expect("beta group");
        assert_eq!(alpha.chapter_urls, vec![format!("{NOVEL}/c/1")]);
        assert_eq!(beta.chapter_urls, vec![format!("{NOVEL}/c/2")]);
        assert_eq!(catalogue.enabled_chapter_urls().len(), 2);
    }

    #[test]
    fn decode_recomputes_stale_enabled_list() -> anyhow::Result<()> {
        let catalogue = catalogue_with(&[chapter(1, "alpha"), chapter(2, "beta")]);
        let mut json = serde_json::to_value(&catalogue)?;
        json["enabled_chapter_urls"] = serde_json::json!([]);

        let mut decoded: Catalogue = serde_json::from_value(json)?;
        decoded.after_decode();
        assert_eq!(decoded.enabled_chapter_urls().len(), 2);
        assert_eq!(decoded, catalogue);
        Ok(())
    }

    #[test]
    fn downloaded_chapter_is_consistent_and_sized() -> anyhow::Result<()> {
        let mut ch = chapter(1, "alpha");
        assert!(ch.is_consistent());

        ch.set_downloaded(
            "<p>hi</p>".to_owned(),
            ChapterContent {
                title: Some("One".to_owned()),
                text: Some("hi".to_owned()),
                html: None,
            },
        )?;
        assert!(ch.downloaded);
        assert!(ch.is_consistent());
        assert!(ch.size.unwrap_or_default() > 0);

        ch.clear_download();
        assert!(!ch.downloaded);
        assert!(ch.is_consistent());
        assert_eq!(ch.id, 1);
        Ok(())
    }

    #[test]
    fn summary_drops_payload_but_keeps_state() -> anyhow::Result<()> {
        let mut ch = chapter(7, "alpha");
        ch.set_downloaded("<p>x</p>".to_owned(), ChapterContent::default())?;
        let summary = ch.summary();
        assert!(summary.raw_markup.is_none());
        assert!(summary.content.is_none());
        assert!(summary.downloaded);
        assert_eq!(summary.size, ch.size);
        Ok(())
    }

    #[test]
    fn downloaded_filter_skips_missing_chapters() {
        let mut downloaded = chapter(2, "alpha");
        downloaded.downloaded = true;
        let catalogue = catalogue_with(&[chapter(1, "alpha"), downloaded]);
        let got = catalogue
            .chapters_matching(ChapterFilter::Downloaded)
            .into_iter()
            .map(|c| c.id)
            .collect::<Vec<_>>();
        assert_eq!(got, vec![2]);
    }

    #[test]
    fn parse_filter_variants() {
        assert_eq!(ChapterFilter::parse("").unwrap(), ChapterFilter::All);
        assert_eq!(
            ChapterFilter::parse("Downloaded").unwrap(),
            ChapterFilter::Downloaded
        );
        assert_eq!(
            ChapterFilter::parse("enabled").unwrap(),
            ChapterFilter::EnabledGroups
        );
        assert!(ChapterFilter::parse("unread").is_err());
    }
}
