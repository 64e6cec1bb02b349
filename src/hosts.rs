use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::extract::{Field, RuleBook, RuleSet, Step};

/// Per-host scraping knowledge, loaded from a YAML file:
///
/// ```yaml
/// hosts:
///   - host: novels.example
///     chapter:
///       title: [{ id: chapter-title }, { render: text }]
///       text: [{ class: { name: chapter-body } }, { render: text }]
///     listing:
///       chapter_selector: "ul.chapters a"
///       group_attribute: data-group
///     search:
///       url_template: "https://novels.example/search?q={query}"
///       result_selector: ".result a"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostProfiles {
    #[serde(default)]
    pub hosts: Vec<HostProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub host: String,
    #[serde(default)]
    pub chapter: BTreeMap<Field, Vec<Step>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingProfile {
    /// Anchors pointing at chapters, in release order.
    pub chapter_selector: String,
    /// Attribute on the anchor naming the translation group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_selector: Option<String>,
    /// Listing shows newest chapters first.
    #[serde(default)]
    pub newest_first: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProfile {
    /// `{query}` is replaced by the form-encoded query.
    pub url_template: String,
    pub result_selector: String,
}

impl HostProfiles {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("read host profiles: {}", path.display()))?;
        Self::parse(&yaml).with_context(|| format!("parse host profiles: {}", path.display()))
    }

    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let profiles: Self = serde_yaml::from_str(yaml).context("deserialize host profiles")?;
        Ok(profiles)
    }

    pub fn profile(&self, host: &str) -> Option<&HostProfile> {
        let host = host.trim_start_matches("www.");
        self.hosts
            .iter()
            .find(|profile| profile.host.trim_start_matches("www.").eq_ignore_ascii_case(host))
    }

    pub fn rule_book(&self) -> RuleBook {
        RuleBook::new(
            self.hosts
                .iter()
                .filter(|profile| !profile.chapter.is_empty())
                .map(|profile| RuleSet {
                    host: profile.host.clone(),
                    fields: profile.chapter.clone(),
                }),
        )
    }
}
