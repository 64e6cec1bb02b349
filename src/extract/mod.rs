//! Turns raw chapter markup into structured content.
//!
//! Hosts with a rule set are extracted field by field; a failing chain only
//! leaves its own field unset. Hosts without one go through the generic
//! fallback extractor.

pub mod fallback;
pub mod render;
pub mod rules;

use std::sync::Arc;

use scraper::Html;
use url::Url;

use crate::model::ChapterContent;

pub use fallback::{FallbackExtractor, ReadabilityFallback};
pub use rules::{Field, Render, RuleBook, RuleSet, Step, StepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Rules,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub field: Field,
    pub error: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub content: ChapterContent,
    pub source: ExtractionSource,
    pub failures: Vec<FieldFailure>,
}

impl Extraction {
    /// Nothing at all could be extracted.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

pub struct ExtractionEngine {
    rules: RuleBook,
    fallback: Arc<dyn FallbackExtractor>,
}

impl ExtractionEngine {
    pub fn new(rules: RuleBook, fallback: Arc<dyn FallbackExtractor>) -> Self {
        Self { rules, fallback }
    }

    pub fn with_readability(rules: RuleBook) -> Self {
        Self::new(rules, Arc::new(ReadabilityFallback))
    }

    pub fn rules(&self) -> &RuleBook {
        &self.rules
    }

    pub fn extract(&self, markup: &str, source_url: &str) -> Extraction {
        let rule_set = host_of(source_url).and_then(|host| self.rules.lookup(&host));
        match rule_set {
            Some(rule_set) => extract_with_rules(rule_set, markup),
            None => {
                tracing::debug!(url = %source_url, "no rule set for host; using fallback extractor");
                Extraction {
                    content: self
                        .fallback
                        .extract(markup, source_url)
                        .unwrap_or_default(),
                    source: ExtractionSource::Fallback,
                    failures: Vec::new(),
                }
            }
        }
    }
}

pub fn extract_with_rules(rule_set: &RuleSet, markup: &str) -> Extraction {
    let document = Html::parse_document(markup);
    let root = document.root_element();

    let mut content = ChapterContent::default();
    let mut failures = Vec::new();
    for (field, steps) in &rule_set.fields {
        match rules::run_chain(root, steps) {
            Ok(value) => field.set(&mut content, value),
            Err(error) => {
                tracing::debug!(host = %rule_set.host, ?field, %error, "rule chain failed; field left unset");
                failures.push(FieldFailure {
                    field: *field,
                    error,
                });
            }
        }
    }

    Extraction {
        content,
        source: ExtractionSource::Rules,
        failures,
    }
}

pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://ruled.example/novel/c/5";

    struct NoArticle;

    impl FallbackExtractor for NoArticle {
        fn extract(&self, _markup: &str, _url: &str) -> Option<ChapterContent> {
            None
        }
    }

    struct FixedArticle;

    impl FallbackExtractor for FixedArticle {
        fn extract(&self, _markup: &str, _url: &str) -> Option<ChapterContent> {
            Some(ChapterContent {
                title: Some("Fallback".to_owned()),
                text: Some("generic body".to_owned()),
                html: None,
            })
        }
    }

    fn rule_book() -> RuleBook {
        RuleBook::new([RuleSet::new("ruled.example")
            .with_field(
                Field::Title,
                vec![Step::Id("title".to_owned()), Step::Render(Render::Text)],
            )
            .with_field(
                Field::Text,
                vec![
                    Step::Id("content".to_owned()),
                    Step::Tag {
                        name: "div".to_owned(),
                        index: 3,
                    },
                    Step::Render(Render::Text),
                ],
            )
            .with_field(
                Field::Html,
                vec![Step::Id("content".to_owned()), Step::Render(Render::Html)],
            )])
    }

    const MARKUP: &str = r#"<html><body>
<h2 id="title">Chapter &#53;</h2>
<div id="content"><div><p>Only block</p></div></div>
</body></html>"#;

    #[test]
    fn out_of_range_step_leaves_only_that_field_unset() {
        let engine = ExtractionEngine::new(rule_book(), Arc::new(NoArticle));
        let extraction = engine.extract(MARKUP, URL);

        assert_eq!(extraction.source, ExtractionSource::Rules);
        assert_eq!(extraction.content.title.as_deref(), Some("Chapter 5"));
        assert!(extraction.content.text.is_none());
        assert_eq!(
            extraction.content.html.as_deref(),
            Some("<div><p>Only block</p></div>")
        );
        assert_eq!(extraction.failures.len(), 1);
        assert_eq!(extraction.failures[0].field, Field::Text);
        assert!(matches!(
            extraction.failures[0].error,
            StepError::OutOfRange { index: 3, found: 1, .. }
        ));
    }

    #[test]
    fn unknown_host_uses_fallback() {
        let engine = ExtractionEngine::new(rule_book(), Arc::new(FixedArticle));
        let extraction = engine.extract(MARKUP, "https://other.example/c/1");
        assert_eq!(extraction.source, ExtractionSource::Fallback);
        assert_eq!(extraction.content.text.as_deref(), Some("generic body"));
    }

    #[test]
    fn fallback_without_article_yields_empty_content() {
        let engine = ExtractionEngine::new(RuleBook::default(), Arc::new(NoArticle));
        let extraction = engine.extract("<html><body></body></html>", URL);
        assert_eq!(extraction.source, ExtractionSource::Fallback);
        assert!(extraction.is_empty());
    }

    #[test]
    fn host_lookup_ignores_www_prefix() {
        let engine = ExtractionEngine::new(rule_book(), Arc::new(NoArticle));
        let extraction = engine.extract(MARKUP, "https://www.ruled.example/c/5");
        assert_eq!(extraction.source, ExtractionSource::Rules);
    }

    #[test]
    fn host_of_rejects_relative_urls() {
        assert_eq!(host_of("/c/1"), None);
        assert_eq!(
            host_of("https://Ruled.Example:8443/c/1").as_deref(),
            Some("ruled.example")
        );
    }
}
