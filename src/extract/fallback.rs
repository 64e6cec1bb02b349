use readability_js::{Readability, ReadabilityError, ReadabilityOptions};
use scraper::Html;

use crate::extract::render::{decode_entities, render_html, render_text};
use crate::model::ChapterContent;

/// Best-effort extraction for hosts without a rule set.
pub trait FallbackExtractor: Send + Sync {
    /// `None` when no article could be identified.
    fn extract(&self, markup: &str, url: &str) -> Option<ChapterContent>;
}

/// Readability heuristic: picks the primary article block and strips
/// navigation and other boilerplate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadabilityFallback;

impl FallbackExtractor for ReadabilityFallback {
    fn extract(&self, markup: &str, url: &str) -> Option<ChapterContent> {
        if markup.trim().is_empty() {
            return None;
        }

        let readability = match Readability::new() {
            Ok(readability) => readability,
            Err(err) => {
                tracing::warn!(?err, "initialize readability-js");
                return None;
            }
        };

        let article = match parse_article(&readability, markup, url) {
            Ok(article) => article,
            Err(err) => {
                tracing::debug!(%url, ?err, "readability found no article");
                return None;
            }
        };

        let fragment = Html::parse_fragment(&article.content);
        let text = render_text(fragment.root_element());
        if text.trim().is_empty() {
            return None;
        }

        let title = decode_entities(article.title.trim());
        let html = render_html(fragment.root_element());
        Some(ChapterContent {
            title: (!title.is_empty()).then_some(title),
            text: Some(text),
            html: (!html.is_empty()).then_some(html),
        })
    }
}

#[derive(Debug)]
struct Article {
    title: String,
    content: String,
}

fn parse_article(
    readability: &Readability,
    markup: &str,
    url: &str,
) -> Result<Article, ReadabilityError> {
    match readability.parse_with_url(markup, url) {
        Ok(article) => Ok(Article {
            title: article.title,
            content: article.content,
        }),
        Err(ReadabilityError::ReadabilityCheckFailed) => {
            // Short chapters fail the default length check; retry leniently.
            let options = ReadabilityOptions::new()
                .char_threshold(0)
                .nb_top_candidates(10)
                .link_density_modifier(2.0);
            let article = readability.parse_with_options(markup, Some(url), Some(options))?;
            Ok(Article {
                title: article.title,
                content: article.content,
            })
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_markup_has_no_article() {
        assert!(
            ReadabilityFallback
                .extract("   ", "https://unknown.example/c/1")
                .is_none()
        );
    }

    #[test]
    fn readability_finds_primary_article_text() {
        let paragraph = "The caravan crossed the salt flats at dawn, and nobody spoke of the \
                         lanterns they had seen the night before. ";
        let body = paragraph.repeat(12);
        let markup = format!(
            r#"<!doctype html><html><head><title>Salt Flats</title></head><body>
<nav><a href="/">Home</a> <a href="/list">Index</a></nav>
<article><h1>Salt Flats</h1><p>{body}</p><p>{body}</p></article>
<footer>Copyright</footer></body></html>"#
        );

        let content = ReadabilityFallback
            .extract(&markup, "https://unknown.example/c/1")
            .expect("article");
        assert!(content.text.unwrap_or_default().contains("salt flats at dawn"));
    }
}
