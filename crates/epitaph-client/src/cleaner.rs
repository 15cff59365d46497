use std::sync::Arc;

use epitaph_core::error::AppError;
use epitaph_core::traits::Cleaner;
use htmd::HtmlToMarkdown;
use scraper::{Html, Selector};

/// Containers that usually hold the article body, most specific first.
const ARTICLE_SELECTORS: &[&str] = &[
    "[itemprop=articleBody]",
    ".article-body",
    ".entry-content",
    "article",
    "main",
    "#content",
];

/// HTML-to-Markdown cleaner using htmd.
///
/// Converts raw HTML into readable text, stripping non-content elements
/// (script, style, nav, etc.) before it reaches heuristics or an LLM.
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdCleaner {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdCleaner {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
                "form", "button",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }

    /// Clean only the article body when one can be located.
    pub fn clean_article(&self, html: &str) -> Result<String, AppError> {
        let body = article_html(html).unwrap_or_else(|| html.to_string());
        self.clean(&body)
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        self.converter
            .convert(html)
            .map(|md| md.trim().to_string())
            .map_err(|e| AppError::CleanerError(e.to_string()))
    }
}

/// Inner HTML of the first article-like container with meaningful text.
pub fn article_html(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    ARTICLE_SELECTORS.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        document
            .select(&selector)
            .find(|el| el.text().map(str::trim).collect::<String>().len() > 200)
            .map(|el| el.inner_html())
    })
}

/// Page title, from `og:title` or `<title>`.
pub fn page_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let og = Selector::parse("meta[property='og:title']").ok()?;
    if let Some(content) = document
        .select(&og)
        .next()
        .and_then(|el| el.value().attr("content"))
    {
        return Some(content.trim().to_string());
    }
    let title = Selector::parse("title").ok()?;
    document
        .select(&title)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}
