// Small helpers shared by the page scrapers.

use scraper::{ElementRef, Selector};

/// Compile a selector literal. Selectors are constants, so a failure is a bug.
pub(crate) fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid selector {css:?}: {e}"))
}

/// Text content with whitespace runs collapsed to single spaces
pub(crate) fn text_of(element: ElementRef<'_>) -> String {
    normalize_space(&element.text().collect::<String>())
}

/// Normalized text of the first match below `element`, if non-empty
pub(crate) fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(text_of)
        .filter(|t| !t.is_empty())
}

pub(crate) fn normalize_space(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
