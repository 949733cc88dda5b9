//! Font discovery: which web font families does a document ask for?

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};

use htmlshot_core::FontSpec;

use crate::sanitize::style::{parse_declarations, split_top_level};
use crate::sanitize::stylesheet::strip_comments;

/// Host/path every web-font CSS URL variant shares (`/css` and `/css2`).
const FONT_CSS_MARKER: &str = "fonts.googleapis.com/css";

const GENERIC_FAMILIES: &[&str] = &[
    "serif",
    "sans-serif",
    "monospace",
    "cursive",
    "fantasy",
    "system-ui",
    "ui-serif",
    "ui-sans-serif",
    "ui-monospace",
    "ui-rounded",
    "emoji",
    "math",
    "fangsong",
    "inherit",
    "initial",
    "unset",
    "revert",
];

const SYSTEM_FAMILIES: &[&str] = &[
    "-apple-system",
    "blinkmacsystemfont",
    "segoe ui",
    "helvetica",
    "helvetica neue",
    "arial",
    "times",
    "times new roman",
    "courier",
    "courier new",
    "georgia",
    "verdana",
    "tahoma",
];

const SIZE_KEYWORDS: &[&str] = &[
    "xx-small", "x-small", "small", "medium", "large", "x-large", "xx-large", "xxx-large",
    "smaller", "larger",
];

static IMPORT_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?["']?([^"')\s]+)"#).expect("Invalid import regex")
});

static FONT_FAMILY_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[;{\s])font-family\s*:\s*([^;}]+)").expect("Invalid font-family regex")
});

static FONT_SHORTHAND_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[;{\s])font\s*:\s*([^;}]+)").expect("Invalid font regex")
});

/// Whether `family` is a generic keyword or a locally installed system font.
pub fn is_builtin_family(family: &str) -> bool {
    let lower = family.trim().to_ascii_lowercase();
    GENERIC_FAMILIES.contains(&lower.as_str()) || SYSTEM_FAMILIES.contains(&lower.as_str())
}

/// Find every downloadable family referenced by `html` and `css`.
///
/// Sources, in order: `<link>` and `@import` references to the web-font CSS
/// endpoint, `font-family`/`font` declarations in stylesheets and inline
/// styles, and `font-family` attributes.
pub fn discover(html: &str, css: &str, endpoint: &str) -> Vec<FontSpec> {
    let document = Html::parse_document(html);
    let mut found = Vec::new();

    if let Ok(links) = Selector::parse("link[href]") {
        for link in document.select(&links) {
            if let Some(href) = link.value().attr("href") {
                if is_font_css_url(href, endpoint) {
                    found.extend(families_from_url(href));
                }
            }
        }
    }

    let mut stylesheets = vec![strip_comments(css)];
    if let Ok(styles) = Selector::parse("style") {
        for block in document.select(&styles) {
            stylesheets.push(strip_comments(&block.text().collect::<String>()));
        }
    }

    for sheet in &stylesheets {
        for caps in IMPORT_URL.captures_iter(sheet) {
            if is_font_css_url(&caps[1], endpoint) {
                found.extend(families_from_url(&caps[1]));
            }
        }
    }
    for sheet in &stylesheets {
        for caps in FONT_FAMILY_DECL.captures_iter(sheet) {
            found.extend(parse_family_list(&caps[1]).into_iter().map(FontSpec::new));
        }
        for caps in FONT_SHORTHAND_DECL.captures_iter(sheet) {
            found.extend(families_from_shorthand(&caps[1]).into_iter().map(FontSpec::new));
        }
    }

    if let Ok(styled) = Selector::parse("[style]") {
        for element in document.select(&styled) {
            let Some(style) = element.value().attr("style") else {
                continue;
            };
            for decl in parse_declarations(style) {
                match decl.property.to_ascii_lowercase().as_str() {
                    "font-family" => found.extend(
                        parse_family_list(&decl.value)
                            .into_iter()
                            .map(FontSpec::new),
                    ),
                    "font" => found.extend(
                        families_from_shorthand(&decl.value)
                            .into_iter()
                            .map(FontSpec::new),
                    ),
                    _ => {}
                }
            }
        }
    }

    if let Ok(attributed) = Selector::parse("[font-family]") {
        for element in document.select(&attributed) {
            if let Some(value) = element.value().attr("font-family") {
                found.extend(parse_family_list(value).into_iter().map(FontSpec::new));
            }
        }
    }

    dedupe(found)
}

/// Merge explicit and discovered specs by lowercase family.
///
/// Explicit specs come first. A spec carrying a variant qualifier replaces
/// one without. The result is capped at `max_families`.
pub fn merge(explicit: &[FontSpec], discovered: &[FontSpec], max_families: usize) -> Vec<FontSpec> {
    let mut merged: Vec<FontSpec> = Vec::new();
    for spec in explicit.iter().chain(discovered) {
        if spec.family.trim().is_empty() || is_builtin_family(&spec.family) {
            continue;
        }
        match merged.iter_mut().find(|m| m.key() == spec.key()) {
            Some(existing) => {
                if existing.variant.is_none() && spec.variant.is_some() {
                    *existing = spec.clone();
                }
            }
            None => merged.push(spec.clone()),
        }
    }
    merged.truncate(max_families);
    merged
}

fn dedupe(specs: Vec<FontSpec>) -> Vec<FontSpec> {
    merge(&specs, &[], usize::MAX)
}

pub(crate) fn is_font_css_url(url: &str, endpoint: &str) -> bool {
    let endpoint = endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    url.contains(FONT_CSS_MARKER) || (!endpoint.is_empty() && url.contains(endpoint))
}

/// `family` query parameters of a web-font CSS URL. Handles both the
/// repeated-parameter form and the legacy `A|B` form.
pub fn families_from_url(url: &str) -> Vec<FontSpec> {
    let Some((_, query)) = url.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(key, _)| *key == "family")
        .flat_map(|(_, value)| {
            let decoded = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            decoded
                .split('|')
                .filter_map(FontSpec::parse_query_value)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Family names from a `font-family` value, without quotes and without
/// generic or system families.
pub fn parse_family_list(value: &str) -> Vec<String> {
    split_top_level(value, ',')
        .into_iter()
        .map(|name| {
            name.trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty() && !name.contains('(') && !is_builtin_family(name))
        .collect()
}

/// Family list of a `font` shorthand: everything after the size token
/// (and optional `/line-height`). Returns nothing for keyword-only values.
pub fn families_from_shorthand(value: &str) -> Vec<String> {
    let mut offset = 0;
    let mut rest = value;

    while let Some(token) = rest.split_whitespace().next() {
        let start = offset + (rest.len() - rest.trim_start().len());
        let end = start + token.len();
        offset = end;
        rest = &value[end..];

        let size_part = token.split('/').next().unwrap_or(token);
        if !is_size_token(size_part) {
            if token.contains(',') || token.starts_with('"') || token.starts_with('\'') {
                return Vec::new();
            }
            continue;
        }

        let mut families = rest.trim_start();
        // `16px/ 1.4`, `16px / 1.4` and `16px /1.4` leave the line-height as the next token.
        let mut skip_line_height = token.ends_with('/');
        if !token.contains('/') {
            if let Some(after_slash) = families.strip_prefix('/') {
                families = after_slash.trim_start();
                skip_line_height = true;
            }
        }
        if skip_line_height {
            families = match families.split_once(char::is_whitespace) {
                Some((_, tail)) => tail,
                None => "",
            };
        }
        return parse_family_list(families);
    }

    Vec::new()
}

fn is_size_token(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    if SIZE_KEYWORDS.contains(&lower.as_str()) {
        return true;
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() || c == '.' => {
            lower.ends_with("px")
                || lower.ends_with("em")
                || lower.ends_with("pt")
                || lower.ends_with('%')
                || lower.ends_with("vw")
                || lower.ends_with("vh")
                || lower.ends_with("ch")
                || lower.ends_with("ex")
        }
        _ => false,
    }
}
