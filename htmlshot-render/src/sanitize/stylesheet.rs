//! Minimal stylesheet support: `selector { declarations }` rules from
//! `<style>` blocks and template CSS are folded into inline styles.
//!
//! At-rules (`@media`, `@font-face`, `@import`, ...) are skipped. Selectors
//! that `scraper` cannot parse are skipped. Specificity is not modelled;
//! rules apply in source order and inline style always wins.

use scraper::{ElementRef, Selector};

use super::style::{parse_declarations, Declaration};

pub struct StyleRule {
    pub selector: Selector,
    pub declarations: Vec<Declaration>,
}

/// Parse rules out of a stylesheet. Never fails.
pub fn parse_stylesheet(css: &str) -> Vec<StyleRule> {
    let css = strip_comments(css);
    let mut rules = Vec::new();
    let mut rest = css.as_str();

    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            break;
        }

        if trimmed.starts_with('@') {
            rest = skip_at_rule(trimmed);
            continue;
        }

        let Some(open) = trimmed.find('{') else {
            break;
        };
        let prelude = trimmed[..open].trim();
        let Some(close) = matching_brace(trimmed, open) else {
            break;
        };
        let body = &trimmed[open + 1..close];
        rest = &trimmed[close + 1..];

        let declarations = parse_declarations(body);
        if declarations.is_empty() {
            continue;
        }
        for selector_text in prelude.split(',') {
            if let Ok(selector) = Selector::parse(selector_text.trim()) {
                rules.push(StyleRule {
                    selector,
                    declarations: declarations.clone(),
                });
            }
        }
    }

    rules
}

/// Declarations from every rule matching `element`, in source order.
pub fn matching_declarations(rules: &[StyleRule], element: &ElementRef<'_>) -> Vec<Declaration> {
    rules
        .iter()
        .filter(|rule| rule.selector.matches(element))
        .flat_map(|rule| rule.declarations.iter().cloned())
        .collect()
}

pub(crate) fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find("*/") {
            Some(end) => rest = &rest[start + 2 + end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn skip_at_rule(input: &str) -> &str {
    let semicolon = input.find(';');
    let brace = input.find('{');
    match (semicolon, brace) {
        (Some(s), Some(b)) if s < b => &input[s + 1..],
        (Some(s), None) => &input[s + 1..],
        (_, Some(b)) => match matching_brace(input, b) {
            Some(close) => &input[close + 1..],
            None => "",
        },
        (None, None) => "",
    }
}

fn matching_brace(input: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in input[open..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_rules_skip_at_rules_and_comments() {
        let rules = parse_stylesheet(
            r#"
            @import url("https://fonts.googleapis.com/css2?family=Inter");
            /* heading */
            h1, .title { color: red; font-size: 48px }
            @media (max-width: 600px) { h1 { color: blue } }
            :::bad { color: green }
            "#,
        );
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].declarations.len(), 2);
    }

    #[test]
    fn test_matching_declarations() {
        let rules = parse_stylesheet("div { color: red } .a { color: blue }");
        let doc = Html::parse_fragment(r#"<div class="a">x</div>"#);
        let selector = Selector::parse("div").expect("selector");
        let element = doc.select(&selector).next().expect("div");
        let decls = matching_declarations(&rules, &element);
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[1].value, "blue");
    }

    #[test]
    fn test_unterminated_input_is_tolerated() {
        assert!(parse_stylesheet("h1 { color: red").is_empty());
        assert_eq!(strip_comments("a /* b"), "a ");
    }
}
