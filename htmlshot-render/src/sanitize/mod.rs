//! HTML sanitizer and normalizer.
//!
//! Turns arbitrary HTML into the typed node tree the compositor consumes:
//! `{"type": tag, "props": {"style": {...}, "tw": "...", "children": [...]}}`.
//! This is a total function. Malformed markup yields a partial or empty
//! tree, never an error.

mod classes;
pub mod style;
pub mod stylesheet;

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Node, Selector};
use serde::Serialize;

pub use classes::{is_class_attribute, merge_class_lists};
pub use style::{camel_case_property, parse_declarations, Declaration};
use stylesheet::{matching_declarations, parse_stylesheet, StyleRule};

/// Sanitization strictness. `Strict` is used by the recovery cascade after a
/// style-like compositor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SanitizeMode {
    #[default]
    Standard,
    Strict,
}

impl SanitizeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SanitizeMode::Standard => "standard",
            SanitizeMode::Strict => "strict",
        }
    }
}

/// Why a declaration was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    Unsupported,
    CustomProperty,
    DataUrl,
    Display,
    IntrinsicSize,
    Overflow,
    BorderStyle,
    EnvFunction,
    Empty,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unsupported => "unsupported_property",
            DropReason::CustomProperty => "custom_property",
            DropReason::DataUrl => "data_url",
            DropReason::Display => "display",
            DropReason::IntrinsicSize => "intrinsic_size",
            DropReason::Overflow => "overflow",
            DropReason::BorderStyle => "border_style",
            DropReason::EnvFunction => "env_function",
            DropReason::Empty => "empty_value",
        }
    }
}

/// Declaration counters. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub parsed: u64,
    pub kept: u64,
    pub dropped: BTreeMap<DropReason, u64>,
}

impl SanitizeReport {
    pub fn record_drop(&mut self, reason: DropReason) {
        *self.dropped.entry(reason).or_insert(0) += 1;
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.values().sum()
    }
}

// ============================================================================
// RENDER TREE
// ============================================================================

/// A typed element node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderNode {
    #[serde(rename = "type")]
    pub tag: String,
    pub props: RenderProps,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderProps {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tw: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RenderChild>,
    /// Tag-specific attributes (`src`, `href`, `viewBox`, ...).
    #[serde(flatten)]
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RenderChild {
    Text(String),
    Element(RenderNode),
}

impl RenderNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            props: RenderProps::default(),
        }
    }
}

/// Output of one sanitization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    pub root: RenderNode,
    pub report: SanitizeReport,
}

/// Concatenated text content of a tree, used for font subsetting.
pub fn collect_text(node: &RenderNode) -> String {
    let mut out = String::new();
    collect_into(node, &mut out);
    out
}

fn collect_into(node: &RenderNode, out: &mut String) {
    for child in &node.props.children {
        match child {
            RenderChild::Text(text) => out.push_str(text),
            RenderChild::Element(element) => collect_into(element, out),
        }
    }
}

// ============================================================================
// SANITIZER
// ============================================================================

/// Elements removed together with their content.
const DROPPED_TAGS: &[&str] = &[
    "style", "script", "head", "meta", "link", "title", "noscript", "template",
];

/// Wrappers replaced by their children.
const UNWRAPPED_TAGS: &[&str] = &["html", "body"];

const LINE_BREAK_TAGS: &[&str] = &["br", "hr"];

fn kept_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "img" => &["src", "width", "height", "alt"],
        "a" => &["href"],
        "svg" => &["viewbox", "fill", "stroke", "xmlns", "width", "height"],
        "path" | "circle" | "rect" | "line" | "polyline" | "polygon" | "ellipse" | "g" => &[
            "d",
            "fill",
            "stroke",
            "stroke-width",
            "cx",
            "cy",
            "r",
            "x",
            "y",
            "rx",
            "ry",
            "points",
            "x1",
            "x2",
            "y1",
            "y2",
            "width",
            "height",
            "transform",
        ],
        _ => &[],
    }
}

/// Intermediate child list entry before text merging.
enum Piece {
    Text(String),
    Break,
    Element(RenderNode),
}

/// Sanitize `html`, applying `extra_css` (template stylesheet) plus any
/// `<style>` blocks found in the document.
pub fn sanitize(html: &str, extra_css: &str, mode: SanitizeMode) -> Sanitized {
    let document = Html::parse_document(html);
    let mut css = String::from(extra_css);
    if let Ok(style_selector) = Selector::parse("style") {
        for block in document.select(&style_selector) {
            css.push('\n');
            css.extend(block.text());
        }
    }
    let rules = parse_stylesheet(&css);

    let mut walker = Walker {
        rules: &rules,
        mode,
        report: SanitizeReport::default(),
    };
    let pieces = walker.walk_children(document.root_element());
    let (children, has_break) = merge_pieces(pieces);

    let root = match single_element(children) {
        Ok(node) => node,
        Err(children) => {
            let mut wrapper = RenderNode::new("div");
            wrapper
                .props
                .style
                .insert("display".to_string(), "flex".to_string());
            wrapper
                .props
                .style
                .insert("flexDirection".to_string(), "column".to_string());
            if has_break {
                force_pre_wrap(&mut wrapper);
            }
            wrapper.props.children = children;
            wrapper
        }
    };

    Sanitized {
        root,
        report: walker.report,
    }
}

fn single_element(mut children: Vec<RenderChild>) -> Result<RenderNode, Vec<RenderChild>> {
    if children.len() == 1 {
        if let Some(RenderChild::Element(_)) = children.first() {
            if let Some(RenderChild::Element(node)) = children.pop() {
                return Ok(node);
            }
        }
    }
    Err(children)
}

struct Walker<'r> {
    rules: &'r [StyleRule],
    mode: SanitizeMode,
    report: SanitizeReport,
}

impl Walker<'_> {
    fn walk_children(&mut self, element: ElementRef<'_>) -> Vec<Piece> {
        let mut pieces = Vec::new();
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    let text: &str = text;
                    if text.trim().is_empty() && text.contains('\n') {
                        continue;
                    }
                    pieces.push(Piece::Text(text.to_string()));
                }
                Node::Element(_) => {
                    if let Some(child_ref) = ElementRef::wrap(child) {
                        self.walk_element(child_ref, &mut pieces);
                    }
                }
                _ => {}
            }
        }
        pieces
    }

    fn walk_element(&mut self, element: ElementRef<'_>, out: &mut Vec<Piece>) {
        let tag = element.value().name().to_ascii_lowercase();

        if DROPPED_TAGS.contains(&tag.as_str()) {
            return;
        }
        if UNWRAPPED_TAGS.contains(&tag.as_str()) {
            out.extend(self.walk_children(element));
            return;
        }
        if LINE_BREAK_TAGS.contains(&tag.as_str()) {
            out.push(Piece::Break);
            return;
        }

        let mut node = RenderNode::new(tag.clone());

        let mut declarations = matching_declarations(self.rules, &element);
        let mut class_values = Vec::new();
        let allowed = kept_attributes(&tag);

        for (name, value) in element.value().attrs() {
            let lower = name.to_ascii_lowercase();
            if lower == "style" {
                declarations.extend(parse_declarations(value));
            } else if is_class_attribute(&lower) {
                class_values.push(value);
            } else if lower == "id" || allowed.contains(&lower.as_str()) {
                let key = if lower == "viewbox" {
                    "viewBox".to_string()
                } else {
                    lower
                };
                node.props.attrs.insert(key, value.to_string());
            }
        }

        node.props.style = style::sanitize_declarations(&declarations, self.mode, &mut self.report);
        node.props.tw = merge_class_lists(class_values);

        let (children, has_break) = merge_pieces(self.walk_children(element));
        node.props.children = children;
        if has_break {
            force_pre_wrap(&mut node);
        }

        out.push(Piece::Element(node));
    }
}

fn force_pre_wrap(node: &mut RenderNode) {
    node.props
        .style
        .insert("whiteSpace".to_string(), "pre-wrap".to_string());
}

/// Merge adjacent text and line breaks into single text children.
/// Returns whether any break was folded in.
fn merge_pieces(pieces: Vec<Piece>) -> (Vec<RenderChild>, bool) {
    let mut children = Vec::new();
    let mut pending: Option<String> = None;
    let mut has_break = false;

    for piece in pieces {
        match piece {
            Piece::Text(text) => pending.get_or_insert_with(String::new).push_str(&text),
            Piece::Break => {
                has_break = true;
                pending.get_or_insert_with(String::new).push('\n');
            }
            Piece::Element(node) => {
                if let Some(text) = pending.take() {
                    children.push(RenderChild::Text(text));
                }
                children.push(RenderChild::Element(node));
            }
        }
    }
    if let Some(text) = pending {
        children.push(RenderChild::Text(text));
    }

    (children, has_break)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child_element(node: &RenderNode, index: usize) -> &RenderNode {
        match &node.props.children[index] {
            RenderChild::Element(el) => el,
            RenderChild::Text(text) => panic!("expected element, found text {:?}", text),
        }
    }

    #[test]
    fn test_unwraps_document_shell_and_drops_head() {
        let out = sanitize(
            "<!doctype html><html><head><title>x</title><meta charset=utf-8>\
             <script>alert(1)</script></head><body><div>Hello</div></body></html>",
            "",
            SanitizeMode::Standard,
        );
        assert_eq!(out.root.tag, "div");
        assert_eq!(
            out.root.props.children,
            vec![RenderChild::Text("Hello".to_string())]
        );
    }

    #[test]
    fn test_multiple_roots_are_wrapped() {
        let out = sanitize("<p>a</p><p>b</p>", "", SanitizeMode::Standard);
        assert_eq!(out.root.tag, "div");
        assert_eq!(out.root.props.children.len(), 2);
        assert_eq!(out.root.props.style["display"], "flex");
    }

    #[test]
    fn test_line_breaks_become_newlines() {
        let out = sanitize("<div>one<br>two<br/>three</div>", "", SanitizeMode::Standard);
        assert_eq!(
            out.root.props.children,
            vec![RenderChild::Text("one\ntwo\nthree".to_string())]
        );
        assert_eq!(out.root.props.style["whiteSpace"], "pre-wrap");
    }

    #[test]
    fn test_class_aliases_render_identically() {
        let baseline = sanitize(
            r#"<div class="flex p-4"><span class="text-xl">x</span></div>"#,
            "",
            SanitizeMode::Standard,
        );
        for html in [
            r#"<div className="flex p-4"><span classname="text-xl">x</span></div>"#,
            r#"<div CLASS="flex p-4"><span tw="text-xl">x</span></div>"#,
            r#"<div class="flex" tw="p-4 flex"><span className="text-xl">x</span></div>"#,
        ] {
            let out = sanitize(html, "", SanitizeMode::Standard);
            assert_eq!(out.root, baseline.root, "{}", html);
        }
    }

    #[test]
    fn test_unsupported_styles_degrade_gracefully() {
        let out = sanitize(
            r#"<div style="color: var(--x); background-image: url(data:image/png;base64,AA);
                border: 1px dotted red; overflow-y: scroll; width: fit-content;
                padding: 8px">x</div>"#,
            "",
            SanitizeMode::Standard,
        );
        let style = &out.root.props.style;
        assert_eq!(style.len(), 1);
        assert_eq!(style["padding"], "8px");
        assert_eq!(out.report.parsed, 6);
        assert_eq!(out.report.kept, 1);
        assert_eq!(out.report.dropped_total(), 5);
    }

    #[test]
    fn test_stylesheet_rules_apply_under_inline_style() {
        let out = sanitize(
            r#"<style>h1 { color: red; font-size: 40px }</style><h1 style="color: blue">T</h1>"#,
            ".x { margin: 0 }",
            SanitizeMode::Standard,
        );
        assert_eq!(out.root.tag, "h1");
        assert_eq!(out.root.props.style["color"], "blue");
        assert_eq!(out.root.props.style["fontSize"], "40px");
    }

    #[test]
    fn test_tag_specific_attributes() {
        let out = sanitize(
            r#"<div id="card" onclick="x()"><img src="https://e.x/a.png" width="10" data-x="1"><a href="/h" target="_blank">l</a></div>"#,
            "",
            SanitizeMode::Standard,
        );
        assert_eq!(out.root.props.attrs.get("id").map(String::as_str), Some("card"));
        assert!(!out.root.props.attrs.contains_key("onclick"));
        let img = child_element(&out.root, 0);
        assert_eq!(img.props.attrs.len(), 2);
        let link = child_element(&out.root, 1);
        assert_eq!(link.props.attrs.get("href").map(String::as_str), Some("/h"));
        assert!(!link.props.attrs.contains_key("target"));
    }

    #[test]
    fn test_serialized_shape() -> Result<(), serde_json::Error> {
        let out = sanitize(
            r#"<div class="a" style="display:flex"><span>t</span></div>"#,
            "",
            SanitizeMode::Standard,
        );
        let json = serde_json::to_value(&out.root)?;
        assert_eq!(json["type"], "div");
        assert_eq!(json["props"]["tw"], "a");
        assert_eq!(json["props"]["style"]["display"], "flex");
        assert_eq!(json["props"]["children"][0]["props"]["children"][0], "t");
        Ok(())
    }

    #[test]
    fn test_malformed_input_never_panics() {
        for html in ["", "<", "<div style=\"", "<<<>>>", "<svg><path d=\"M0 0\"></svg>"] {
            let out = sanitize(html, "}{ ;;", SanitizeMode::Strict);
            assert!(!out.root.tag.is_empty());
        }
    }

    #[test]
    fn test_collect_text() {
        let out = sanitize("<div>ab<span>cd</span><br>e</div>", "", SanitizeMode::Standard);
        assert_eq!(collect_text(&out.root), "abcd\ne");
    }
}
