//! Declaration-level CSS sanitization.
//!
//! Works on parsed declarations rather than raw strings: splitting respects
//! quotes and nested parentheses, so `url("a;b")` survives intact.

use std::collections::BTreeMap;

use super::{DropReason, SanitizeMode, SanitizeReport};

/// One `property: value` pair as written in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub property: String,
    pub value: String,
}

/// Split a declaration block (`a: b; c: d`) into declarations.
///
/// Never fails; fragments without a colon are skipped.
pub fn parse_declarations(block: &str) -> Vec<Declaration> {
    split_top_level(block, ';')
        .into_iter()
        .filter_map(|chunk| {
            let colon = find_top_level(chunk, ':')?;
            let property = chunk[..colon].trim();
            let mut value = chunk[colon + 1..].trim();
            if let Some(stripped) = strip_important(value) {
                value = stripped;
            }
            if property.is_empty() {
                return None;
            }
            Some(Declaration {
                property: property.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn strip_important(value: &str) -> Option<&str> {
    let lower = value.to_ascii_lowercase();
    let idx = lower.rfind("!important")?;
    if lower[idx..].trim() == "!important" {
        Some(value[..idx].trim_end())
    } else {
        None
    }
}

/// Split on `sep` outside quotes and parentheses.
pub(crate) fn split_top_level(input: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') => escaped = true,
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"') | (None, '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn find_top_level(input: &str, target: char) -> Option<usize> {
    let first = split_top_level(input, target).into_iter().next()?;
    if first.len() == input.len() {
        None
    } else {
        Some(first.len())
    }
}

// ============================================================================
// PROPERTY NAMES
// ============================================================================

/// `background-color` → `backgroundColor`, `-webkit-line-clamp` →
/// `WebkitLineClamp`, `-ms-transform` → `msTransform`.
pub fn camel_case_property(property: &str) -> String {
    let lower = property.trim().to_ascii_lowercase();
    let (prefix, rest) = match lower.strip_prefix('-') {
        Some(rest) => match rest.split_once('-') {
            Some((vendor, rest)) => (Some(vendor.to_string()), rest.to_string()),
            None => (None, rest.to_string()),
        },
        None => (None, lower),
    };

    let mut out = String::with_capacity(property.len());
    if let Some(vendor) = prefix {
        if vendor == "ms" {
            out.push_str("ms");
        } else {
            out.push_str(&capitalize(&vendor));
        }
        for segment in rest.split('-').filter(|s| !s.is_empty()) {
            out.push_str(&capitalize(segment));
        }
        return out;
    }

    for (i, segment) in rest.split('-').filter(|s| !s.is_empty()).enumerate() {
        if i == 0 {
            out.push_str(segment);
        } else {
            out.push_str(&capitalize(segment));
        }
    }
    out
}

fn capitalize(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Properties the compositor understands, in camelCase.
const ALLOWED_PROPERTIES: &[&str] = &[
    "display",
    "position",
    "top",
    "right",
    "bottom",
    "left",
    "width",
    "height",
    "minWidth",
    "minHeight",
    "maxWidth",
    "maxHeight",
    "margin",
    "marginTop",
    "marginRight",
    "marginBottom",
    "marginLeft",
    "padding",
    "paddingTop",
    "paddingRight",
    "paddingBottom",
    "paddingLeft",
    "border",
    "borderWidth",
    "borderStyle",
    "borderColor",
    "borderTop",
    "borderRight",
    "borderBottom",
    "borderLeft",
    "borderTopWidth",
    "borderRightWidth",
    "borderBottomWidth",
    "borderLeftWidth",
    "borderTopColor",
    "borderRightColor",
    "borderBottomColor",
    "borderLeftColor",
    "borderTopStyle",
    "borderRightStyle",
    "borderBottomStyle",
    "borderLeftStyle",
    "borderRadius",
    "borderTopLeftRadius",
    "borderTopRightRadius",
    "borderBottomLeftRadius",
    "borderBottomRightRadius",
    "flex",
    "flexDirection",
    "flexWrap",
    "flexGrow",
    "flexShrink",
    "flexBasis",
    "alignItems",
    "alignContent",
    "alignSelf",
    "justifyContent",
    "gap",
    "rowGap",
    "columnGap",
    "overflow",
    "overflowX",
    "overflowY",
    "color",
    "opacity",
    "background",
    "backgroundColor",
    "backgroundImage",
    "backgroundPosition",
    "backgroundSize",
    "backgroundClip",
    "backgroundRepeat",
    "boxShadow",
    "boxSizing",
    "transform",
    "transformOrigin",
    "fontFamily",
    "fontSize",
    "fontWeight",
    "fontStyle",
    "textAlign",
    "textTransform",
    "textOverflow",
    "textDecoration",
    "textDecorationLine",
    "textDecorationColor",
    "textDecorationStyle",
    "textShadow",
    "textWrap",
    "lineHeight",
    "letterSpacing",
    "whiteSpace",
    "wordBreak",
    "objectFit",
    "objectPosition",
    "clipPath",
    "filter",
    "mixBlendMode",
    "maskImage",
    "WebkitLineClamp",
    "WebkitTextStroke",
    "WebkitTextStrokeWidth",
    "WebkitTextStrokeColor",
    "lineClamp",
];

const LENGTH_PROPERTIES: &[&str] = &[
    "width",
    "height",
    "minWidth",
    "minHeight",
    "maxWidth",
    "maxHeight",
    "flexBasis",
];

const INTRINSIC_KEYWORDS: &[&str] = &["fit-content", "max-content", "min-content"];

const NON_SOLID_BORDER_STYLES: &[&str] = &[
    "dashed", "dotted", "double", "groove", "ridge", "inset", "outset",
];

fn is_allowed(property: &str) -> bool {
    ALLOWED_PROPERTIES.contains(&property)
}

/// Map a `display` value to the compositor's supported set.
pub fn normalize_display(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "flex" | "inline-flex" | "grid" | "inline-grid" => Some("flex"),
        "block" | "flow-root" | "list-item" => Some("block"),
        "inline" | "inline-block" => Some("inline"),
        "none" => Some("none"),
        "contents" => Some("contents"),
        _ => None,
    }
}

// ============================================================================
// SANITIZATION
// ============================================================================

/// Outcome for one declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Keep { property: String, value: String },
    Drop(DropReason),
}

/// Decide whether a single declaration survives, and in what form.
pub fn sanitize_declaration(decl: &Declaration, mode: SanitizeMode) -> Verdict {
    if decl.property.trim_start().starts_with("--") {
        return Verdict::Drop(DropReason::CustomProperty);
    }

    let property = camel_case_property(&decl.property);
    if !is_allowed(&property) {
        return Verdict::Drop(DropReason::Unsupported);
    }

    let value = decl.value.trim();
    if value.is_empty() {
        return Verdict::Drop(DropReason::Empty);
    }

    let lower = value.to_ascii_lowercase();
    if lower.contains("var(") {
        return Verdict::Drop(DropReason::CustomProperty);
    }
    if mode == SanitizeMode::Strict && lower.contains("env(") {
        return Verdict::Drop(DropReason::EnvFunction);
    }
    if lower.contains("data:") {
        return Verdict::Drop(DropReason::DataUrl);
    }

    if property == "display" {
        return match normalize_display(&lower) {
            Some(display) => Verdict::Keep {
                property,
                value: display.to_string(),
            },
            None => Verdict::Drop(DropReason::Display),
        };
    }

    if LENGTH_PROPERTIES.contains(&property.as_str())
        && INTRINSIC_KEYWORDS.iter().any(|k| lower.contains(k))
    {
        return Verdict::Drop(DropReason::IntrinsicSize);
    }

    if property.starts_with("overflow") && lower != "visible" && lower != "hidden" {
        return Verdict::Drop(DropReason::Overflow);
    }

    if property.starts_with("border")
        && !property.ends_with("Radius")
        && !property.ends_with("Width")
        && !property.ends_with("Color")
        && lower
            .split_whitespace()
            .any(|token| NON_SOLID_BORDER_STYLES.contains(&token))
    {
        return Verdict::Drop(DropReason::BorderStyle);
    }

    Verdict::Keep {
        property,
        value: value.to_string(),
    }
}

/// Sanitize a full set of declarations into a style map, later
/// declarations overriding earlier ones.
pub fn sanitize_declarations(
    declarations: &[Declaration],
    mode: SanitizeMode,
    report: &mut SanitizeReport,
) -> BTreeMap<String, String> {
    let mut style = BTreeMap::new();
    for decl in declarations {
        report.parsed += 1;
        match sanitize_declaration(decl, mode) {
            Verdict::Keep { property, value } => {
                report.kept += 1;
                style.insert(property, value);
            }
            Verdict::Drop(reason) => report.record_drop(reason),
        }
    }
    style
}
