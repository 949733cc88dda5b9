//! `@font-face` parsing and Basic Latin coverage scoring.

use once_cell::sync::Lazy;
use regex::Regex;

use htmlshot_core::FontStyle;

use crate::sanitize::style::parse_declarations;

static FONT_FACE_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)(?:/\*\s*([\w-]+)\s*\*/\s*)?@font-face\s*\{([^}]*)\}")
        .expect("Invalid @font-face regex")
});

static SRC_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*["']?([^"')\s]+)["']?\s*\)"#).expect("Invalid url() regex")
});

const PRINTABLE_ASCII: (u32, u32) = (0x20, 0x7E);

/// One parsed `@font-face` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FontFace {
    pub family: String,
    pub weight: u16,
    pub style: FontStyle,
    pub url: String,
    /// Empty means the face covers every code point.
    pub unicode_range: Vec<(u32, u32)>,
    /// Subset label from a preceding `/* latin */` comment.
    pub subset: Option<String>,
}

impl FontFace {
    /// Basic Latin coverage score, higher is better:
    /// 3 = covers all printable ASCII, 2 = partial overlap,
    /// 1 = labelled `latin`, 0 = unscored.
    pub fn latin_score(&self) -> u8 {
        if self.unicode_range.is_empty() {
            return 3;
        }
        let (lo, hi) = PRINTABLE_ASCII;
        if self
            .unicode_range
            .iter()
            .any(|&(start, end)| start <= lo && end >= hi)
        {
            return 3;
        }
        if self
            .unicode_range
            .iter()
            .any(|&(start, end)| start <= hi && end >= lo)
        {
            return 2;
        }
        if self
            .subset
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("latin"))
        {
            return 1;
        }
        0
    }

    fn variant_key(&self) -> (String, u16, FontStyle) {
        (self.family.to_lowercase(), self.weight, self.style)
    }
}

/// Parse every `@font-face` rule that has a family and a source URL.
pub fn parse_font_faces(css: &str) -> Vec<FontFace> {
    FONT_FACE_BLOCK
        .captures_iter(css)
        .filter_map(|caps| {
            let subset = caps.get(1).map(|m| m.as_str().to_string());
            let body = caps.get(2)?.as_str();

            let mut family = None;
            let mut weight = 400;
            let mut style = FontStyle::Normal;
            let mut url = None;
            let mut unicode_range = Vec::new();

            for decl in parse_declarations(body) {
                match decl.property.to_ascii_lowercase().as_str() {
                    "font-family" => {
                        family = Some(
                            decl.value
                                .trim_matches(|c| c == '"' || c == '\'')
                                .trim()
                                .to_string(),
                        )
                    }
                    "font-weight" => weight = parse_weight(&decl.value),
                    "font-style" => style = FontStyle::parse(&decl.value),
                    "src" => {
                        url = SRC_URL
                            .captures(&decl.value)
                            .and_then(|c| c.get(1))
                            .map(|m| m.as_str().to_string())
                    }
                    "unicode-range" => unicode_range = parse_unicode_range(&decl.value),
                    _ => {}
                }
            }

            Some(FontFace {
                family: family.filter(|f| !f.is_empty())?,
                weight,
                style,
                url: url?,
                unicode_range,
                subset,
            })
        })
        .collect()
}

/// `normal` = 400, `bold` = 700, numeric values as-is; variable ranges
/// (`100 900`) take their lower bound.
pub fn parse_weight(value: &str) -> u16 {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "normal" => 400,
        "bold" => 700,
        other => other
            .split_whitespace()
            .next()
            .and_then(|w| w.parse::<u16>().ok())
            .filter(|w| (1..=1000).contains(w))
            .unwrap_or(400),
    }
}

/// Parse `U+0000-00FF, U+0131, U+02??` into inclusive ranges.
pub fn parse_unicode_range(value: &str) -> Vec<(u32, u32)> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let hex = part
                .strip_prefix("U+")
                .or_else(|| part.strip_prefix("u+"))?;
            if let Some((start, end)) = hex.split_once('-') {
                let start = u32::from_str_radix(start, 16).ok()?;
                let end = u32::from_str_radix(end, 16).ok()?;
                return Some((start.min(end), start.max(end)));
            }
            if hex.contains('?') {
                let start = u32::from_str_radix(&hex.replace('?', "0"), 16).ok()?;
                let end = u32::from_str_radix(&hex.replace('?', "F"), 16).ok()?;
                return Some((start, end));
            }
            let point = u32::from_str_radix(hex, 16).ok()?;
            Some((point, point))
        })
        .collect()
}

/// For each `(family, weight, style)`, keep the face with the best Basic
/// Latin score; ties go to the first declared.
pub fn select_faces(faces: Vec<FontFace>) -> Vec<FontFace> {
    let mut best: Vec<FontFace> = Vec::new();
    for face in faces {
        let key = face.variant_key();
        match best.iter_mut().find(|b| b.variant_key() == key) {
            Some(current) => {
                if face.latin_score() > current.latin_score() {
                    *current = face;
                }
            }
            None => best.push(face),
        }
    }
    best
}
