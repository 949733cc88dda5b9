//! Stored templates and `{{ variable }}` substitution.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;
use crate::{ImageFormat, Timestamp};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_-]{1,64})\s*\}\}").expect("Invalid placeholder regex")
});

/// A template as returned by the template provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub id: String,
    pub html: String,
    #[serde(default)]
    pub css: String,
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default)]
    pub is_public: bool,
    pub user_id: String,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateVariable {
    pub name: String,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl Template {
    /// Public templates render for anyone; private ones only for their owner.
    pub fn is_visible_to(&self, uid: &str) -> bool {
        self.is_public || self.user_id == uid
    }

    /// Version tag embedded in signed URLs (`tv`): `updated_at` in epoch millis.
    pub fn version_tag(&self) -> String {
        self.updated_at.timestamp_millis().to_string()
    }

    /// Substitute resolved values into html (escaped) and css (raw).
    pub fn render_sources(&self, values: &BTreeMap<String, String>) -> (String, String) {
        (
            substitute(&self.html, values, Escape::Html),
            substitute(&self.css, values, Escape::None),
        )
    }
}

/// Merge provided values over template defaults.
///
/// # Errors
/// `MissingVariables` naming every required variable left without a value,
/// in declaration order.
pub fn resolve_variables(
    template: &Template,
    provided: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ResolutionError> {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();

    for variable in &template.variables {
        let value = provided
            .get(&variable.name)
            .or(variable.default_value.as_ref())
            .filter(|v| !v.is_empty());
        match value {
            Some(v) => {
                values.insert(variable.name.clone(), v.clone());
            }
            None if variable.required => missing.push(variable.name.clone()),
            None => {
                values.insert(variable.name.clone(), String::new());
            }
        }
    }

    if !missing.is_empty() {
        return Err(ResolutionError::MissingVariables { names: missing });
    }

    // Undeclared variables still substitute; templates may reference them.
    for (name, value) in provided {
        values.entry(name.clone()).or_insert_with(|| value.clone());
    }

    Ok(values)
}

/// How substituted values are escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    Html,
    None,
}

/// Replace `{{ name }}` placeholders. Unknown placeholders are left as-is.
pub fn substitute(text: &str, values: &BTreeMap<String, String>, escape: Escape) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => match escape {
                Escape::Html => escape_html(value),
                Escape::None => value.clone(),
            },
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
