//! Deterministic canonicalization of signed image-request parameters.
//!
//! The canonical string is a pure function of the logical field set: every
//! key and value is percent-encoded and the pair list is sorted before
//! joining, so the order in which a client (or a proxy) emits query
//! parameters never changes the signature or the content hash.

use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::{ContentHash, ImageFormat};

/// Prefix marking template variables in the query string.
pub const VARIABLE_PREFIX: &str = "v_";

/// Query key carrying the signature. Never part of the canonical string.
pub const SIGNATURE_KEY: &str = "sig";

const KEY_TEMPLATE_ID: &str = "templateId";
const KEY_UID: &str = "uid";
const KEY_EXP: &str = "exp";
const KEY_WIDTH: &str = "width";
const KEY_HEIGHT: &str = "height";
const KEY_FORMAT: &str = "format";
const KEY_QUALITY: &str = "quality";
const KEY_TEMPLATE_VERSION: &str = "tv";

/// The logical field set of a signed image request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRequestFields {
    pub template_id: String,
    pub uid: String,
    /// Absolute expiry, unix seconds.
    pub exp: i64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
    pub quality: Option<u8>,
    /// Template version; changes whenever the template is edited.
    pub tv: Option<String>,
    pub variables: BTreeMap<String, String>,
}

impl ImageRequestFields {
    pub fn new(template_id: impl Into<String>, uid: impl Into<String>, exp: i64) -> Self {
        Self {
            template_id: template_id.into(),
            uid: uid.into(),
            exp,
            ..Default::default()
        }
    }

    /// Unordered `(key, value)` pairs for every present field.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            (KEY_TEMPLATE_ID.to_string(), self.template_id.clone()),
            (KEY_UID.to_string(), self.uid.clone()),
            (KEY_EXP.to_string(), self.exp.to_string()),
        ];
        if let Some(width) = self.width {
            pairs.push((KEY_WIDTH.to_string(), width.to_string()));
        }
        if let Some(height) = self.height {
            pairs.push((KEY_HEIGHT.to_string(), height.to_string()));
        }
        if let Some(format) = self.format {
            pairs.push((KEY_FORMAT.to_string(), format.as_str().to_string()));
        }
        if let Some(quality) = self.quality {
            pairs.push((KEY_QUALITY.to_string(), quality.to_string()));
        }
        if let Some(tv) = &self.tv {
            pairs.push((KEY_TEMPLATE_VERSION.to_string(), tv.clone()));
        }
        for (name, value) in &self.variables {
            pairs.push((format!("{}{}", VARIABLE_PREFIX, name), value.clone()));
        }
        pairs
    }

    pub fn canonical(&self) -> String {
        canonicalize(self)
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_canonical(&self.canonical())
    }

    pub fn is_expired(&self, now_epoch_secs: i64) -> bool {
        self.exp <= now_epoch_secs
    }

    /// Parse decoded query pairs into the logical field set.
    ///
    /// Returns the fields and the `sig` value, if present. Unknown keys,
    /// duplicate keys and unparsable values are validation errors.
    pub fn from_query_pairs<I>(pairs: I) -> Result<(Self, Option<String>), ValidationError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut fields = ImageRequestFields::default();
        let mut seen: BTreeMap<String, ()> = BTreeMap::new();
        let mut signature = None;
        let mut template_id = None;
        let mut uid = None;
        let mut exp = None;

        for (key, value) in pairs {
            if seen.insert(key.clone(), ()).is_some() {
                return Err(ValidationError::DuplicateParameter { name: key });
            }

            match key.as_str() {
                SIGNATURE_KEY => signature = Some(value),
                KEY_TEMPLATE_ID => template_id = Some(value),
                KEY_UID => uid = Some(value),
                KEY_EXP => exp = Some(parse_number::<i64>(KEY_EXP, &value)?),
                KEY_WIDTH => fields.width = Some(parse_number(KEY_WIDTH, &value)?),
                KEY_HEIGHT => fields.height = Some(parse_number(KEY_HEIGHT, &value)?),
                KEY_FORMAT => {
                    let format =
                        ImageFormat::parse(&value).ok_or_else(|| ValidationError::InvalidValue {
                            field: KEY_FORMAT.to_string(),
                            reason: format!("unsupported format '{}'", value),
                        })?;
                    fields.format = Some(format);
                }
                KEY_QUALITY => {
                    let quality: u8 = parse_number(KEY_QUALITY, &value)?;
                    if !(1..=100).contains(&quality) {
                        return Err(ValidationError::OutOfRange {
                            field: KEY_QUALITY.to_string(),
                            min: 1,
                            max: 100,
                        });
                    }
                    fields.quality = Some(quality);
                }
                KEY_TEMPLATE_VERSION => fields.tv = Some(value),
                other => match other.strip_prefix(VARIABLE_PREFIX) {
                    Some(name) if !name.is_empty() => {
                        fields.variables.insert(name.to_string(), value);
                    }
                    _ => return Err(ValidationError::UnknownParameter { name: key }),
                },
            }
        }

        fields.template_id = require(KEY_TEMPLATE_ID, template_id)?;
        fields.uid = require(KEY_UID, uid)?;
        fields.exp = exp.ok_or_else(|| ValidationError::MissingField {
            field: KEY_EXP.to_string(),
        })?;

        Ok((fields, signature))
    }
}

/// Build the canonical query string for a field set.
pub fn canonicalize(fields: &ImageRequestFields) -> String {
    let mut encoded: Vec<(String, String)> = fields
        .to_pairs()
        .into_iter()
        .map(|(k, v)| (encode(&k), encode(&v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn require(field: &str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField {
            field: field.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ValidationError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not a valid number", value),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> ImageRequestFields {
        let mut fields = ImageRequestFields::new("tmpl_1", "user_1", 1_900_000_000);
        fields.width = Some(1200);
        fields.height = Some(630);
        fields.format = Some(ImageFormat::Png);
        fields.variables.insert("title".to_string(), "Hello & welcome".to_string());
        fields.variables.insert("author".to_string(), "Zoë".to_string());
        fields
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_is_sorted_and_encoded() {
        let canonical = canonicalize(&sample());
        assert_eq!(
            canonical,
            "exp=1900000000&format=png&height=630&templateId=tmpl_1&uid=user_1\
             &v_author=Zo%C3%AB&v_title=Hello%20%26%20welcome&width=1200"
        );
    }

    #[test]
    fn test_parse_round_trips_through_canonical() -> Result<(), ValidationError> {
        let fields = sample();
        let mut query = fields.to_pairs();
        query.push(("sig".to_string(), "abc".to_string()));
        query.reverse();

        let (parsed, sig) = ImageRequestFields::from_query_pairs(query)?;
        assert_eq!(sig.as_deref(), Some("abc"));
        assert_eq!(parsed.canonical(), fields.canonical());
        assert_eq!(parsed.content_hash(), fields.content_hash());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_unknown_and_duplicate_keys() {
        let err = ImageRequestFields::from_query_pairs(pairs(&[
            ("templateId", "t"),
            ("uid", "u"),
            ("exp", "1"),
            ("color", "red"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownParameter {
                name: "color".to_string()
            }
        );

        let err = ImageRequestFields::from_query_pairs(pairs(&[
            ("templateId", "t"),
            ("templateId", "t2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateParameter { .. }));

        let err = ImageRequestFields::from_query_pairs(pairs(&[
            ("templateId", "t"),
            ("uid", "u"),
            ("exp", "1"),
            ("v_", "x"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownParameter { .. }));
    }

    #[test]
    fn test_parse_requires_fields() {
        let err =
            ImageRequestFields::from_query_pairs(pairs(&[("templateId", "t"), ("exp", "1")]))
                .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                field: "uid".to_string()
            }
        );

        let err = ImageRequestFields::from_query_pairs(pairs(&[
            ("templateId", "t"),
            ("uid", "u"),
            ("exp", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { .. }));
    }

    #[test]
    fn test_parse_validates_quality_and_format() {
        let base = [("templateId", "t"), ("uid", "u"), ("exp", "1")];

        let mut query = pairs(&base);
        query.push(("quality".to_string(), "0".to_string()));
        assert!(matches!(
            ImageRequestFields::from_query_pairs(query).unwrap_err(),
            ValidationError::OutOfRange { .. }
        ));

        let mut query = pairs(&base);
        query.push(("format".to_string(), "bmp".to_string()));
        assert!(matches!(
            ImageRequestFields::from_query_pairs(query).unwrap_err(),
            ValidationError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_expiry_is_absolute() {
        let fields = ImageRequestFields::new("t", "u", 1000);
        assert!(fields.is_expired(1000));
        assert!(fields.is_expired(2000));
        assert!(!fields.is_expired(999));
    }

    proptest! {
        #[test]
        fn prop_canonical_independent_of_variable_order(
            vars in proptest::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 0..8),
            seed in any::<u64>(),
        ) {
            let mut fields = ImageRequestFields::new("t", "u", 42);
            fields.variables = vars;
            let canonical = fields.canonical();

            let mut shuffled = fields.to_pairs();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((seed.wrapping_mul(i as u64 + 7)) % len as u64) as usize;
                shuffled.swap(i, j);
            }
            let (parsed, _) = ImageRequestFields::from_query_pairs(shuffled)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(parsed.canonical(), canonical);
        }
    }
}
