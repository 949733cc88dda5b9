//! Web font resolution: discover, merge, fetch, cache.

pub mod discover;
pub mod face;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;

use htmlshot_core::{FontAsset, FontSpec};

use crate::error::FontError;
pub use discover::{discover, merge};
use face::{parse_font_faces, select_faces, FontFace};

/// Default web-font CSS endpoint.
pub const DEFAULT_FONT_ENDPOINT: &str = "https://fonts.googleapis.com/css2";

/// The endpoint serves woff2/ttf URLs only to browsers it recognises.
pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Source of font binaries for a render.
#[async_trait]
pub trait FontSource: Send + Sync {
    /// Resolve the fonts a document needs. `explicit` specs come from the
    /// caller; the rest are discovered from `html` and `css`. `text` is the
    /// rendered text, used to subset downloads.
    async fn resolve(
        &self,
        explicit: &[FontSpec],
        html: &str,
        css: &str,
        text: &str,
    ) -> Result<Arc<Vec<FontAsset>>, FontError>;
}

#[derive(Debug, Clone)]
pub struct FontResolverConfig {
    pub endpoint: String,
    pub max_families: usize,
    /// Maximum distinct characters sent as the `text` subset.
    pub subset_cap: usize,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for FontResolverConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_FONT_ENDPOINT.to_string(),
            max_families: 4,
            subset_cap: 200,
            request_timeout: Duration::from_secs(5),
            user_agent: DESKTOP_USER_AGENT.to_string(),
        }
    }
}

/// Fetches web fonts and caches them for the life of the resolver.
///
/// Concurrent cold requests for the same spec set are not coalesced; each
/// fetches independently and the last insert wins. Results are identical.
pub struct FontResolver {
    client: reqwest::Client,
    config: FontResolverConfig,
    cache: DashMap<String, Arc<Vec<FontAsset>>>,
}

impl FontResolver {
    pub fn new(config: FontResolverConfig) -> Result<Self, FontError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FontError::Request {
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            config,
            cache: DashMap::new(),
        })
    }

    pub fn config(&self) -> &FontResolverConfig {
        &self.config
    }

    /// Number of cached spec sets.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Discover and merge the specs a document needs.
    pub fn plan(&self, explicit: &[FontSpec], html: &str, css: &str) -> Vec<FontSpec> {
        let discovered = discover(html, css, &self.config.endpoint);
        merge(explicit, &discovered, self.config.max_families)
    }

    /// Fetch binaries for `specs`, subset to `text`.
    ///
    /// Tries one combined request first. If that fails outright, falls back
    /// to one request per spec and returns whatever succeeded; only errors
    /// when every spec fails. Individual binary download failures are
    /// dropped.
    pub async fn fetch(
        &self,
        specs: &[FontSpec],
        text: &str,
    ) -> Result<Arc<Vec<FontAsset>>, FontError> {
        if specs.is_empty() {
            return Ok(Arc::new(Vec::new()));
        }

        let subset = subset_text(text, self.config.subset_cap);
        let key = cache_key(specs, &subset);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(key = %key, "font cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        let assets = match self.fetch_combined(specs, &subset).await {
            Ok(assets) => assets,
            Err(err) => {
                tracing::warn!(error = %err, specs = specs.len(), "combined font request failed, retrying per family");
                self.fetch_individually(specs, &subset).await?
            }
        };

        let assets = Arc::new(assets);
        if !assets.is_empty() {
            self.cache.insert(key, Arc::clone(&assets));
        }
        tracing::info!(families = specs.len(), faces = assets.len(), "fonts resolved");
        Ok(assets)
    }

    async fn fetch_combined(
        &self,
        specs: &[FontSpec],
        subset: &str,
    ) -> Result<Vec<FontAsset>, FontError> {
        let css = self.fetch_css(specs, subset).await?;
        let faces = select_faces(parse_font_faces(&css));
        if faces.is_empty() {
            return Err(FontError::NoFaces);
        }
        Ok(self.download(faces).await)
    }

    async fn fetch_individually(
        &self,
        specs: &[FontSpec],
        subset: &str,
    ) -> Result<Vec<FontAsset>, FontError> {
        let results = join_all(
            specs
                .iter()
                .map(|spec| self.fetch_combined(std::slice::from_ref(spec), subset)),
        )
        .await;

        let mut assets = Vec::new();
        let mut failures = 0;
        for (spec, result) in specs.iter().zip(results) {
            match result {
                Ok(mut faces) => assets.append(&mut faces),
                Err(err) => {
                    failures += 1;
                    tracing::warn!(family = %spec.family, error = %err, "font family failed to resolve");
                }
            }
        }

        if failures == specs.len() {
            return Err(FontError::AllFailed { count: failures });
        }
        Ok(assets)
    }

    async fn fetch_css(&self, specs: &[FontSpec], subset: &str) -> Result<String, FontError> {
        let url = css_url(&self.config.endpoint, specs, subset);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }

    async fn download(&self, faces: Vec<FontFace>) -> Vec<FontAsset> {
        let downloads = faces.iter().map(|face| async move {
            let bytes = self
                .client
                .get(&face.url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            Ok::<_, reqwest::Error>(bytes)
        });
        let results = join_all(downloads).await;

        faces
            .into_iter()
            .zip(results)
            .filter_map(|(face, result)| match result {
                Ok(bytes) => Some(FontAsset {
                    family: face.family,
                    weight: face.weight,
                    style: face.style,
                    data: bytes.to_vec(),
                }),
                Err(err) => {
                    tracing::warn!(url = %face.url, error = %err, "font download failed");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl FontSource for FontResolver {
    async fn resolve(
        &self,
        explicit: &[FontSpec],
        html: &str,
        css: &str,
        text: &str,
    ) -> Result<Arc<Vec<FontAsset>>, FontError> {
        let specs = self.plan(explicit, html, css);
        self.fetch(&specs, text).await
    }
}

/// Deduplicated, sorted, length-capped character set of `text`.
pub fn subset_text(text: &str, cap: usize) -> String {
    text.chars()
        .filter(|c| !c.is_control())
        .collect::<BTreeSet<char>>()
        .into_iter()
        .take(cap)
        .collect()
}

/// Cache key: sorted spec set plus subset.
pub fn cache_key(specs: &[FontSpec], subset: &str) -> String {
    let mut parts: Vec<String> = specs.iter().map(FontSpec::query_value).collect();
    parts.sort();
    format!("{}#{}", parts.join("|"), subset)
}

/// Combined CSS request URL for `specs`.
pub fn css_url(endpoint: &str, specs: &[FontSpec], subset: &str) -> String {
    let mut url = String::from(endpoint);
    let mut separator = if endpoint.contains('?') { '&' } else { '?' };
    for spec in specs {
        url.push(separator);
        url.push_str("family=");
        url.push_str(&spec.query_value());
        separator = '&';
    }
    if !subset.is_empty() {
        url.push(separator);
        url.push_str("text=");
        url.push_str(&urlencoding::encode(subset));
        separator = '&';
    }
    url.push(separator);
    url.push_str("display=swap");
    url
}
