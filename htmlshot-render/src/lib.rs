//! htmlshot Render - HTML to Compositor Pipeline
//!
//! Sanitizes untrusted HTML into the compositor's node tree, resolves the web
//! fonts it references and drives the external compositor through a
//! recovery cascade under a timeout.

pub mod compositor;
pub mod error;
pub mod executor;
pub mod fonts;
pub mod sanitize;

pub use compositor::{parse_failure, CommandCompositor, CompositeRequest, Compositor};
pub use error::{classify_message, CompositorError, FailureKind, FontError};
pub use executor::{
    AttemptOutcome, ExecutorConfig, NoopObserver, RenderExecutor, RenderObserver, Stage, CASCADE,
};
pub use fonts::{FontResolver, FontResolverConfig, FontSource, DEFAULT_FONT_ENDPOINT};
pub use sanitize::{
    collect_text, sanitize, DropReason, RenderChild, RenderNode, SanitizeMode, SanitizeReport,
    Sanitized,
};
