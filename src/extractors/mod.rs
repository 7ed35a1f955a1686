//! Extractors: independent, capability-typed producers of [`RawFragment`]s.
//!
//! An extractor sees one [`PageHandle`] and returns its guesses about what
//! is on that page. Extractors never see each other's output and are never
//! authoritative; the fusion engine reconciles them. Anything that can look
//! at a page (a cloud table service, a layout model, a second text decoder)
//! plugs in by implementing [`Extractor`] and being registered in an
//! [`ExtractorSet`].
//!
//! ## Built-ins
//!
//! | Name | Capability | Source |
//! |------|------------|--------|
//! | `ruled-tables` | table | stroked ruling lines |
//! | `aligned-tables` | table | column-aligned text lines |
//! | `text-layer` | text | shown strings, grouped into lines |
//! | `embedded-images` | image | image XObjects |
//!
//! [`builtin_names`] is also the default precedence order.

pub mod image;
pub mod table;
pub mod text;

pub use self::image::EmbeddedImageExtractor;
pub use self::table::{AlignedTableExtractor, RuledTableExtractor};
pub use self::text::TextLayerExtractor;

use crate::error::ExtractorFailure;
use crate::fragment::{Capability, RawFragment};
use crate::pipeline::split::PageHandle;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const TEXT_LAYER: &str = "text-layer";
pub const RULED_TABLES: &str = "ruled-tables";
pub const ALIGNED_TABLES: &str = "aligned-tables";
pub const EMBEDDED_IMAGES: &str = "embedded-images";

/// Names of the built-in extractors, most trusted first.
pub fn builtin_names() -> &'static [&'static str] {
    &[RULED_TABLES, ALIGNED_TABLES, TEXT_LAYER, EMBEDDED_IMAGES]
}

/// A page → fragments function for one capability.
///
/// Implementations must be stateless with respect to pages: the pipeline
/// calls `extract` for many pages concurrently. Every fragment returned must
/// carry a payload matching [`Extractor::capability`]; the pipeline fills in
/// fragment ids, the source name and the page index.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use edgequake_pdf_extract::{
///     BoundingBox, Capability, Extractor, ExtractorFailure, PageHandle, RawFragment,
/// };
///
/// struct PageNumberStamp;
///
/// #[async_trait]
/// impl Extractor for PageNumberStamp {
///     fn name(&self) -> &str { "page-stamp" }
///     fn capability(&self) -> Capability { Capability::Text }
///     async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
///         let bbox = BoundingBox::new(0.0, 0.0, 50.0, 12.0);
///         Ok(vec![RawFragment::text(bbox, format!("p{}", page.page_number()), None, 0.6)])
///     }
/// }
/// ```
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Registered name; also the key used in the precedence list.
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Extract fragments from one page.
    ///
    /// A failure is scoped to this page and this extractor: the pipeline
    /// records it as a quality issue and carries on.
    async fn extract(&self, page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure>;
}

/// The registered extractors, in registration order.
#[derive(Clone, Default)]
pub struct ExtractorSet {
    extractors: Vec<Arc<dyn Extractor>>,
}

impl fmt::Debug for ExtractorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ExtractorSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in extractors, registered in [`builtin_names`] order.
    pub fn builtin() -> Self {
        Self::new()
            .with(RuledTableExtractor::default())
            .with(AlignedTableExtractor::default())
            .with(TextLayerExtractor::default())
            .with(EmbeddedImageExtractor::default())
    }

    /// Register an extractor. See [`ExtractorSet::register`].
    pub fn with(mut self, extractor: impl Extractor + 'static) -> Self {
        self.register(Arc::new(extractor));
        self
    }

    /// Register an extractor, replacing (in place) any extractor already
    /// registered under the same name. Returns the replaced extractor.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) -> Option<Arc<dyn Extractor>> {
        match self
            .extractors
            .iter()
            .position(|e| e.name() == extractor.name())
        {
            Some(i) => Some(std::mem::replace(&mut self.extractors[i], extractor)),
            None => {
                self.extractors.push(extractor);
                None
            }
        }
    }

    /// Remove an extractor by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Extractor>> {
        let i = self.extractors.iter().position(|e| e.name() == name)?;
        Some(self.extractors.remove(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extractor>> {
        self.extractors.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.extractors.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Does any registered extractor produce this capability?
    pub fn covers(&self, capability: Capability) -> bool {
        self.extractors.iter().any(|e| e.capability() == capability)
    }

    /// Rank every registered extractor: listed names by their position in
    /// `precedence`, unlisted ones after them in registration order.
    pub fn ranking(&self, precedence: &[String]) -> PrecedenceRanking {
        let mut ranks: HashMap<String, usize> = precedence
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        let mut next = precedence.len();
        for e in &self.extractors {
            if !ranks.contains_key(e.name()) {
                ranks.insert(e.name().to_string(), next);
                next += 1;
            }
        }
        PrecedenceRanking { ranks }
    }
}

/// Extractor name → precedence rank (0 = most trusted).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecedenceRanking {
    ranks: HashMap<String, usize>,
}

impl PrecedenceRanking {
    /// Rank of `extractor`. Unknown names sort after every known one.
    pub fn rank(&self, extractor: &str) -> usize {
        self.ranks.get(extractor).copied().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, Capability);

    #[async_trait]
    impl Extractor for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn capability(&self) -> Capability {
            self.1
        }
        async fn extract(&self, _page: &PageHandle) -> Result<Vec<RawFragment>, ExtractorFailure> {
            Ok(vec![])
        }
    }

    #[test]
    fn builtin_registration_order_matches_names() {
        let set = ExtractorSet::builtin();
        assert_eq!(set.names(), builtin_names().to_vec());
        assert!(set.covers(Capability::Text));
        assert!(set.covers(Capability::Table));
        assert!(set.covers(Capability::Image));
    }

    #[test]
    fn register_replaces_same_name_in_place() {
        let mut set = ExtractorSet::new()
            .with(Named("a", Capability::Text))
            .with(Named("b", Capability::Table));
        let old = set.register(Arc::new(Named("a", Capability::Image)));
        assert!(old.is_some());
        assert_eq!(set.names(), vec!["a", "b"]);
        assert_eq!(set.iter().next().unwrap().capability(), Capability::Image);
    }

    #[test]
    fn unlisted_extractors_rank_after_listed_in_registration_order() {
        let set = ExtractorSet::new()
            .with(Named("x", Capability::Text))
            .with(Named("b", Capability::Text))
            .with(Named("y", Capability::Text));
        let ranking = set.ranking(&["b".to_string(), "a".to_string()]);
        assert_eq!(ranking.rank("b"), 0);
        assert_eq!(ranking.rank("a"), 1);
        assert_eq!(ranking.rank("x"), 2);
        assert_eq!(ranking.rank("y"), 3);
        assert_eq!(ranking.rank("nope"), usize::MAX);
    }

    #[test]
    fn remove_by_name() {
        let mut set = ExtractorSet::builtin();
        assert!(set.remove(TEXT_LAYER).is_some());
        assert!(!set.covers(Capability::Text));
        assert!(set.remove(TEXT_LAYER).is_none());
    }
}
