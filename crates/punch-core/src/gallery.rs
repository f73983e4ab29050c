//! Embedding gallery and nearest-distance matching.

use crate::types::Embedding;
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Match threshold used by the interactive recognition loop.
pub const INTERACTIVE_MATCH_THRESHOLD: f32 = 0.45;
/// Slightly looser threshold used by one-shot lookups.
pub const ONE_SHOT_MATCH_THRESHOLD: f32 = 0.5;

/// An enrolled identity with every sample captured for it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone)]
struct GalleryEntry {
    name: String,
    embedding: Embedding,
}

/// Source of enrolled identities (the persistence collaborator).
pub trait GalleryProvider {
    type Error: std::error::Error;

    /// Every stored `(name, embedding)` pair, one row per enrollment sample.
    fn all_identities(&self) -> Result<Vec<(String, Vec<f32>)>, Self::Error>;
}

/// Immutable set of known embeddings, flattened one row per sample.
///
/// Every entry is a well-formed 128-dimensional vector; anything else is
/// dropped at construction and never matched.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

impl Gallery {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a gallery from raw rows, silently dropping malformed vectors.
    pub fn from_entries<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<f32>)>,
    {
        let mut dropped = 0usize;
        let entries: Vec<GalleryEntry> = rows
            .into_iter()
            .filter_map(|(name, values)| {
                let embedding = Embedding::new(values);
                if embedding.is_well_formed() {
                    Some(GalleryEntry { name, embedding })
                } else {
                    dropped += 1;
                    None
                }
            })
            .collect();

        if dropped > 0 {
            tracing::debug!(dropped, kept = entries.len(), "gallery: skipped malformed embeddings");
        }

        Self { entries }
    }

    pub fn from_identities(identities: Vec<Identity>) -> Self {
        Self::from_entries(identities.into_iter().flat_map(|identity| {
            let name = identity.name;
            identity
                .embeddings
                .into_iter()
                .map(move |e| (name.clone(), e.values))
        }))
    }

    /// Load every identity from a provider.
    pub fn load<P: GalleryProvider>(provider: &P) -> Result<Self, P::Error> {
        Ok(Self::from_entries(provider.all_identities()?))
    }

    /// Number of usable embedding rows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct identity names.
    pub fn identity_count(&self) -> usize {
        let mut names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names.len()
    }

    /// Distance from `probe` to every stored embedding, in gallery order.
    pub fn distances(&self, probe: &Embedding) -> Vec<(&str, f32)> {
        self.entries
            .iter()
            .map(|e| (e.name.as_str(), probe.euclidean_distance(&e.embedding)))
            .collect()
    }
}

/// Shared handle to the current gallery snapshot.
///
/// Readers clone the inner `Arc` and never observe a partially updated
/// gallery; enrollment builds a new gallery and swaps it in whole.
#[derive(Debug, Clone, Default)]
pub struct SharedGallery {
    inner: Arc<RwLock<Arc<Gallery>>>,
}

impl SharedGallery {
    pub fn new(gallery: Gallery) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(gallery))),
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<Gallery> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the snapshot. In-flight readers keep the old one.
    pub fn replace(&self, gallery: Gallery) {
        let next = Arc::new(gallery);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Outcome of matching one probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recognition {
    Known { name: String, distance: f32 },
    Unknown { best_distance: Option<f32> },
}

impl Recognition {
    pub fn name(&self) -> Option<&str> {
        match self {
            Recognition::Known { name, .. } => Some(name),
            Recognition::Unknown { .. } => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Recognition::Known { .. })
    }
}

/// Strategy for comparing a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> Recognition;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// The best distance must be strictly below `threshold` to count as a match.
/// On exact ties the first minimum in gallery order wins.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> Recognition {
        if gallery.is_empty() {
            return Recognition::Unknown { best_distance: None };
        }

        let mut best: Option<(&str, f32)> = None;
        for (name, distance) in gallery.distances(probe) {
            let is_better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((name, distance));
            }
        }

        match best {
            Some((name, distance)) if distance < threshold => Recognition::Known {
                name: name.to_string(),
                distance,
            },
            Some((_, distance)) => Recognition::Unknown {
                best_distance: Some(distance),
            },
            None => Recognition::Unknown { best_distance: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EMBEDDING_DIM;

    fn vector(fill: f32) -> Vec<f32> {
        vec![fill; EMBEDDING_DIM]
    }

    /// A vector at distance `d` from `vector(0.0)`: one component set to `d`.
    fn offset(d: f32) -> Vec<f32> {
        let mut v = vector(0.0);
        v[0] = d;
        v
    }

    #[test]
    fn test_gallery_filters_wrong_dimension() {
        let gallery = Gallery::from_entries(vec![
            ("alice".to_string(), vector(0.1)),
            ("bob".to_string(), vec![0.1; 64]),
        ]);
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.identity_count(), 1);
    }

    #[test]
    fn test_gallery_from_identities_flattens_samples() {
        let gallery = Gallery::from_identities(vec![
            Identity {
                name: "alice".into(),
                embeddings: vec![Embedding::new(vector(0.1)), Embedding::new(vector(0.2))],
            },
            Identity {
                name: "bob".into(),
                embeddings: vec![Embedding::new(vector(0.3)), Embedding::new(vec![1.0; 3])],
            },
        ]);
        assert_eq!(gallery.len(), 3);
        assert_eq!(gallery.identity_count(), 2);
    }

    #[test]
    fn test_distances_in_gallery_order() {
        let gallery = Gallery::from_entries(vec![
            ("a".to_string(), offset(0.3)),
            ("b".to_string(), offset(0.1)),
        ]);
        let probe = Embedding::new(vector(0.0));
        let distances = gallery.distances(&probe);
        assert_eq!(distances.len(), 2);
        assert_eq!(distances[0].0, "a");
        assert!((distances[0].1 - 0.3).abs() < 1e-6);
        assert!((distances[1].1 - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery_is_unknown() {
        let probe = Embedding::new(vector(0.0));
        let result = EuclideanMatcher.compare(&probe, &Gallery::empty(), 0.45);
        assert_eq!(result, Recognition::Unknown { best_distance: None });
    }

    #[test]
    fn test_matcher_picks_nearest_below_threshold() {
        let gallery = Gallery::from_entries(vec![
            ("decoy".to_string(), offset(0.4)),
            ("alice".to_string(), offset(0.2)),
            ("far".to_string(), offset(2.0)),
        ]);
        let probe = Embedding::new(vector(0.0));
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.45);
        assert_eq!(result.name(), Some("alice"));
    }

    #[test]
    fn test_matcher_above_threshold_is_unknown() {
        let gallery = Gallery::from_entries(vec![("alice".to_string(), offset(0.6))]);
        let probe = Embedding::new(vector(0.0));
        match EuclideanMatcher.compare(&probe, &gallery, 0.45) {
            Recognition::Unknown { best_distance: Some(d) } => assert!((d - 0.6).abs() < 1e-6),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let gallery = Gallery::from_entries(vec![("alice".to_string(), offset(0.5))]);
        let probe = Embedding::new(vector(0.0));
        assert!(!EuclideanMatcher.compare(&probe, &gallery, 0.5).is_known());
        assert!(EuclideanMatcher.compare(&probe, &gallery, 0.51).is_known());
    }

    #[test]
    fn test_matcher_tie_takes_first_in_order() {
        let gallery = Gallery::from_entries(vec![
            ("first".to_string(), offset(0.2)),
            ("second".to_string(), offset(0.2)),
        ]);
        let probe = Embedding::new(vector(0.0));
        assert_eq!(EuclideanMatcher.compare(&probe, &gallery, 0.45).name(), Some("first"));
    }

    #[test]
    fn test_shared_gallery_swap_keeps_old_snapshot() {
        let shared = SharedGallery::new(Gallery::from_entries(vec![("a".to_string(), vector(0.1))]));
        let before = shared.snapshot();
        shared.replace(Gallery::empty());
        assert_eq!(before.len(), 1);
        assert!(shared.snapshot().is_empty());
    }

    struct FixedProvider(Vec<(String, Vec<f32>)>);

    impl GalleryProvider for FixedProvider {
        type Error = std::io::Error;

        fn all_identities(&self) -> Result<Vec<(String, Vec<f32>)>, Self::Error> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_load_from_provider_filters() {
        let provider = FixedProvider(vec![
            ("alice".to_string(), vector(0.1)),
            ("alice".to_string(), vec![0.1; 127]),
        ]);
        let gallery = Gallery::load(&provider).unwrap();
        assert_eq!(gallery.len(), 1);
    }
}
