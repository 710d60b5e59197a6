//! Nearest-neighbour matching of a query descriptor against registered identities.

use crate::types::{Descriptor, GalleryEntry, IdentityId};

/// Default maximum Euclidean distance for two descriptors to be the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Result of matching a query descriptor against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest candidate, or `None` when the gallery was empty.
    pub distance: Option<f32>,
    /// ID of the accepted candidate (only when `matched`).
    pub identity_id: Option<IdentityId>,
}

impl MatchResult {
    fn no_match(distance: Option<f32>) -> Self {
        Self {
            matched: false,
            distance,
            identity_id: None,
        }
    }
}

/// Strategy for comparing a query descriptor against the registered gallery.
///
/// Implementations must be pure: no state is read or written beyond the arguments.
pub trait Matcher: Send + Sync {
    fn compare(&self, query: &Descriptor, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Linear-scan Euclidean matcher.
///
/// Selects the candidate with strictly minimum distance. Ties go to the
/// candidate that appears first in the gallery, i.e. the earliest inserted
/// identity when the gallery comes from the store. That tie-break is a
/// policy choice, not something correctness depends on.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Descriptor, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, candidate) in gallery.iter().enumerate() {
            let distance = query.euclidean_distance(&candidate.descriptor);
            let closer = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if closer {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance <= threshold => MatchResult {
                matched: true,
                distance: Some(distance),
                identity_id: Some(gallery[idx].id),
            },
            Some((_, distance)) => MatchResult::no_match(Some(distance)),
            None => MatchResult::no_match(None),
        }
    }
}
