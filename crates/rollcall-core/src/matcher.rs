//! Descriptor matching against the enrolled gallery.
//!
//! Each query descriptor claims the closest enrolled face strictly under the
//! distance threshold. A claimed identity is excluded for the rest of the pass,
//! so one person never absorbs two detected faces and one face never counts twice.

use crate::types::{Descriptor, EnrolledFace, MatchResult, MatchedIdentity};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum L2 distance (exclusive) for two descriptors to be considered the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("no enrolled identities to match against")]
    NoEnrolledIdentities,
}

/// Strategy for resolving a batch of query descriptors against a gallery of enrolled faces.
pub trait Matcher {
    fn match_faces(
        &self,
        queries: &[Descriptor],
        gallery: &[EnrolledFace],
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-under-threshold matcher with ascending identity id as tie-break.
///
/// Results do not depend on gallery order.
#[derive(Debug, Clone, Copy)]
pub struct NearestMatcher {
    threshold: f32,
}

impl NearestMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for NearestMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for NearestMatcher {
    fn match_faces(
        &self,
        queries: &[Descriptor],
        gallery: &[EnrolledFace],
    ) -> Result<MatchResult, MatchError> {
        if queries.is_empty() {
            return Ok(MatchResult::default());
        }
        if gallery.is_empty() {
            return Err(MatchError::NoEnrolledIdentities);
        }

        let mut matched_ids: HashSet<&str> = HashSet::new();
        let mut matches = Vec::new();

        for (query_idx, query) in queries.iter().enumerate() {
            let mut best: Option<(&EnrolledFace, f32)> = None;

            for face in gallery {
                if matched_ids.contains(face.identity_id.as_str()) {
                    continue;
                }
                if face.descriptor.len() != query.len() {
                    continue;
                }
                let distance = query.euclidean_distance(&face.descriptor);
                // NaN fails this comparison and is never a candidate.
                if !(distance < self.threshold) {
                    continue;
                }
                let is_better = match best {
                    None => true,
                    Some((prev, prev_distance)) => {
                        distance < prev_distance
                            || (distance == prev_distance && face.identity_id < prev.identity_id)
                    }
                };
                if is_better {
                    best = Some((face, distance));
                }
            }

            match best {
                Some((face, distance)) => {
                    tracing::debug!(
                        query = query_idx,
                        identity_id = %face.identity_id,
                        distance,
                        "descriptor matched"
                    );
                    matched_ids.insert(face.identity_id.as_str());
                    matches.push(MatchedIdentity {
                        identity_id: face.identity_id.clone(),
                        name: face.name.clone(),
                        distance,
                    });
                }
                None => {
                    tracing::debug!(query = query_idx, "no enrolled face under threshold");
                }
            }
        }

        Ok(MatchResult { matches })
    }
}
