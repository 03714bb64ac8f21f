//! Descriptor registry: one active descriptor per enrolled identity.

use crate::store::{DescriptorStore, IdentityDirectory, StoreError};
use crate::types::{Descriptor, EnrolledFace};
use std::sync::Arc;
use thiserror::Error;

/// Descriptor length produced by the default extractor.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid descriptor: expected {expected} values, got {actual}")]
    InvalidDescriptor { expected: usize, actual: usize },
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("no identities enrolled, nothing to match against")]
    EmptyRegistry,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Registry<S> {
    store: Arc<S>,
    dimension: usize,
}

impl<S> Registry<S>
where
    S: DescriptorStore + IdentityDirectory,
{
    pub fn new(store: Arc<S>, dimension: usize) -> Self {
        Self { store, dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Check that a descriptor has the registry's fixed length and finite values.
    pub fn validate(&self, descriptor: &Descriptor) -> Result<(), RegistryError> {
        if descriptor.len() != self.dimension || descriptor.values.iter().any(|v| !v.is_finite()) {
            return Err(RegistryError::InvalidDescriptor {
                expected: self.dimension,
                actual: descriptor.len(),
            });
        }
        Ok(())
    }

    /// Enroll or re-enroll an identity. A later enrollment replaces the earlier vector.
    pub fn enroll(&self, identity_id: &str, descriptor: &Descriptor) -> Result<(), RegistryError> {
        self.validate(descriptor)?;
        if self.store.get_identity(identity_id)?.is_none() {
            return Err(RegistryError::UnknownIdentity(identity_id.to_string()));
        }
        self.store.upsert_descriptor(identity_id, descriptor)?;
        tracing::info!(identity_id, dim = descriptor.len(), "descriptor enrolled");
        Ok(())
    }

    /// Full identity → descriptor gallery for matching.
    ///
    /// Stored vectors enrolled under a different dimension are left out until re-enrolled.
    pub fn all_descriptors(&self) -> Result<Vec<EnrolledFace>, RegistryError> {
        let mut gallery = self.store.load_descriptors()?;
        gallery.retain(|face| {
            let fits = face.descriptor.len() == self.dimension;
            if !fits {
                tracing::warn!(
                    identity_id = %face.identity_id,
                    stored = face.descriptor.len(),
                    expected = self.dimension,
                    "skipping enrolled descriptor of stale dimension"
                );
            }
            fits
        });
        if gallery.is_empty() {
            return Err(RegistryError::EmptyRegistry);
        }
        Ok(gallery)
    }
}
