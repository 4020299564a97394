use thiserror::Error;

/// Failures that abort the reconciliation of a single workload.
///
/// None of these are fatal to the process. The next scheduled check retries
/// from scratch, so stored digest state is never touched when one occurs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid image reference {image:?}: a tag is required")]
    InvalidReference { image: String },

    #[error("failed to fetch digest for {image}: {reason}")]
    DigestFetch { image: String, reason: String },

    #[error("registry authentication failed for {image}: {reason}")]
    Authentication { image: String, reason: String },
}

#[cfg(test)]
impl Error {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }
}
