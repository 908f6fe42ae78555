//! Certificate issuance seam.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::JoinError;
use crate::messages::{ClientInit, JoinResult};

/// A validated join, ready for credentials.
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    /// The node's request, already accepted by its verifier.
    pub init: &'a ClientInit,
    /// Expiry for every issued certificate, already checked against policy.
    pub not_after: SystemTime,
}

/// Issues the credentials a node receives in `Result`.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Issue certificates and assign a host ID. Failures should be
    /// [`JoinError::Issuance`].
    async fn issue(&self, req: &IssueRequest<'_>) -> Result<JoinResult, JoinError>;
}
