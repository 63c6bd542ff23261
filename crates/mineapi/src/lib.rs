//! Mine API client and the injected provider capabilities (instance
//! metadata, compute control plane, external signer).

pub mod client;
pub mod compute;
pub mod metadata;
pub mod signer;
pub mod types;

pub use client::{DonationSource, HttpDonationSource, HttpMineApi, MineApi, SubmitOutcome};
pub use compute::{ComputeProvider, StaticComputeProvider};
pub use metadata::{ImdsMetadataProvider, MetadataProvider, StaticMetadata, WorkerIdentity};
pub use signer::{CommandSigner, SignedMessage, Signer};
pub use types::{
    ApiChallenge, ChallengeStatus, CryptoReceipt, DonationReceipt, RegistrationReceipt,
    SolutionReceipt, TermsAndConditions,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ApiErrorKind {
    /// Network-level failure or 5xx; worth retrying next tick.
    Transient,
    /// Definitive HTTP rejection.
    Http,
    Codec,
    Unsupported,
}

#[derive(Clone, Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transient, message)
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}
