//! Azure management-plane access.
//!
//! [`TokenProvider`] is the credential seam: the engine never reads
//! secrets directly when talking to Azure. [`ArmClient`] adds the bearer
//! token and maps HTTP failures onto [`crate::error::UpstreamError`].

mod auth;
mod client;

pub use auth::{
    ClientCredentialsProvider, ServicePrincipal, StaticTokenProvider, TokenProvider,
    DEFAULT_AUTHORITY_URL, MANAGEMENT_SCOPE, REFRESH_SKEW_SECS,
};
pub use client::{ArmClient, ARM_BASE_URL};
