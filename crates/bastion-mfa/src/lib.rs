//! # bastion-mfa
//!
//! MFA ceremony coordination for the Bastion gateway.
//!
//! A ceremony re-asserts the presence of the user behind a session before a
//! privileged action:
//!
//! ```text
//! CeremonyCoordinator::initiate
//!     │
//!     ├── ChallengeIssuer::create_challenge   (scope: current user)
//!     ├── MfaPrompt::prompt                   (may block on the user)
//!     └── Challenge::bind                     (one-shot, nonce + expiry)
//! ```
//!
//! Both collaborators are injected. Validating the assertion itself belongs
//! to whoever issued the challenge.

pub mod ceremony;
pub mod challenge;
pub mod error;
pub mod prompt;

pub use ceremony::CeremonyCoordinator;
pub use challenge::{
    Challenge, ChallengeIssuer, ChallengeResponse, ChallengeScope, LocalChallengeIssuer,
};
pub use error::{CeremonyStage, MfaError};
pub use prompt::{FnPrompt, MfaPrompt};
