//! Delegated token lifecycle for a confidential client
//!
//! Verifies inbound user tokens, keeps a per-user token cache fresh through
//! silent refresh, runs authorization-code logins, and exchanges the user's
//! access token on-behalf-of downstream resources. Every failure a caller
//! can act on folds into a [`TokenOutcome`].

mod broker;
pub mod error;
pub mod locks;
pub mod login;
pub mod metrics;
pub mod obo;
pub mod outcome;
pub mod refresh;

#[cfg(test)]
mod testsupport;

pub use broker::TokenBroker;
pub use error::{BrokerError, Result};
pub use locks::UserLocks;
pub use login::{LOGIN_FLOW_EXPIRY, LoginFlows, MAX_PENDING_LOGINS, PendingFlow};
pub use obo::OboExchanger;
pub use outcome::{
    AuthenticatedUser, InboundTokens, LoginRequest, LoginResult, TokenOutcome, TokenPair,
};
pub use refresh::{IdTokenCheck, Redeemed, Refresher};
