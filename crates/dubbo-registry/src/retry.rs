//! Retried registry calls

use crate::url::{CATEGORY_KEY, CONSUMERS_CATEGORY, ServiceUrl};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Upper bound on the delay between two attempts
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(12);

/// A registry-affecting call that is retried until it succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    /// Register a provider URL
    Register(ServiceUrl),
    /// Unregister a provider URL
    Unregister(ServiceUrl),
    /// Register the consumer URL, then subscribe to its categories
    Subscribe(ServiceUrl),
    /// Unregister the consumer URL, then unsubscribe
    Unsubscribe(ServiceUrl),
}

impl RegistryCall {
    /// URL the call is about
    pub fn url(&self) -> &ServiceUrl {
        match self {
            Self::Register(url)
            | Self::Unregister(url)
            | Self::Subscribe(url)
            | Self::Unsubscribe(url) => url,
        }
    }

    /// Service key of the URL, empty when it has none
    pub fn service_key(&self) -> String {
        self.url().service_key().unwrap_or_default()
    }

    /// Slot this call competes in; a newer call supersedes older ones
    pub fn slot(&self) -> RetrySlot {
        let side = match self {
            Self::Register(_) | Self::Unregister(_) => CallSide::Provider,
            Self::Subscribe(_) | Self::Unsubscribe(_) => CallSide::Consumer,
        };
        (self.service_key(), side)
    }

    /// Consumer-category form of a subscription URL
    pub fn consumer_url(url: &ServiceUrl) -> ServiceUrl {
        url.with_parameter(CATEGORY_KEY, CONSUMERS_CATEGORY)
    }
}

impl fmt::Display for RegistryCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Register(_) => "register",
            Self::Unregister(_) => "unregister",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        };
        write!(f, "{verb} {}", self.service_key())
    }
}

/// Which half of a service a call touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallSide {
    /// Register / unregister of a provider URL
    Provider,
    /// Subscribe / unsubscribe of a consumer URL
    Consumer,
}

/// Service key plus side; at most one live retry per slot
pub type RetrySlot = (String, CallSide);

/// Cancellation flag shared between a retry and its owner
#[derive(Debug, Clone, Default)]
pub struct RetryToken(Arc<AtomicBool>);

impl RetryToken {
    /// Stop the retry before its next attempt
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`RetryToken::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both tokens belong to the same retry
    pub fn same(&self, other: &RetryToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Attempt counter and cancellation flag for one [`RegistryCall`]
#[derive(Debug, Clone)]
pub struct RetryState {
    /// The call being retried
    pub call: RegistryCall,
    /// Attempts made so far
    pub attempt: u32,
    period: Duration,
    token: RetryToken,
}

impl RetryState {
    /// Fresh state; the first attempt is number 1
    pub fn new(call: RegistryCall, period: Duration) -> Self {
        Self {
            call,
            attempt: 1,
            period,
            token: RetryToken::default(),
        }
    }

    /// Token that cancels this retry
    pub fn token(&self) -> &RetryToken {
        &self.token
    }

    /// Whether the owner gave up on this call
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Delay before the next attempt: `attempt * period`, capped
    pub fn next_delay(&self) -> Duration {
        self.period
            .saturating_mul(self.attempt)
            .min(MAX_RETRY_DELAY)
    }

    /// Move on to the next attempt
    pub fn advance(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }
}
