//! Filter policy deciding which notifications are forwarded.
//!
//! The decision is a pure function of the event and the current
//! [`ForwardingConfig`], so it is safe to call from any number of concurrent
//! capture invocations.

use crate::config::ForwardingConfig;
use crate::types::NotificationEvent;

/// Outcome of [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    Reject,
}

impl FilterDecision {
    #[must_use]
    pub fn is_accept(self) -> bool {
        self == Self::Accept
    }
}

/// Decides whether `event` is forwarded.
///
/// With `forward_all_apps` every event is accepted. Otherwise the event's
/// source package must appear in `filter_packages` (exact, case-sensitive).
///
/// ```
/// use notirelay_agent::config::{ForwardingConfig, PackageFilter};
/// use notirelay_agent::filter::{decide, FilterDecision};
/// use notirelay_agent::types::NotificationEvent;
///
/// let mut config = ForwardingConfig::new("https://api.example.com/hook");
/// config.filter_packages = PackageFilter::parse("com.a, com.b");
///
/// let event = NotificationEvent::new("com.c", "title", "body");
/// assert_eq!(decide(&event, &config), FilterDecision::Reject);
///
/// config.forward_all_apps = true;
/// assert_eq!(decide(&event, &config), FilterDecision::Accept);
/// ```
#[must_use]
pub fn decide(event: &NotificationEvent, config: &ForwardingConfig) -> FilterDecision {
    if config.forward_all_apps || config.filter_packages.contains(&event.source_package) {
        FilterDecision::Accept
    } else {
        FilterDecision::Reject
    }
}
