use std::collections::HashSet;

use signal_proto::PeerId;
use tracing::info;

/// Wildcard entry accepting offers from anyone.
pub const ALLOW_ALL: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    Accept,
    Reject,
}

/// Decides whether an incoming offer is answered. Evaluated exactly once per
/// offer, before any session state is touched.
pub trait OfferPolicy: Send + Sync {
    fn evaluate(&self, from: &PeerId) -> OfferDecision;
}

pub struct AcceptAll;

impl OfferPolicy for AcceptAll {
    fn evaluate(&self, _from: &PeerId) -> OfferDecision {
        OfferDecision::Accept
    }
}

pub struct RejectAll;

impl OfferPolicy for RejectAll {
    fn evaluate(&self, from: &PeerId) -> OfferDecision {
        info!(target: "peer_link::policy", %from, "offer declined");
        OfferDecision::Reject
    }
}

/// Accepts listed peers outright and defers everything else to `fallback`,
/// which stands in for asking a human.
pub struct AllowList {
    allowed: HashSet<String>,
    fallback: Box<dyn OfferPolicy>,
}

impl AllowList {
    pub fn new<I, S>(allowed: I, fallback: Box<dyn OfferPolicy>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            fallback,
        }
    }

    pub fn allows_everyone(&self) -> bool {
        self.allowed.contains(ALLOW_ALL)
    }
}

impl OfferPolicy for AllowList {
    fn evaluate(&self, from: &PeerId) -> OfferDecision {
        if self.allows_everyone() || self.allowed.contains(from.as_str()) {
            return OfferDecision::Accept;
        }
        self.fallback.evaluate(from)
    }
}
