#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tikcon_domain::{NormalizedEvent, ViewerId};
use tikcon_platform::RawNotification;
use tracing::debug;

use crate::dedup::{Confirmation, DedupConfig, DedupStore};

/// Per-session state turning raw notifications into confirmed events.
///
/// Holds the dedup store, the subscription markers and the like
/// accumulators. All of it is scoped to one stream session and must be
/// cleared when that session ends.
#[derive(Debug)]
pub struct Normalizer {
	dedup: DedupStore,
	subscribed: HashSet<ViewerId>,
	likes: HashMap<ViewerId, u64>,
}

impl Normalizer {
	pub fn new(cfg: DedupConfig) -> Self {
		Self {
			dedup: DedupStore::new(cfg),
			subscribed: HashSet::new(),
			likes: HashMap::new(),
		}
	}

	/// Returns the confirmed event for `raw`, or `None` when nothing new was confirmed.
	pub fn normalize(&mut self, raw: &RawNotification, now: Instant) -> Option<NormalizedEvent> {
		match raw {
			RawNotification::Gift(gift) => match self.dedup.confirm(gift, now) {
				Confirmation::Confirmed(count) => {
					metrics::counter!("tikcon_gift_occurrences_confirmed_total").increment(u64::from(count));
					Some(NormalizedEvent::gift(
						&gift.viewer,
						gift.gift_name.clone(),
						count,
						u64::from(gift.effective_repeat_count()),
					))
				}
				Confirmation::Rejected(reason) => {
					metrics::counter!("tikcon_gift_notifications_rejected_total").increment(1);
					debug!(
						viewer_id = %gift.viewer.id,
						gift = %gift.gift_name,
						repeat_count = gift.repeat_count,
						?reason,
						"gift notification rejected"
					);
					None
				}
			},

			RawNotification::Subscription { viewer } => {
				if !self.subscribed.insert(viewer.id.clone()) {
					debug!(viewer_id = %viewer.id, "repeat subscription ignored");
					return None;
				}
				Some(NormalizedEvent::subscription(viewer))
			}

			RawNotification::Like { viewer, like_count, .. } => {
				if *like_count == 0 {
					return None;
				}
				let total = self.likes.entry(viewer.id.clone()).or_insert(0);
				*total = total.saturating_add(u64::from(*like_count));
				Some(NormalizedEvent::likes(viewer, *like_count, *total))
			}

			RawNotification::Disconnected { .. } => None,
		}
	}

	pub fn likes_total(&self, viewer_id: &ViewerId) -> u64 {
		self.likes.get(viewer_id).copied().unwrap_or(0)
	}

	pub fn reset_likes(&mut self, viewer_id: &ViewerId) {
		self.likes.insert(viewer_id.clone(), 0);
	}

	pub fn dedup(&self) -> &DedupStore {
		&self.dedup
	}

	pub fn prune(&mut self, now: Instant) {
		self.dedup.prune(now);
	}

	/// Drop all per-session state.
	pub fn clear(&mut self) {
		self.dedup.clear();
		self.subscribed.clear();
		self.likes.clear();
	}
}
