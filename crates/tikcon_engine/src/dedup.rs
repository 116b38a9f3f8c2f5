#![forbid(unsafe_code)]

//! Gift deduplication and combo aggregation.
//!
//! Combo gifts are reported as a stream of cumulative `repeat_count` values
//! that may be duplicated, re-emitted or reordered. [`DedupStore::confirm`]
//! turns each notification into the number of newly confirmed occurrences so
//! that every logical occurrence is confirmed at most once.
//!
//! Time is always passed in explicitly; nothing here spawns timers. Expired
//! entries are dropped by [`DedupStore::prune`], which the owning session
//! calls on an interval.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tikcon_domain::ViewerId;
use tikcon_platform::GiftNotification;

use crate::config::TimingConfig;

/// Set of keys that expire a fixed TTL after insertion.
#[derive(Debug)]
pub struct ExpiringSet<K> {
	ttl: Duration,
	expires_at: HashMap<K, Instant>,
}

impl<K: Eq + Hash> ExpiringSet<K> {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			expires_at: HashMap::new(),
		}
	}

	pub fn insert(&mut self, key: K, now: Instant) {
		self.expires_at.insert(key, now + self.ttl);
	}

	/// Whether `key` was inserted and has not yet expired at `now`.
	pub fn contains(&self, key: &K, now: Instant) -> bool {
		self.expires_at.get(key).is_some_and(|exp| now < *exp)
	}

	/// Drop expired keys; returns how many were removed.
	pub fn prune(&mut self, now: Instant) -> usize {
		let before = self.expires_at.len();
		self.expires_at.retain(|_, exp| now < *exp);
		before - self.expires_at.len()
	}

	pub fn len(&self) -> usize {
		self.expires_at.len()
	}

	pub fn is_empty(&self) -> bool {
		self.expires_at.is_empty()
	}

	pub fn clear(&mut self) {
		self.expires_at.clear();
	}
}

/// Key identifying one exact upstream delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
	pub viewer_id: ViewerId,
	pub gift_id: u64,
	pub repeat_count: u32,
	pub message_id: Option<String>,
}

impl IdempotencyKey {
	pub fn of(gift: &GiftNotification) -> Self {
		Self {
			viewer_id: gift.viewer.id.clone(),
			gift_id: gift.gift_id,
			repeat_count: gift.effective_repeat_count(),
			message_id: gift.message_id.clone(),
		}
	}
}

/// Per viewer+gift combo tracking key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComboKey {
	pub viewer_id: ViewerId,
	pub gift_name: String,
}

impl ComboKey {
	pub fn new(viewer_id: &ViewerId, gift_name: &str) -> Self {
		Self {
			viewer_id: viewer_id.clone(),
			gift_name: gift_name.to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComboState {
	/// Non-decreasing within one combo session.
	pub last_confirmed_count: u32,
	pub last_confirmed_at: Instant,
	pub last_seen_at: Instant,
}

impl ComboState {
	fn started(count: u32, now: Instant) -> Self {
		Self {
			last_confirmed_count: count,
			last_confirmed_at: now,
			last_seen_at: now,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
	/// Exact re-delivery inside the idempotency TTL.
	Redelivery,
	/// Same cumulative count seen again outside the jitter window.
	DuplicateCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
	/// Number of newly confirmed occurrences (always at least 1).
	Confirmed(u32),
	Rejected(RejectReason),
}

impl Confirmation {
	pub fn count(self) -> Option<u32> {
		match self {
			Confirmation::Confirmed(n) => Some(n),
			Confirmation::Rejected(_) => None,
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
	pub combo_timeout: Duration,
	pub jitter_window: Duration,
	pub idempotency_ttl: Duration,
}

impl Default for DedupConfig {
	fn default() -> Self {
		Self::from(&TimingConfig::default())
	}
}

impl From<&TimingConfig> for DedupConfig {
	fn from(t: &TimingConfig) -> Self {
		Self {
			combo_timeout: t.combo_timeout(),
			jitter_window: t.jitter_window(),
			idempotency_ttl: t.idempotency_ttl(),
		}
	}
}

#[derive(Debug)]
pub struct DedupStore {
	cfg: DedupConfig,
	combos: HashMap<ComboKey, ComboState>,
	seen: ExpiringSet<IdempotencyKey>,
}

impl DedupStore {
	pub fn new(cfg: DedupConfig) -> Self {
		Self {
			cfg,
			combos: HashMap::new(),
			seen: ExpiringSet::new(cfg.idempotency_ttl),
		}
	}

	/// Decide how many occurrences `gift` newly confirms.
	pub fn confirm(&mut self, gift: &GiftNotification, now: Instant) -> Confirmation {
		let idem = IdempotencyKey::of(gift);
		if self.seen.contains(&idem, now) {
			return Confirmation::Rejected(RejectReason::Redelivery);
		}

		let key = ComboKey::new(&gift.viewer.id, &gift.gift_name);
		let outcome = if gift.combo {
			self.confirm_combo(&key, gift.effective_repeat_count(), now)
		} else {
			self.combos.remove(&key);
			Confirmation::Confirmed(1)
		};

		if gift.repeat_end {
			self.combos.remove(&key);
		}

		if let Confirmation::Confirmed(_) = outcome {
			self.seen.insert(idem, now);
		}
		outcome
	}

	fn confirm_combo(&mut self, key: &ComboKey, count: u32, now: Instant) -> Confirmation {
		if let Some(state) = self.combos.get(key)
			&& now.saturating_duration_since(state.last_seen_at) > self.cfg.combo_timeout
		{
			self.combos.remove(key);
		}

		let Some(state) = self.combos.get_mut(key) else {
			self.combos.insert(key.clone(), ComboState::started(count, now));
			return Confirmation::Confirmed(count);
		};

		state.last_seen_at = now;
		let since_confirmed = now.saturating_duration_since(state.last_confirmed_at);

		match count.cmp(&state.last_confirmed_count) {
			std::cmp::Ordering::Greater => {
				let delta = count - state.last_confirmed_count;
				state.last_confirmed_count = count;
				state.last_confirmed_at = now;
				Confirmation::Confirmed(delta)
			}
			std::cmp::Ordering::Equal if since_confirmed < self.cfg.jitter_window => {
				// Upstream re-emits the same cumulative count for a distinct step.
				state.last_confirmed_at = now;
				Confirmation::Confirmed(1)
			}
			std::cmp::Ordering::Equal if count == 1 => {
				*state = ComboState::started(1, now);
				Confirmation::Confirmed(1)
			}
			std::cmp::Ordering::Equal => Confirmation::Rejected(RejectReason::DuplicateCount),
			std::cmp::Ordering::Less => {
				*state = ComboState::started(count, now);
				Confirmation::Confirmed(count)
			}
		}
	}

	pub fn combo_state(&self, viewer_id: &ViewerId, gift_name: &str) -> Option<&ComboState> {
		self.combos.get(&ComboKey::new(viewer_id, gift_name))
	}

	pub fn combo_len(&self) -> usize {
		self.combos.len()
	}

	pub fn seen_len(&self) -> usize {
		self.seen.len()
	}

	/// Drop stale combos and expired idempotency keys.
	pub fn prune(&mut self, now: Instant) {
		let timeout = self.cfg.combo_timeout;
		self.combos
			.retain(|_, st| now.saturating_duration_since(st.last_seen_at) <= timeout);
		self.seen.prune(now);
	}

	pub fn clear(&mut self) {
		self.combos.clear();
		self.seen.clear();
	}
}
