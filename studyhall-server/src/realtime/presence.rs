use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::config::server::PresenceConfig;
use shared::models::PresenceStatus;
use tokio::time::Instant;
use uuid::Uuid;

/// What a recorded activity touch did to the user's derived status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    /// Activity recorded and the user just came online.
    CameOnline,
    /// Activity recorded; the user was already online.
    Refreshed,
    /// Within the throttle window; nothing recorded.
    Throttled,
}

#[derive(Debug)]
struct PresenceEntry {
    last_seen_wall: DateTime<Utc>,
    last_seen: Instant,
    last_recorded: Instant,
    offline_override: bool,
}

/// In-memory last-activity tracker. Status is derived on read:
/// online means the last recorded activity is inside the threshold.
/// Nothing here is persisted; consumers re-derive rather than
/// subscribe, except where a handler explicitly broadcasts a badge
/// update on a status flip.
#[derive(Debug)]
pub struct PresenceTracker {
    entries: Mutex<HashMap<Uuid, PresenceEntry>>,
    throttle: Duration,
    threshold: Duration,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            throttle: Duration::from_secs(config.touch_throttle_seconds),
            threshold: Duration::from_secs(config.online_threshold_seconds),
        }
    }

    /// Records client activity, throttled to once per throttle window
    /// of continued activity. A touch that brings an offline user back
    /// online always bypasses the throttle.
    pub fn touch(&self, user_id: Uuid) -> TouchOutcome {
        let now = Instant::now();
        let mut guard = self.entries.lock().expect("presence mutex poisoned");

        match guard.get_mut(&user_id) {
            Some(entry) => {
                let was_online =
                    !entry.offline_override && now.duration_since(entry.last_seen) < self.threshold;

                if was_online && now.duration_since(entry.last_recorded) < self.throttle {
                    return TouchOutcome::Throttled;
                }

                entry.last_seen = now;
                entry.last_seen_wall = Utc::now();
                entry.last_recorded = now;
                entry.offline_override = false;

                if was_online {
                    TouchOutcome::Refreshed
                } else {
                    TouchOutcome::CameOnline
                }
            }
            None => {
                guard.insert(
                    user_id,
                    PresenceEntry {
                        last_seen_wall: Utc::now(),
                        last_seen: now,
                        last_recorded: now,
                        offline_override: false,
                    },
                );
                TouchOutcome::CameOnline
            }
        }
    }

    /// Best-effort beacon on tab close: applies immediately,
    /// unthrottled. Returns whether the user actually went from online
    /// to offline, so callers broadcast real flips rather than every
    /// beacon.
    pub fn beacon_offline(&self, user_id: Uuid) -> bool {
        let mut guard = self.entries.lock().expect("presence mutex poisoned");
        match guard.get_mut(&user_id) {
            Some(entry) => {
                let was_online = !entry.offline_override
                    && entry.last_seen.elapsed() < self.threshold;
                entry.offline_override = true;
                entry.last_seen_wall = Utc::now();
                was_online
            }
            None => false,
        }
    }

    /// Derives the user's status at the moment of the call.
    #[must_use]
    pub fn status(&self, user_id: Uuid) -> PresenceStatus {
        let guard = self.entries.lock().expect("presence mutex poisoned");
        match guard.get(&user_id) {
            Some(entry)
                if !entry.offline_override
                    && entry.last_seen.elapsed() < self.threshold =>
            {
                PresenceStatus::Online
            }
            _ => PresenceStatus::Offline,
        }
    }

    /// Wall-clock last-seen for badge payloads; `None` for users never
    /// seen by this process.
    #[must_use]
    pub fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        let guard = self.entries.lock().expect("presence mutex poisoned");
        guard.get(&user_id).map(|entry| entry.last_seen_wall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::server::Config;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(&Config::with_defaults().presence)
    }

    #[tokio::test(start_paused = true)]
    async fn first_touch_comes_online() {
        let tracker = tracker();
        let user = Uuid::new_v4();

        assert_eq!(tracker.status(user), PresenceStatus::Offline);
        assert_eq!(tracker.touch(user), TouchOutcome::CameOnline);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn continued_activity_is_throttled() {
        let tracker = tracker();
        let user = Uuid::new_v4();

        assert_eq!(tracker.touch(user), TouchOutcome::CameOnline);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.touch(user), TouchOutcome::Throttled);
        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(tracker.touch(user), TouchOutcome::Refreshed);
    }

    #[tokio::test(start_paused = true)]
    async fn user_goes_offline_past_the_threshold() {
        let tracker = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user);
        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(tracker.status(user), PresenceStatus::Online);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.status(user), PresenceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn beacon_reports_a_flip_only_when_the_user_was_online() {
        let tracker = tracker();
        let user = Uuid::new_v4();

        // Never-tracked users and repeat beacons are no-ops.
        assert!(!tracker.beacon_offline(user));
        tracker.touch(user);
        assert!(tracker.beacon_offline(user));
        assert!(!tracker.beacon_offline(user));

        // Expiring past the threshold also means no flip to report.
        tracker.touch(user);
        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(!tracker.beacon_offline(user));
    }

    #[tokio::test(start_paused = true)]
    async fn beacon_overrides_the_threshold_immediately() {
        let tracker = tracker();
        let user = Uuid::new_v4();

        tracker.touch(user);
        tracker.beacon_offline(user);
        assert_eq!(tracker.status(user), PresenceStatus::Offline);

        // The next activity bypasses the throttle and comes back online.
        assert_eq!(tracker.touch(user), TouchOutcome::CameOnline);
        assert_eq!(tracker.status(user), PresenceStatus::Online);
    }
}
