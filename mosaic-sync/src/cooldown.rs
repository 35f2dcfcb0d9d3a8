//! Per-client write admission.
//!
//! Each client session sits behind its own mutex so the
//! "check deadline, then set a new one" step is atomic per client: two
//! concurrent writes from the same client can never both be admitted.
//! The registry itself is read-mostly: lookups take the read lock and
//! only a client's first contact takes the write lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default minimum spacing between two accepted writes.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Outcome of [`CooldownTracker::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { remaining: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Admission fields of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSession {
    pub client_id: Uuid,
    pub last_accepted_write_at: Option<Instant>,
    pub cooldown_deadline: Option<Instant>,
    /// Exempt from the cooldown until cleared.
    pub bypass: bool,
}

impl ClientSession {
    fn new(client_id: Uuid) -> Self {
        Self {
            client_id,
            last_accepted_write_at: None,
            cooldown_deadline: None,
            bypass: false,
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.cooldown_deadline {
            Some(deadline) if now < deadline => Some(deadline - now),
            _ => None,
        }
    }
}

/// Tracks cooldown deadlines for every known client.
pub struct CooldownTracker {
    period: Duration,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<ClientSession>>>>,
}

impl CooldownTracker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn session_handle(&self, client_id: Uuid) -> Arc<Mutex<ClientSession>> {
        // Fast path: read lock
        if let Some(session) = self.sessions.read().get(&client_id) {
            return session.clone();
        }

        // Slow path: the entry API re-checks under the write lock
        self.sessions
            .write()
            .entry(client_id)
            .or_insert_with(|| Arc::new(Mutex::new(ClientSession::new(client_id))))
            .clone()
    }

    /// Admit a write at `now` if the client is not cooling down.
    ///
    /// Admission starts a new cooldown of one period. Bypassed sessions
    /// are always admitted and their deadline is left untouched.
    pub fn try_admit(&self, client_id: Uuid, now: Instant) -> Admission {
        self.try_admit_with(client_id, now, true)
    }

    /// Like [`try_admit`](Self::try_admit), but the session's bypass flag
    /// is only honored when `honor_bypass` is set. The caller decides this
    /// from the role of the current request, not the role that set the flag.
    pub fn try_admit_with(&self, client_id: Uuid, now: Instant, honor_bypass: bool) -> Admission {
        let handle = self.session_handle(client_id);
        let mut session = handle.lock();

        if honor_bypass && session.bypass {
            return Admission::Admitted;
        }

        if let Some(remaining) = session.remaining(now) {
            return Admission::Rejected { remaining };
        }

        session.last_accepted_write_at = Some(now);
        session.cooldown_deadline = Some(now + self.period);
        Admission::Admitted
    }

    /// Remaining cooldown at `now`, without admitting anything.
    pub fn remaining(&self, client_id: Uuid, now: Instant) -> Option<Duration> {
        let handle = self.sessions.read().get(&client_id).cloned()?;
        let session = handle.lock();
        if session.bypass {
            return None;
        }
        session.remaining(now)
    }

    /// Exempt the client from the cooldown until [`clear_bypass`](Self::clear_bypass).
    pub fn bypass(&self, client_id: Uuid) {
        self.session_handle(client_id).lock().bypass = true;
    }

    pub fn clear_bypass(&self, client_id: Uuid) {
        if let Some(handle) = self.sessions.read().get(&client_id) {
            handle.lock().bypass = false;
        }
    }

    pub fn is_bypassed(&self, client_id: Uuid) -> bool {
        self.sessions
            .read()
            .get(&client_id)
            .is_some_and(|handle| handle.lock().bypass)
    }

    /// Copy of the client's admission fields.
    pub fn session(&self, client_id: Uuid) -> Option<ClientSession> {
        self.sessions.read().get(&client_id).map(|handle| *handle.lock())
    }

    /// Drop the client's session (on disconnect).
    pub fn forget(&self, client_id: Uuid) -> bool {
        self.sessions.write().remove(&client_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_first_write_admitted() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        assert_eq!(tracker.try_admit(client, t0), Admission::Admitted);

        let session = tracker.session(client).unwrap();
        assert_eq!(session.last_accepted_write_at, Some(t0));
        assert_eq!(session.cooldown_deadline, Some(t0 + secs(10)));
    }

    #[test]
    fn test_second_write_rejected_with_remaining() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        tracker.try_admit(client, t0);
        assert_eq!(
            tracker.try_admit(client, t0 + secs(1)),
            Admission::Rejected { remaining: secs(9) }
        );
        // Rejection does not push the deadline out
        assert_eq!(tracker.session(client).unwrap().cooldown_deadline, Some(t0 + secs(10)));
    }

    #[test]
    fn test_admitted_exactly_at_deadline() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        tracker.try_admit(client, t0);
        assert!(tracker.try_admit(client, t0 + secs(10)).is_admitted());
        assert_eq!(tracker.remaining(client, t0 + secs(12)), Some(secs(8)));
    }

    #[test]
    fn test_clients_are_independent() {
        let tracker = CooldownTracker::default();
        let t0 = Instant::now();
        assert!(tracker.try_admit(Uuid::new_v4(), t0).is_admitted());
        assert!(tracker.try_admit(Uuid::new_v4(), t0).is_admitted());
        assert_eq!(tracker.session_count(), 2);
    }

    #[test]
    fn test_bypass_skips_cooldown_without_touching_deadline() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        tracker.try_admit(client, t0);
        tracker.bypass(client);
        assert!(tracker.is_bypassed(client));
        assert!(tracker.try_admit(client, t0 + secs(1)).is_admitted());
        assert!(tracker.try_admit(client, t0 + secs(2)).is_admitted());
        assert_eq!(tracker.remaining(client, t0 + secs(2)), None);
        assert_eq!(tracker.session(client).unwrap().cooldown_deadline, Some(t0 + secs(10)));

        tracker.clear_bypass(client);
        assert!(!tracker.is_bypassed(client));
        assert_eq!(
            tracker.try_admit(client, t0 + secs(3)),
            Admission::Rejected { remaining: secs(7) }
        );
    }

    #[test]
    fn test_bypass_ignored_when_not_honored() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        tracker.bypass(client);
        assert!(tracker.try_admit_with(client, t0, false).is_admitted());
        assert_eq!(
            tracker.try_admit_with(client, t0 + secs(1), false),
            Admission::Rejected { remaining: secs(9) }
        );
        // The flag itself survives for a caller that may use it
        assert!(tracker.try_admit_with(client, t0 + secs(2), true).is_admitted());
    }

    #[test]
    fn test_forget_resets_session() {
        let tracker = CooldownTracker::default();
        let client = Uuid::new_v4();
        let t0 = Instant::now();

        tracker.try_admit(client, t0);
        assert!(tracker.forget(client));
        assert!(tracker.session(client).is_none());
        assert!(tracker.try_admit(client, t0 + secs(1)).is_admitted());
        assert!(!tracker.forget(Uuid::new_v4()));
    }

    #[test]
    fn test_concurrent_attempts_admit_exactly_one() {
        let tracker = Arc::new(CooldownTracker::default());
        let client = Uuid::new_v4();
        let now = Instant::now();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    tracker.try_admit(client, now).is_admitted()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
