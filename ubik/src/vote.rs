//! Beacon and vote state machine: sync-site election and the lease that
//! lets a site keep claiming sync between beacon rounds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::version::Version;

/// Base beacon cycle.
pub const R: Duration = Duration::from_secs(20);
/// A vote is valid for this long once granted.
pub const SMALLTIME: Duration = Duration::from_secs(60);
/// A peer silent for this long is presumed down for unlock-wait purposes.
pub const BIGTIME: Duration = Duration::from_secs(75);
/// Clock skew tolerance subtracted from vote-expiry checks.
pub const MAXSKEW: Duration = Duration::from_secs(10);
/// How often the beacon sender fires.
pub const POLLTIME: Duration = Duration::from_secs(15);
/// Span of a lowest-host nomination window for the vote-receiver tie-break.
pub const NOMINATION_WINDOW: Duration = R;

/// Per-peer bookkeeping a server descriptor carries. Connection handles
/// live in [`crate::quorum`], not here.
#[derive(Clone, Debug)]
pub struct PeerState {
    pub id: Uuid,
    pub up: bool,
    pub current_db: bool,
    pub beacon_since_down: bool,
    pub last_vote_yes: bool,
    pub last_vote_received: Option<Instant>,
    pub committed_version: Version,
}

impl PeerState {
    pub fn new(id: Uuid) -> Self {
        PeerState {
            id,
            up: false,
            current_db: false,
            beacon_since_down: false,
            last_vote_yes: false,
            last_vote_received: None,
            committed_version: Version::NEW,
        }
    }

    /// Whether this peer currently counts toward a quorum dispatch.
    pub fn eligible_for_dispatch(&self) -> bool {
        self.up && self.current_db
    }

    /// The extra check required before the *first* `DISK_Begin` of a new
    /// write transaction.
    pub fn eligible_for_first_begin(&self) -> bool {
        self.eligible_for_dispatch() && self.beacon_since_down && self.last_vote_yes
    }
}

/// Per-site vote state, mutated by the beacon sender and vote receiver
///.
pub struct VoteState {
    pub server_id: Uuid,
    pub last_yes_time: Option<Instant>,
    pub last_yes_host: Option<Uuid>,
    /// Start of the currently granted vote's span.
    pub last_yes_claim: Option<Instant>,
    /// Did the last candidate we voted for claim to already be sync site?
    pub last_yes_state: bool,
    pub lowest_host: Option<Uuid>,
    pub lowest_time: Option<Instant>,
    pub sync_host: Option<Uuid>,
    pub sync_time: Option<Instant>,
    pub sync_site_until: Option<Instant>,
    pub known_sync_version: Version,
    pub known_write_tid: Option<(u32, u32)>,
    pub peers: HashMap<Uuid, PeerState>,
    /// Set once a full beacon round-trip has echoed `last_yes_state = true`
    /// for us; only then may `DISK_Begin` be accepted locally.
    advertised: bool,
}

impl VoteState {
    pub fn new(server_id: Uuid, peer_ids: impl IntoIterator<Item = Uuid>) -> Self {
        VoteState {
            server_id,
            last_yes_time: None,
            last_yes_host: None,
            last_yes_claim: None,
            last_yes_state: false,
            lowest_host: None,
            lowest_time: None,
            sync_host: None,
            sync_time: None,
            sync_site_until: None,
            known_sync_version: Version::NEW,
            known_write_tid: None,
            peers: peer_ids.into_iter().map(|id| (id, PeerState::new(id))).collect(),
            advertised: false,
        }
    }

    /// `ubeacon_AmSyncSite()`: true while our own claimed lease hasn't
    /// expired.
    pub fn am_sync_site(&self, now: Instant) -> bool {
        self.sync_host == Some(self.server_id) && self.sync_site_until.map_or(false, |until| now <= until)
    }

    /// Whether this site may accept remote `DISK_Begin` calls yet.
    pub fn sync_site_advertised(&self) -> bool {
        self.advertised
    }

    /// Decides whether to grant a yes vote to `candidate` beaconing at `t`,
    /// per the vote-receiver rule: either no current claim, or the
    /// current claim's span has expired (net of skew), or it's a renewal
    /// from the same host.
    pub fn should_grant(&self, candidate: Uuid, t: Instant) -> bool {
        let timing_ok = match self.last_yes_claim {
            None => true,
            Some(claim) => t >= claim + SMALLTIME.saturating_sub(MAXSKEW) || Some(candidate) == self.last_yes_host,
        };
        timing_ok && self.lowest_host.map_or(true, |lowest| lowest == candidate)
    }

    /// Registers a beacon from `candidate` at `t` toward the lowest-host
    /// tie-break: starts a fresh nomination window if the current one has
    /// expired, then keeps the numerically lowest host seen within it.
    pub fn note_candidate(&mut self, candidate: Uuid, t: Instant) {
        let window_expired = self.lowest_time.map_or(true, |start| t.saturating_duration_since(start) > NOMINATION_WINDOW);
        if window_expired {
            self.lowest_host = Some(candidate);
            self.lowest_time = Some(t);
        } else if Some(candidate) < self.lowest_host {
            self.lowest_host = Some(candidate);
        }
    }

    /// Records a granted vote for `candidate` at `t`, claiming sync or not
    /// per the candidate's own beacon payload.
    pub fn grant(&mut self, candidate: Uuid, t: Instant, candidate_claims_sync: bool) {
        self.last_yes_time = Some(t);
        self.last_yes_host = Some(candidate);
        self.last_yes_claim = Some(t);
        self.last_yes_state = candidate_claims_sync;
    }

    /// Counts yes-votes (including our own) that have not yet expired past
    /// `now + MAXSKEW`, per the promotion rule.
    fn live_yes_count(&self, now: Instant) -> usize {
        let mut count = 1; // a site always votes for itself implicitly
        for peer in self.peers.values() {
            if peer.last_vote_yes {
                if let Some(received) = peer.last_vote_received {
                    if received + SMALLTIME > now + MAXSKEW {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// `quorum = floor(n/2) + 1` over the full membership including self.
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Attempts promotion to sync site; returns true if promoted (or
    /// already sync and the lease was renewed).
    pub fn try_promote(&mut self, now: Instant) -> bool {
        if self.live_yes_count(now) >= self.quorum_size() {
            self.sync_host = Some(self.server_id);
            self.sync_time = Some(now);
            self.sync_site_until = Some(now + SMALLTIME);
            true
        } else {
            false
        }
    }

    /// Marks this site's sync claim as advertised, once a beacon round-trip
    /// has echoed our claim back as accepted.
    pub fn mark_advertised(&mut self) {
        self.advertised = true;
    }

    /// Loses sync-site status immediately (quorum lost, or a higher-claim
    /// peer observed).
    pub fn demote(&mut self) {
        if self.sync_host == Some(self.server_id) {
            self.sync_host = None;
            self.sync_time = None;
            self.sync_site_until = None;
            self.advertised = false;
        }
    }

    /// Updates a peer's liveness after a successful beacon round-trip.
    pub fn peer_responded(&mut self, id: Uuid, now: Instant, granted_us: bool, version: Version) {
        if let Some(peer) = self.peers.get_mut(&id) {
            let was_down = !peer.up;
            peer.up = true;
            peer.current_db = version >= self.known_sync_version;
            peer.last_vote_yes = granted_us;
            peer.last_vote_received = Some(now);
            peer.committed_version = version;
            if was_down {
                peer.beacon_since_down = granted_us;
            } else if granted_us {
                peer.beacon_since_down = true;
            }
        }
    }

    /// Marks a peer down after an RPC failure; also schedules the peer for
    /// a recovery sweep by simply clearing `current_db`, which recovery's
    /// probe step reads.
    pub fn peer_failed(&mut self, id: Uuid) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.up = false;
            peer.beacon_since_down = false;
            peer.current_db = false;
        }
    }
}

/// Thread-safe wrapper a running server shares across its beacon task and
/// RPC handlers.
pub struct VoteCell(Mutex<VoteState>);

impl VoteCell {
    pub fn new(state: VoteState) -> Self {
        VoteCell(Mutex::new(state))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut VoteState) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_vote_when_no_current_claim() {
        let state = VoteState::new(Uuid::new_v4(), vec![]);
        assert!(state.should_grant(Uuid::new_v4(), Instant::now()));
    }

    #[test]
    fn renews_same_host_before_expiry() {
        let mut state = VoteState::new(Uuid::new_v4(), vec![]);
        let host = Uuid::new_v4();
        let t0 = Instant::now();
        state.grant(host, t0, false);
        assert!(state.should_grant(host, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn refuses_other_host_before_expiry() {
        let mut state = VoteState::new(Uuid::new_v4(), vec![]);
        let host = Uuid::new_v4();
        let t0 = Instant::now();
        state.grant(host, t0, false);
        assert!(!state.should_grant(Uuid::new_v4(), t0 + Duration::from_secs(5)));
    }

    #[test]
    fn grants_other_host_after_expiry() {
        let mut state = VoteState::new(Uuid::new_v4(), vec![]);
        let host = Uuid::new_v4();
        let t0 = Instant::now();
        state.grant(host, t0, false);
        assert!(state.should_grant(Uuid::new_v4(), t0 + SMALLTIME));
    }

    #[test]
    fn promotes_on_majority_of_three() {
        let me = Uuid::new_v4();
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        let mut state = VoteState::new(me, vec![peer_a, peer_b]);
        assert_eq!(state.quorum_size(), 2);

        let now = Instant::now();
        state.peer_responded(peer_a, now, true, Version::NEW);
        assert!(state.try_promote(now));
        assert!(state.am_sync_site(now));
    }

    #[test]
    fn does_not_promote_without_quorum() {
        let me = Uuid::new_v4();
        let peer_a = Uuid::new_v4();
        let peer_b = Uuid::new_v4();
        let mut state = VoteState::new(me, vec![peer_a, peer_b]);
        assert!(!state.try_promote(Instant::now()));
    }

    #[test]
    fn rejects_non_lowest_candidate_within_window() {
        let mut state = VoteState::new(Uuid::new_v4(), vec![]);
        let t0 = Instant::now();
        let low = Uuid::nil();
        let high = Uuid::max();
        state.note_candidate(low, t0);
        state.note_candidate(high, t0 + Duration::from_secs(1));
        assert!(!state.should_grant(high, t0 + Duration::from_secs(2)));
        assert!(state.should_grant(low, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn nomination_window_resets_after_expiry() {
        let mut state = VoteState::new(Uuid::new_v4(), vec![]);
        let t0 = Instant::now();
        let low = Uuid::nil();
        let high = Uuid::max();
        state.note_candidate(low, t0);
        state.note_candidate(high, t0 + NOMINATION_WINDOW + Duration::from_secs(1));
        assert!(state.should_grant(high, t0 + NOMINATION_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn peer_failure_clears_dispatch_eligibility() {
        let me = Uuid::new_v4();
        let peer_a = Uuid::new_v4();
        let mut state = VoteState::new(me, vec![peer_a]);
        let now = Instant::now();
        state.peer_responded(peer_a, now, true, Version::NEW);
        assert!(state.peers[&peer_a].eligible_for_dispatch());
        state.peer_failed(peer_a);
        assert!(!state.peers[&peer_a].eligible_for_dispatch());
    }
}
