// Leadership authority: who is leader, and how that changes.
//
// States: `NoLeader -> LeaderAssigned -> ElectionPending -> LeaderAssigned`.
// The leader itself is the `is_leader` flag in the `MembershipRegistry`, so
// there is exactly one place to look; this type owns the transition rules and
// the single outstanding `LeadershipTicket`.
//
// Transitions:
// - `init`: the host becomes leader directly.
// - `request_leadership`: opens a ticket if the requester isn't leader, no
//   ticket is open, and the cooldown since the last transfer has passed.
// - `cast_vote`: one vote per eligible peer (roster minus requester). Repeat
//   votes are no-ops. Once every eligible peer has voted the ticket is
//   finalized on the spot; otherwise `poll_timeout` finalizes it at the
//   deadline with whatever was cast.
// - `finalize`: transfer iff `votes_for > votes_against` among cast votes and
//   the requester is still a member. 0-0 rejects.
// - `re_elect`: leader left. Host if still connected, else earliest-joined
//   connected peer. Any open ticket is dropped without counting it.
// - `force_leadership_change`: host override, bypasses cooldown and ticket.
//
// Every method is given `now` rather than reading the clock, so the timing
// rules are testable without sleeping.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use wayfarer_protocol::{LeadershipRequestError, PeerId, TicketId};

use crate::error::VoteError;
use crate::registry::MembershipRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipState {
    NoLeader,
    LeaderAssigned,
    ElectionPending,
}

/// The in-flight record of one leadership vote.
#[derive(Clone, Debug)]
pub struct LeadershipTicket {
    pub id: TicketId,
    pub requester: PeerId,
    pub reason: String,
    pub request_time: Instant,
    pub deadline: Instant,
    pub votes_for: BTreeSet<PeerId>,
    pub votes_against: BTreeSet<PeerId>,
}

impl LeadershipTicket {
    fn has_voted(&self, voter: PeerId) -> bool {
        self.votes_for.contains(&voter) || self.votes_against.contains(&voter)
    }
}

/// Broadcast when a ticket opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    pub ticket: TicketId,
    pub requester: PeerId,
    pub reason: String,
    pub timeout: Duration,
}

/// How a ticket resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeadershipDecision {
    pub ticket: TicketId,
    pub requester: PeerId,
    pub transferred: bool,
    /// Leader after the decision.
    pub leader: Option<PeerId>,
    pub previous_leader: Option<PeerId>,
    pub votes_for: u32,
    pub votes_against: u32,
    pub timed_out: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteStatus {
    Recorded,
    /// Voter had already voted on this ticket; nothing changed.
    AlreadyVoted,
    /// That vote completed the ticket.
    Decided(LeadershipDecision),
}

/// A vote-free leadership change (re-election or override).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderChange {
    pub leader: Option<PeerId>,
    pub previous_leader: Option<PeerId>,
    /// Ticket that was open and got dropped by this change.
    pub cancelled_ticket: Option<TicketId>,
}

pub struct LeadershipAuthority {
    ticket: Option<LeadershipTicket>,
    next_ticket: u64,
    last_transfer: Option<Instant>,
    cooldown: Duration,
    vote_timeout: Duration,
}

impl LeadershipAuthority {
    pub fn new(cooldown: Duration, vote_timeout: Duration) -> Self {
        Self {
            ticket: None,
            next_ticket: 1,
            last_transfer: None,
            cooldown,
            vote_timeout,
        }
    }

    pub fn state(&self, registry: &MembershipRegistry) -> LeadershipState {
        if registry.leader().is_none() {
            LeadershipState::NoLeader
        } else if self.ticket.is_some() {
            LeadershipState::ElectionPending
        } else {
            LeadershipState::LeaderAssigned
        }
    }

    pub fn ticket(&self) -> Option<&LeadershipTicket> {
        self.ticket.as_ref()
    }

    /// Deadline of the open ticket, for the owner's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.ticket.as_ref().map(|t| t.deadline)
    }

    /// Session start: the host leads without a vote. Does not start the
    /// cooldown.
    pub fn init(&mut self, host: PeerId, registry: &mut MembershipRegistry) {
        registry.set_leader(Some(host));
        log::info!("{host} leads the session (host)");
    }

    pub fn request_leadership(
        &mut self,
        requester: PeerId,
        reason: String,
        registry: &MembershipRegistry,
        now: Instant,
    ) -> Result<VoteRequest, LeadershipRequestError> {
        if !registry.contains(requester) {
            return Err(LeadershipRequestError::NotAMember);
        }
        if registry.leader() == Some(requester) {
            return Err(LeadershipRequestError::AlreadyLeader);
        }
        if self.ticket.is_some() {
            return Err(LeadershipRequestError::RequestInProgress);
        }
        if let Some(last) = self.last_transfer {
            let since = now.saturating_duration_since(last);
            if since < self.cooldown {
                return Err(LeadershipRequestError::Cooldown {
                    remaining_ms: (self.cooldown - since).as_millis() as u64,
                });
            }
        }

        let id = TicketId(self.next_ticket);
        self.next_ticket += 1;
        self.ticket = Some(LeadershipTicket {
            id,
            requester,
            reason: reason.clone(),
            request_time: now,
            deadline: now + self.vote_timeout,
            votes_for: BTreeSet::new(),
            votes_against: BTreeSet::new(),
        });
        log::info!("{requester} requests leadership (ticket {}): {reason}", id.0);
        Ok(VoteRequest {
            ticket: id,
            requester,
            reason,
            timeout: self.vote_timeout,
        })
    }

    pub fn cast_vote(
        &mut self,
        voter: PeerId,
        ticket: TicketId,
        in_favor: bool,
        registry: &mut MembershipRegistry,
        now: Instant,
    ) -> Result<VoteStatus, VoteError> {
        let open = self.ticket.as_mut().ok_or(VoteError::NoTicket)?;
        if open.id != ticket {
            return Err(VoteError::StaleTicket {
                cast: ticket,
                open: open.id,
            });
        }
        if voter == open.requester {
            return Err(VoteError::OwnTicket);
        }
        if !registry.contains(voter) {
            return Err(VoteError::NotAMember);
        }
        if open.has_voted(voter) {
            return Ok(VoteStatus::AlreadyVoted);
        }
        if in_favor {
            open.votes_for.insert(voter);
        } else {
            open.votes_against.insert(voter);
        }
        log::debug!(
            "{voter} voted {} on ticket {}",
            if in_favor { "for" } else { "against" },
            ticket.0
        );

        match self.finalize_if_complete(registry, now) {
            Some(decision) => Ok(VoteStatus::Decided(decision)),
            None => Ok(VoteStatus::Recorded),
        }
    }

    /// True once every eligible voter still on the roster has voted.
    fn all_voted(&self, registry: &MembershipRegistry) -> bool {
        let Some(ticket) = &self.ticket else {
            return false;
        };
        registry
            .ids()
            .into_iter()
            .filter(|id| *id != ticket.requester)
            .all(|id| ticket.has_voted(id))
    }

    /// Finalize the open ticket if nobody eligible is left to vote. Also
    /// called after a voter leaves the roster.
    pub fn finalize_if_complete(
        &mut self,
        registry: &mut MembershipRegistry,
        now: Instant,
    ) -> Option<LeadershipDecision> {
        if self.all_voted(registry) {
            self.finalize(registry, now, false)
        } else {
            None
        }
    }

    /// Resolve the open ticket once its deadline has passed.
    pub fn poll_timeout(
        &mut self,
        registry: &mut MembershipRegistry,
        now: Instant,
    ) -> Option<LeadershipDecision> {
        match &self.ticket {
            Some(t) if now >= t.deadline => self.finalize(registry, now, true),
            _ => None,
        }
    }

    /// Count the cast votes and clear the ticket.
    pub fn finalize(
        &mut self,
        registry: &mut MembershipRegistry,
        now: Instant,
        timed_out: bool,
    ) -> Option<LeadershipDecision> {
        let ticket = self.ticket.take()?;
        let votes_for = ticket.votes_for.len() as u32;
        let votes_against = ticket.votes_against.len() as u32;
        let previous_leader = registry.leader();
        let majority = votes_for > votes_against;
        let requester_present = registry.contains(ticket.requester);
        let transferred = majority && requester_present;

        if transferred {
            registry.set_leader(Some(ticket.requester));
            self.last_transfer = Some(now);
            log::info!(
                "leadership passes to {} ({votes_for} for, {votes_against} against)",
                ticket.requester
            );
        } else if majority {
            log::info!(
                "ticket {} carried but {} has left; leadership unchanged",
                ticket.id.0,
                ticket.requester
            );
        } else {
            log::info!(
                "ticket {} rejected ({votes_for} for, {votes_against} against{})",
                ticket.id.0,
                if timed_out { ", timed out" } else { "" }
            );
        }

        Some(LeadershipDecision {
            ticket: ticket.id,
            requester: ticket.requester,
            transferred,
            leader: registry.leader(),
            previous_leader,
            votes_for,
            votes_against,
            timed_out,
        })
    }

    /// The leader has left the roster: pick a successor without a vote.
    /// Call after removing the old leader's record.
    pub fn re_elect(
        &mut self,
        previous_leader: Option<PeerId>,
        registry: &mut MembershipRegistry,
    ) -> LeaderChange {
        let cancelled_ticket = self.ticket.take().map(|t| t.id);
        let successor = registry
            .host()
            .filter(|h| h.connected)
            .map(|h| h.id)
            .or_else(|| registry.earliest_connected(None));
        registry.set_leader(successor);
        match successor {
            Some(id) => log::info!("re-elected {id} as leader"),
            None => log::info!("no peers left to lead"),
        }
        LeaderChange {
            leader: successor,
            previous_leader,
            cancelled_ticket,
        }
    }

    /// Host-only override. Cancels any open ticket and restarts the
    /// cooldown.
    pub fn force_leadership_change(
        &mut self,
        by: PeerId,
        new_leader: PeerId,
        reason: &str,
        registry: &mut MembershipRegistry,
        now: Instant,
    ) -> Result<LeaderChange, LeadershipRequestError> {
        if !registry.get(by).is_some_and(|r| r.is_host) {
            return Err(LeadershipRequestError::NotHost);
        }
        if !registry.contains(new_leader) {
            return Err(LeadershipRequestError::NotAMember);
        }
        let previous_leader = registry.leader();
        if previous_leader == Some(new_leader) {
            return Err(LeadershipRequestError::AlreadyLeader);
        }
        let cancelled_ticket = self.ticket.take().map(|t| t.id);
        registry.set_leader(Some(new_leader));
        self.last_transfer = Some(now);
        log::info!("host {by} forced leadership to {new_leader}: {reason}");
        Ok(LeaderChange {
            leader: Some(new_leader),
            previous_leader,
            cancelled_ticket,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::record;

    const SEC: Duration = Duration::from_secs(1);

    struct Fixture {
        reg: MembershipRegistry,
        auth: LeadershipAuthority,
        host: PeerId,
        peers: Vec<PeerId>,
        t0: Instant,
    }

    impl Fixture {
        fn request(&mut self, who: PeerId) -> Result<VoteRequest, LeadershipRequestError> {
            self.request_at(who, self.t0)
        }

        fn request_at(
            &mut self,
            who: PeerId,
            at: Instant,
        ) -> Result<VoteRequest, LeadershipRequestError> {
            self.auth
                .request_leadership(who, String::new(), &self.reg, at)
        }

        fn vote(
            &mut self,
            voter: PeerId,
            ticket: TicketId,
            in_favor: bool,
        ) -> Result<VoteStatus, VoteError> {
            self.auth
                .cast_vote(voter, ticket, in_favor, &mut self.reg, self.t0)
        }
    }

    /// Host plus `n` joiners, host leading.
    fn fixture(n: usize) -> Fixture {
        let t0 = Instant::now();
        let mut reg = MembershipRegistry::new(8);
        let mut h = record("host", t0);
        h.is_host = true;
        let host = h.id;
        reg.add(h).unwrap();
        let peers = (0..n)
            .map(|i| {
                let r = record(&format!("p{i}"), t0);
                let id = r.id;
                reg.add(r).unwrap();
                id
            })
            .collect();
        let mut auth = LeadershipAuthority::new(60 * SEC, 30 * SEC);
        auth.init(host, &mut reg);
        Fixture {
            reg,
            auth,
            host,
            peers,
            t0,
        }
    }

    fn leader_flags(reg: &MembershipRegistry) -> usize {
        reg.get_all().iter().filter(|r| r.is_leader).count()
    }

    #[test]
    fn init_makes_host_leader() {
        let f = fixture(2);
        assert_eq!(f.reg.leader(), Some(f.host));
        assert_eq!(f.auth.state(&f.reg), LeadershipState::LeaderAssigned);
    }

    #[test]
    fn no_leader_before_init() {
        let reg = MembershipRegistry::new(4);
        let auth = LeadershipAuthority::new(SEC, SEC);
        assert_eq!(auth.state(&reg), LeadershipState::NoLeader);
    }

    #[test]
    fn unanimous_vote_transfers_immediately() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f
            .auth
            .request_leadership(p, "I know the map".into(), &f.reg, f.t0)
            .unwrap();
        assert_eq!(f.auth.state(&f.reg), LeadershipState::ElectionPending);

        let s = f.vote(f.host, req.ticket, true).unwrap();
        assert_eq!(s, VoteStatus::Recorded);
        let s = f.vote(q, req.ticket, true).unwrap();
        match s {
            VoteStatus::Decided(d) => {
                assert!(d.transferred);
                assert_eq!(d.leader, Some(p));
                assert_eq!(d.previous_leader, Some(f.host));
                assert_eq!((d.votes_for, d.votes_against), (2, 0));
                assert!(!d.timed_out);
            }
            other => panic!("expected Decided, got {other:?}"),
        }
        assert_eq!(f.reg.leader(), Some(p));
        assert!(!f.reg.get(f.host).unwrap().is_leader);
        assert_eq!(leader_flags(&f.reg), 1);
        assert!(f.auth.ticket().is_none());
    }

    #[test]
    fn tie_rejects() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f.request(p).unwrap();
        f.vote(f.host, req.ticket, false).unwrap();
        let s = f.vote(q, req.ticket, true).unwrap();
        match s {
            VoteStatus::Decided(d) => assert!(!d.transferred),
            other => panic!("expected Decided, got {other:?}"),
        }
        assert_eq!(f.reg.leader(), Some(f.host));
    }

    #[test]
    fn timeout_with_no_votes_rejects() {
        let mut f = fixture(1);
        let p = f.peers[0];
        f.request(p).unwrap();
        assert!(f.auth.poll_timeout(&mut f.reg, f.t0 + 29 * SEC).is_none());
        let d = f.auth.poll_timeout(&mut f.reg, f.t0 + 30 * SEC).unwrap();
        assert!(!d.transferred);
        assert!(d.timed_out);
        assert_eq!((d.votes_for, d.votes_against), (0, 0));
        assert_eq!(f.reg.leader(), Some(f.host));
        assert_eq!(f.auth.state(&f.reg), LeadershipState::LeaderAssigned);
    }

    #[test]
    fn abstainers_do_not_block_a_timed_out_majority() {
        let mut f = fixture(3);
        let p = f.peers[0];
        let req = f.request(p).unwrap();
        f.vote(f.host, req.ticket, true).unwrap();
        let d = f.auth.poll_timeout(&mut f.reg, f.t0 + 31 * SEC).unwrap();
        assert!(d.transferred);
        assert_eq!(f.reg.leader(), Some(p));
    }

    #[test]
    fn second_request_is_in_progress() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        f.request(p).unwrap();
        assert_eq!(
            f.request(q),
            Err(LeadershipRequestError::RequestInProgress)
        );
        f.auth.poll_timeout(&mut f.reg, f.t0 + 30 * SEC).unwrap();
        assert!(f.request_at(q, f.t0 + 30 * SEC).is_ok());
    }

    #[test]
    fn leader_cannot_request() {
        let f = fixture(1);
        let mut auth = f.auth;
        assert_eq!(
            auth.request_leadership(f.host, String::new(), &f.reg, f.t0),
            Err(LeadershipRequestError::AlreadyLeader)
        );
    }

    #[test]
    fn cooldown_after_transfer() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f.request(p).unwrap();
        f.vote(f.host, req.ticket, true).unwrap();
        f.vote(q, req.ticket, true).unwrap();
        assert_eq!(f.reg.leader(), Some(p));

        match f.request_at(q, f.t0 + 59 * SEC) {
            Err(LeadershipRequestError::Cooldown { remaining_ms }) => {
                assert_eq!(remaining_ms, 1000)
            }
            other => panic!("expected Cooldown, got {other:?}"),
        }
        assert!(f.request_at(q, f.t0 + 60 * SEC).is_ok());
    }

    #[test]
    fn requester_cannot_vote_and_repeat_votes_are_no_ops() {
        let mut f = fixture(2);
        let p = f.peers[0];
        let req = f.request(p).unwrap();
        assert_eq!(
            f.vote(p, req.ticket, true),
            Err(VoteError::OwnTicket)
        );

        f.vote(f.host, req.ticket, false).unwrap();
        let before = f.auth.ticket().unwrap().clone();
        // Same voter again, even flipping sides, changes nothing.
        assert_eq!(
            f.vote(f.host, req.ticket, true),
            Ok(VoteStatus::AlreadyVoted)
        );
        let after = f.auth.ticket().unwrap();
        assert_eq!(before.votes_for, after.votes_for);
        assert_eq!(before.votes_against, after.votes_against);
    }

    #[test]
    fn votes_without_or_for_other_ticket_are_rejected() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        assert_eq!(
            f.vote(q, TicketId(1), true),
            Err(VoteError::NoTicket)
        );
        let req = f.request(p).unwrap();
        let stale = TicketId(req.ticket.0 + 5);
        assert_eq!(
            f.vote(q, stale, true),
            Err(VoteError::StaleTicket {
                cast: stale,
                open: req.ticket
            })
        );
    }

    #[test]
    fn re_elect_prefers_connected_host() {
        let mut f = fixture(2);
        let p = f.peers[0];
        f.reg.set_leader(Some(p));
        f.reg.remove(p);
        let change = f.auth.re_elect(Some(p), &mut f.reg);
        assert_eq!(change.leader, Some(f.host));
        assert_eq!(f.reg.leader(), Some(f.host));
    }

    #[test]
    fn re_elect_without_host_picks_earliest_joined() {
        let mut f = fixture(3);
        let (a, b) = (f.peers[0], f.peers[1]);
        f.reg.remove(f.host);
        let change = f.auth.re_elect(Some(f.host), &mut f.reg);
        assert_eq!(change.leader, Some(a));
        f.reg.remove(a);
        let change = f.auth.re_elect(Some(a), &mut f.reg);
        assert_eq!(change.leader, Some(b));
        assert_eq!(leader_flags(&f.reg), 1);
    }

    #[test]
    fn re_elect_cancels_open_ticket_without_counting() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f.request(p).unwrap();
        f.vote(q, req.ticket, true).unwrap();
        let host = f.host;
        f.reg.remove(host);
        let change = f.auth.re_elect(Some(host), &mut f.reg);
        assert_eq!(change.cancelled_ticket, Some(req.ticket));
        // Earliest joiner, not the requester's vote outcome.
        assert_eq!(change.leader, Some(p));
        assert!(f.auth.ticket().is_none());
    }

    #[test]
    fn force_is_host_only_and_skips_cooldown() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        assert_eq!(
            f.auth.force_leadership_change(p, q, "no", &mut f.reg, f.t0),
            Err(LeadershipRequestError::NotHost)
        );
        let req = f.request(p).unwrap();
        let change = f
            .auth
            .force_leadership_change(f.host, q, "balance", &mut f.reg, f.t0)
            .unwrap();
        assert_eq!(change.leader, Some(q));
        assert_eq!(change.cancelled_ticket, Some(req.ticket));
        // Immediately again: cooldown doesn't apply to overrides.
        let change = f
            .auth
            .force_leadership_change(f.host, p, "again", &mut f.reg, f.t0 + SEC)
            .unwrap();
        assert_eq!(change.previous_leader, Some(q));
        assert_eq!(f.reg.leader(), Some(p));
        assert_eq!(leader_flags(&f.reg), 1);
    }

    #[test]
    fn requester_leaving_mid_vote_never_wins() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f.request(p).unwrap();
        f.vote(f.host, req.ticket, true).unwrap();
        f.reg.remove(p);
        let s = f.vote(q, req.ticket, true).unwrap();
        match s {
            VoteStatus::Decided(d) => {
                assert!(!d.transferred);
                assert_eq!(d.leader, Some(f.host));
            }
            other => panic!("expected Decided, got {other:?}"),
        }
    }

    #[test]
    fn voter_leaving_completes_the_ticket() {
        let mut f = fixture(2);
        let (p, q) = (f.peers[0], f.peers[1]);
        let req = f.request(p).unwrap();
        f.vote(f.host, req.ticket, true).unwrap();
        f.reg.remove(q);
        let d = f.auth.finalize_if_complete(&mut f.reg, f.t0).unwrap();
        assert!(d.transferred);
    }
}
