use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::config::ClusterConfig;
use crate::engine::committed::CommittedState;
use crate::engine::log::{LogEntry, ReplicatedLog};
use crate::engine::manifest::Manifest;
use crate::error::NotaryError;
use crate::kernel::executor::{Executor, StepResult};
use crate::kernel::traits::{Admission, BlockTime, ReplicatedApplication};

use super::message::VsrMessage;
use super::network::NetworkEndpoint;
use super::quorum::{quorum_size, QuorumTracker, ReplicaSet};

/// Heartbeat interval: the primary sends a Commit if idle for this long.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Election timeout: a backup starts a view change after hearing nothing
/// from the primary for this long. A stalled view change is retried with
/// the next view after the same delay.
pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound on entries per CatchUpResponse.
pub const MAX_CATCH_UP_ENTRIES: u64 = 100;

/// Protocol timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsrTiming {
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
}

impl Default for VsrTiming {
    fn default() -> Self {
        VsrTiming {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            election_timeout: ELECTION_TIMEOUT,
        }
    }
}

impl From<&ClusterConfig> for VsrTiming {
    fn from(config: &ClusterConfig) -> Self {
        VsrTiming {
            heartbeat_interval: config.heartbeat_interval(),
            election_timeout: config.election_timeout(),
        }
    }
}

/// Role of a VSR node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Orders new commands and broadcasts Prepare messages.
    Primary,
    /// Replicates the primary's log and applies committed entries.
    Backup,
    /// The node suspects the primary failed and is electing a new one.
    ViewChangeInProgress,
}

/// Collected DoViewChange for log selection.
#[derive(Debug, Clone)]
pub struct DoViewChangeInfo {
    pub node_id: u32,
    pub last_normal_view: u64,
    pub commit_index: Option<u64>,
    pub log: Vec<LogEntry>,
}

impl DoViewChangeInfo {
    /// Ordering key: the log from the most recent normal view wins, then the
    /// longest one.
    fn rank(&self) -> (u64, usize) {
        (self.last_normal_view, self.log.len())
    }
}

/// Why a command was not accepted for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("node is not the primary (leader hint: {leader_hint:?})")]
    NotPrimary { leader_hint: Option<u32> },

    #[error("state machine halted")]
    Halted,

    #[error("failed to encode command: {0}")]
    Encode(String),

    #[error("command refused: {0}")]
    Refused(NotaryError),
}

/// Outcome of submitting a command on the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal<O> {
    /// Answered by `admit` without touching the log.
    Immediate(O),
    /// Appended at `index`. The entry only counts as ours if the entry later
    /// applied at `index` still has this `hash`.
    Pending { index: u64, hash: [u8; 16] },
}

/// One entry applied to the local state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEntry<O> {
    pub index: u64,
    pub hash: [u8; 16],
    /// `Err` if the payload was rejected without being applied.
    pub result: Result<O, String>,
}

/// VSR replica state.
///
/// Single threaded: one runner thread owns the node and drives it through
/// `process_all()` and `tick()`.
pub struct VsrNode<A: ReplicatedApplication> {
    pub node_id: u32,
    pub role: NodeRole,
    /// Current (normal) view.
    pub view: u64,
    /// View being negotiated during a view change.
    pub proposed_view: u64,
    pub cluster_size: u32,
    timing: VsrTiming,

    log: ReplicatedLog,
    /// Shared with observers.
    committed_state: Arc<CommittedState>,
    executor: Executor<A>,
    clock: Arc<dyn Clock>,
    network: NetworkEndpoint,

    /// Primary only.
    quorum_tracker: Option<QuorumTracker>,

    // =========================================================================
    // DURABLE FENCING STATE
    // =========================================================================
    /// INVARIANT: a message with view V is processed only if
    /// `manifest.highest_view() <= V`. Views are persisted before voting.
    manifest: Manifest,
    pub fenced_message_count: u64,

    // =========================================================================
    // TIMERS
    // =========================================================================
    last_primary_contact: Instant,
    last_sent: Instant,
    view_change_started: Instant,
    last_recovery_request: Option<Instant>,

    // =========================================================================
    // VIEW CHANGE STATE
    // =========================================================================
    start_view_change_votes: HashMap<u64, ReplicaSet>,
    do_view_change_msgs: HashMap<u64, Vec<DoViewChangeInfo>>,
    /// View for which this node already sent (or recorded) its DoViewChange.
    sent_do_view_change: Option<u64>,

    // =========================================================================
    // CATCH-UP STATE (Backup only)
    // =========================================================================
    catch_up_target: Option<u64>,
    catch_up_requested_at: Option<Instant>,
    /// Entries that arrived ahead of a gap.
    catch_up_buffer: BTreeMap<u64, LogEntry>,

    /// Applied since the last `drain_applied()`.
    applied: Vec<AppliedEntry<A::Output>>,
}

impl<A: ReplicatedApplication> VsrNode<A> {
    /// Create a replica. A fresh cluster starts in view 0 with replica 0 as
    /// primary; a replica whose manifest already holds a later view restarts
    /// as a backup in that view and waits to hear from its primary.
    pub fn new(
        node_id: u32,
        cluster_size: u32,
        network: NetworkEndpoint,
        app: A,
        clock: Arc<dyn Clock>,
        manifest: Manifest,
        timing: VsrTiming,
    ) -> Self {
        let view = manifest.highest_view();
        let now = Instant::now();
        let primary_of_view = (view % cluster_size as u64) as u32;
        let (role, quorum_tracker) = if view == 0 && primary_of_view == node_id {
            (NodeRole::Primary, Some(QuorumTracker::new(cluster_size, node_id)))
        } else {
            (NodeRole::Backup, None)
        };

        info!(node_id, view, ?role, "replica starting");

        VsrNode {
            node_id,
            role,
            view,
            proposed_view: view,
            cluster_size,
            timing,
            log: ReplicatedLog::new(),
            committed_state: Arc::new(CommittedState::new()),
            executor: Executor::new(app),
            clock,
            network,
            quorum_tracker,
            manifest,
            fenced_message_count: 0,
            last_primary_contact: now,
            last_sent: now,
            view_change_started: now,
            last_recovery_request: None,
            start_view_change_votes: HashMap::new(),
            do_view_change_msgs: HashMap::new(),
            sent_do_view_change: None,
            catch_up_target: None,
            catch_up_requested_at: None,
            catch_up_buffer: BTreeMap::new(),
            applied: Vec::new(),
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn committed_state(&self) -> Arc<CommittedState> {
        self.committed_state.clone()
    }

    pub fn committed_index(&self) -> Option<u64> {
        self.committed_state.committed_index()
    }

    pub fn next_index(&self) -> u64 {
        self.log.next_index()
    }

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub fn app(&self) -> &A {
        self.executor.app()
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_view_change_in_progress(&self) -> bool {
        self.role == NodeRole::ViewChangeInProgress
    }

    pub fn is_halted(&self) -> bool {
        self.executor.is_halted()
    }

    pub fn durable_highest_view(&self) -> u64 {
        self.manifest.highest_view()
    }

    /// Who this node believes leads, if anyone.
    pub fn leader_hint(&self) -> Option<u32> {
        match self.role {
            NodeRole::Primary => Some(self.node_id),
            NodeRole::Backup => Some(self.primary_for_view(self.view)),
            NodeRole::ViewChangeInProgress => None,
        }
    }

    /// Take the entries applied since the last call.
    pub fn drain_applied(&mut self) -> Vec<AppliedEntry<A::Output>> {
        std::mem::take(&mut self.applied)
    }

    /// Round-robin: primary = view % cluster_size.
    fn primary_for_view(&self, view: u64) -> u32 {
        (view % self.cluster_size as u64) as u32
    }

    fn quorum(&self) -> u32 {
        quorum_size(self.cluster_size)
    }

    // =========================================================================
    // PRIMARY ROLE
    // =========================================================================

    /// Submit a command for ordering (Primary only).
    ///
    /// The application's `admit` runs first against the primary's clock; a
    /// command it answers directly never enters the log.
    pub fn submit_command(&mut self, command: &A::Command) -> Result<Proposal<A::Output>, SubmitError> {
        if self.role != NodeRole::Primary {
            return Err(SubmitError::NotPrimary {
                leader_hint: self.leader_hint(),
            });
        }
        if self.executor.is_halted() {
            return Err(SubmitError::Halted);
        }

        let now = self.clock.now_ns();
        match self.executor.app().admit(command, BlockTime::from_nanos(now)) {
            Admission::Append => {}
            Admission::Reply(output) => return Ok(Proposal::Immediate(output)),
            Admission::Refuse(error) => return Err(SubmitError::Refused(error)),
        }

        let payload = bincode::serialize(command).map_err(|e| SubmitError::Encode(e.to_string()))?;

        // Block time never goes backwards along the log.
        let timestamp_ns = self
            .log
            .entries()
            .last()
            .map_or(now, |last| now.max(last.timestamp_ns));
        let index = self.log.append(self.view, timestamp_ns, payload);
        let entry = match self.log.get(index) {
            Some(entry) => entry.clone(),
            None => return Err(SubmitError::Encode(format!("entry {} vanished after append", index))),
        };
        let hash = entry.hash;

        if let Some(tracker) = self.quorum_tracker.as_mut() {
            tracker.record_local_write(index);
        }

        trace!(node_id = self.node_id, view = self.view, index, "prepare");
        self.network.broadcast(VsrMessage::Prepare {
            view: self.view,
            entry,
            commit_index: self.committed_index(),
        });
        self.last_sent = Instant::now();

        // A single-replica cluster commits on its own write.
        self.try_commit();

        Ok(Proposal::Pending { index, hash })
    }

    /// Handle a PrepareOk (Primary only).
    pub fn handle_prepare_ok(&mut self, view: u64, index: u64, from_node: u32) {
        if self.role != NodeRole::Primary || view != self.view {
            return;
        }
        if self.committed_index().map_or(false, |c| index <= c) || index >= self.log.next_index() {
            return;
        }
        if let Some(tracker) = self.quorum_tracker.as_mut() {
            tracker.record_prepare_ok(index, from_node);
        }
        self.try_commit();
    }

    /// Advance the commit point over the contiguous quorum prefix and apply.
    fn try_commit(&mut self) {
        let current = self.committed_index();
        let committable = match self.quorum_tracker.as_ref() {
            Some(tracker) => tracker.committable_index_from(current),
            None => return,
        };
        let committable = match committable {
            Some(c) if current.map_or(true, |cur| c > cur) => c,
            _ => return,
        };

        self.committed_state.advance(committable);
        self.apply_committed();

        debug!(node_id = self.node_id, view = self.view, commit_index = committable, "committed");
        self.network.broadcast(VsrMessage::Commit {
            view: self.view,
            commit_index: Some(committable),
        });
        self.last_sent = Instant::now();

        if let Some(tracker) = self.quorum_tracker.as_mut() {
            tracker.gc(committable);
        }
    }

    /// Handle a CatchUpRequest (Primary only). Serves at most
    /// `MAX_CATCH_UP_ENTRIES` from the primary's log.
    pub fn handle_catch_up_request(&mut self, from_node: u32, view: u64, from_index: u64, to_index: u64) {
        if self.role != NodeRole::Primary || view != self.view {
            return;
        }
        let last = match self.log.last_index() {
            Some(last) => last.min(to_index),
            None => return,
        };
        if from_index > last {
            return;
        }
        let batch_end = last.min(from_index + MAX_CATCH_UP_ENTRIES - 1);
        let entries = self.log.read_range(from_index, batch_end);

        debug!(
            node_id = self.node_id,
            to = from_node,
            from_index,
            to_index = batch_end,
            "serving catch-up"
        );
        self.network.send_to(
            from_node,
            VsrMessage::CatchUpResponse {
                view: self.view,
                entries,
                has_more: batch_end < last,
                commit_index: self.committed_index(),
            },
        );
    }

    /// Answer a replica that is behind on views.
    pub fn handle_recovery_request(&mut self, from_node: u32, view: u64) {
        if self.role != NodeRole::Primary || view > self.view {
            return;
        }
        info!(node_id = self.node_id, to = from_node, view = self.view, "re-sending StartView");
        self.network.send_to(from_node, self.start_view_message());
    }

    fn start_view_message(&self) -> VsrMessage {
        VsrMessage::StartView {
            new_view: self.view,
            primary_id: self.node_id,
            commit_index: self.committed_index(),
            log: self.log.entries().to_vec(),
        }
    }

    // =========================================================================
    // BACKUP ROLE
    // =========================================================================

    /// Handle a Prepare (Backup only).
    ///
    /// 1. Verify the view matches
    /// 2. Buffer and request catch-up on a gap
    /// 3. Append, ack with PrepareOk
    /// 4. Advance the commit point to the primary's, bounded by the local log
    pub fn handle_prepare(&mut self, from_node: u32, view: u64, entry: LogEntry, commit_index: Option<u64>) {
        if view > self.view {
            self.request_recovery(from_node, view);
            return;
        }
        if self.role != NodeRole::Backup || view != self.view {
            return;
        }
        self.last_primary_contact = Instant::now();

        let index = entry.index;
        let next = self.log.next_index();
        if index > next {
            self.catch_up_buffer.insert(index, entry);
            self.request_catch_up(from_node, index - 1);
            return;
        }
        if index < next {
            // Duplicate: re-ack if it is the same entry.
            if self.log.get(index).map(|e| e.hash) == Some(entry.hash) {
                self.send_prepare_ok(from_node, index);
            }
            return;
        }

        match self.log.append_entry(entry) {
            Ok(()) => self.send_prepare_ok(from_node, index),
            Err(e) => {
                warn!(node_id = self.node_id, view, index, error = %e, "rejected prepare");
                return;
            }
        }
        self.drain_catch_up_buffer(from_node);
        self.advance_commit(commit_index);
    }

    /// Handle a Commit / heartbeat (Backup only).
    pub fn handle_commit(&mut self, from_node: u32, view: u64, commit_index: Option<u64>) {
        if view > self.view {
            self.request_recovery(from_node, view);
            return;
        }
        if self.role != NodeRole::Backup || view != self.view {
            return;
        }
        self.last_primary_contact = Instant::now();

        if let Some(commit) = commit_index {
            if commit >= self.log.next_index() {
                self.request_catch_up(from_node, commit);
            }
        }
        self.advance_commit(commit_index);
    }

    /// Handle a CatchUpResponse (Backup only).
    pub fn handle_catch_up_response(
        &mut self,
        from_node: u32,
        view: u64,
        entries: Vec<LogEntry>,
        has_more: bool,
        commit_index: Option<u64>,
    ) {
        if self.role != NodeRole::Backup || view != self.view {
            return;
        }
        self.last_primary_contact = Instant::now();

        for entry in entries {
            let index = entry.index;
            if index != self.log.next_index() {
                continue;
            }
            if let Err(e) = self.log.append_entry(entry) {
                warn!(node_id = self.node_id, index, error = %e, "rejected catch-up entry");
                break;
            }
            self.send_prepare_ok(from_node, index);
        }
        self.drain_catch_up_buffer(from_node);

        self.catch_up_requested_at = None;
        match self.catch_up_target {
            Some(target) if has_more || target >= self.log.next_index() => {
                self.request_catch_up(from_node, target);
            }
            _ => self.catch_up_target = None,
        }

        self.advance_commit(commit_index);
    }

    fn send_prepare_ok(&self, primary: u32, index: u64) {
        self.network.send_to(
            primary,
            VsrMessage::PrepareOk {
                view: self.view,
                index,
                node_id: self.node_id,
            },
        );
    }

    /// Ask the primary for `[next_index, target]`. At most one request is
    /// outstanding per heartbeat interval.
    fn request_catch_up(&mut self, primary: u32, target: u64) {
        let from_index = self.log.next_index();
        if target < from_index {
            return;
        }
        self.catch_up_target = Some(self.catch_up_target.map_or(target, |t| t.max(target)));
        if let Some(at) = self.catch_up_requested_at {
            if at.elapsed() < self.timing.heartbeat_interval {
                return;
            }
        }
        let to_index = self.catch_up_target.unwrap_or(target);
        debug!(node_id = self.node_id, from_index, to_index, "requesting catch-up");
        self.network.send_to(
            primary,
            VsrMessage::CatchUpRequest {
                view: self.view,
                node_id: self.node_id,
                from_index,
                to_index,
            },
        );
        self.catch_up_requested_at = Some(Instant::now());
    }

    fn drain_catch_up_buffer(&mut self, primary: u32) {
        let next = self.log.next_index();
        self.catch_up_buffer.retain(|&idx, _| idx >= next);
        while let Some(entry) = self.catch_up_buffer.remove(&self.log.next_index()) {
            let index = entry.index;
            if let Err(e) = self.log.append_entry(entry) {
                warn!(node_id = self.node_id, index, error = %e, "dropping buffered entry");
                break;
            }
            self.send_prepare_ok(primary, index);
        }
    }

    /// Follow the primary's commit point, never past the local log.
    fn advance_commit(&mut self, primary_commit: Option<u64>) {
        let (primary_commit, last) = match (primary_commit, self.log.last_index()) {
            (Some(c), Some(last)) => (c, last),
            _ => return,
        };
        let target = primary_commit.min(last);
        if self.committed_index().map_or(true, |c| target > c) {
            self.committed_state.advance(target);
        }
        self.apply_committed();
    }

    /// Step the executor until it catches up with the commit point.
    fn apply_committed(&mut self) {
        let committed = self.committed_index();
        loop {
            match self.executor.step(&self.log, committed) {
                Ok(StepResult::Idle) => break,
                Ok(StepResult::Applied { index, output }) => {
                    self.record_applied(index, Ok(output));
                }
                Ok(StepResult::Rejected { index, error }) => {
                    warn!(node_id = self.node_id, index, %error, "rejected committed entry");
                    self.record_applied(index, Err(error));
                }
                Err(e) => {
                    error!(node_id = self.node_id, error = %e, "state machine stopped");
                    break;
                }
            }
        }
    }

    fn record_applied(&mut self, index: u64, result: Result<A::Output, String>) {
        self.committed_state.mark_applied(index);
        let hash = self.log.get(index).map(|e| e.hash).unwrap_or_default();
        self.applied.push(AppliedEntry { index, hash, result });
    }

    /// Rate-limited RecoveryRequest to a replica that is ahead on views.
    fn request_recovery(&mut self, to: u32, view: u64) {
        if let Some(at) = self.last_recovery_request {
            if at.elapsed() < self.timing.heartbeat_interval {
                return;
            }
        }
        info!(node_id = self.node_id, view = self.view, seen_view = view, to, "behind on views, requesting StartView");
        self.network.send_to(
            to,
            VsrMessage::RecoveryRequest {
                view,
                node_id: self.node_id,
            },
        );
        self.last_recovery_request = Some(Instant::now());
    }

    // =========================================================================
    // MESSAGE DISPATCH
    // =========================================================================

    /// Process one incoming message. Returns true if a message was processed.
    pub fn process_one(&mut self) -> bool {
        let (from_node, msg) = match self.network.try_recv() {
            Some(m) => m,
            None => return false,
        };
        self.handle_message(from_node, msg);
        true
    }

    pub fn process_all(&mut self) {
        while self.process_one() {}
    }

    fn handle_message(&mut self, from_node: u32, msg: VsrMessage) {
        // DURABLE FENCE: nothing from a view below the highest one we have
        // persisted is processed. RecoveryRequest is exempt; it only asks
        // the primary to repeat itself.
        if !matches!(msg, VsrMessage::RecoveryRequest { .. }) {
            if let Err(e) = self.manifest.check_view_fence(msg.view()) {
                self.fenced_message_count += 1;
                trace!(node_id = self.node_id, from = from_node, kind = msg.kind(), error = %e, "fenced");
                return;
            }
        }

        match msg {
            VsrMessage::Prepare { view, entry, commit_index } => {
                self.handle_prepare(from_node, view, entry, commit_index);
            }
            VsrMessage::PrepareOk { view, index, node_id } => {
                self.handle_prepare_ok(view, index, node_id);
            }
            VsrMessage::Commit { view, commit_index } => {
                self.handle_commit(from_node, view, commit_index);
            }
            VsrMessage::StartViewChange { new_view, node_id } => {
                self.handle_start_view_change(new_view, node_id);
            }
            VsrMessage::DoViewChange {
                new_view,
                node_id,
                last_normal_view,
                commit_index,
                log,
            } => {
                self.handle_do_view_change(
                    new_view,
                    DoViewChangeInfo {
                        node_id,
                        last_normal_view,
                        commit_index,
                        log,
                    },
                );
            }
            VsrMessage::StartView {
                new_view,
                primary_id,
                commit_index,
                log,
            } => {
                self.handle_start_view(new_view, primary_id, commit_index, log);
            }
            VsrMessage::CatchUpRequest {
                view,
                node_id: _,
                from_index,
                to_index,
            } => {
                self.handle_catch_up_request(from_node, view, from_index, to_index);
            }
            VsrMessage::CatchUpResponse {
                view,
                entries,
                has_more,
                commit_index,
            } => {
                self.handle_catch_up_response(from_node, view, entries, has_more, commit_index);
            }
            VsrMessage::RecoveryRequest { view, node_id: _ } => {
                self.handle_recovery_request(from_node, view);
            }
        }
    }

    // =========================================================================
    // HEARTBEAT AND FAILURE DETECTION
    // =========================================================================

    /// Periodic timers.
    ///
    /// - Primary: heartbeat when idle. A primary whose state machine halted
    ///   stops heartbeating so the backups elect a replacement.
    /// - Backup: start a view change after the election timeout.
    /// - View change: retry with the next view after the election timeout.
    ///
    /// Returns true if a view change was started.
    pub fn tick(&mut self) -> bool {
        match self.role {
            NodeRole::Primary => {
                if !self.executor.is_halted() && self.last_sent.elapsed() >= self.timing.heartbeat_interval {
                    self.send_heartbeat();
                }
                false
            }
            NodeRole::Backup => {
                if self.last_primary_contact.elapsed() >= self.timing.election_timeout {
                    warn!(
                        node_id = self.node_id,
                        view = self.view,
                        primary = self.primary_for_view(self.view),
                        "primary silent, starting view change"
                    );
                    self.start_view_change(self.view + 1);
                    true
                } else {
                    false
                }
            }
            NodeRole::ViewChangeInProgress => {
                if self.view_change_started.elapsed() >= self.timing.election_timeout {
                    warn!(node_id = self.node_id, proposed_view = self.proposed_view, "view change stalled, retrying");
                    self.start_view_change(self.proposed_view + 1);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn send_heartbeat(&mut self) {
        self.network.broadcast(VsrMessage::Commit {
            view: self.view,
            commit_index: self.committed_index(),
        });
        self.last_sent = Instant::now();
    }

    // =========================================================================
    // VIEW CHANGE PROTOCOL
    // =========================================================================

    /// Enter view change for `new_view` and broadcast StartViewChange.
    ///
    /// DURABLE FENCE: the view is persisted before anything is sent.
    fn start_view_change(&mut self, new_view: u64) {
        if let Err(e) = self.manifest.advance_view(new_view) {
            error!(node_id = self.node_id, new_view, error = %e, "failed to persist view, not voting");
            return;
        }

        self.proposed_view = new_view;
        self.role = NodeRole::ViewChangeInProgress;
        self.quorum_tracker = None;
        self.view_change_started = Instant::now();
        self.start_view_change_votes.retain(|&v, _| v >= new_view);
        self.do_view_change_msgs.retain(|&v, _| v >= new_view);

        info!(
            node_id = self.node_id,
            view = self.view,
            new_view,
            durable = self.manifest.highest_view(),
            "started view change"
        );

        self.network.broadcast(VsrMessage::StartViewChange {
            new_view,
            node_id: self.node_id,
        });
        self.record_start_view_change_vote(new_view, self.node_id);
    }

    fn handle_start_view_change(&mut self, new_view: u64, from_node: u32) {
        if new_view <= self.view {
            return;
        }
        // Join a view change for a higher view than ours.
        if self.role != NodeRole::ViewChangeInProgress || new_view > self.proposed_view {
            self.start_view_change(new_view);
            if self.proposed_view != new_view {
                return;
            }
        }
        if new_view < self.proposed_view {
            return;
        }
        self.record_start_view_change_vote(new_view, from_node);
    }

    fn record_start_view_change_vote(&mut self, new_view: u64, node_id: u32) {
        let votes = self.start_view_change_votes.entry(new_view).or_default();
        votes.add(node_id);
        let count = votes.len();

        debug!(node_id = self.node_id, new_view, from = node_id, votes = count, quorum = self.quorum(), "StartViewChange vote");

        if count >= self.quorum() {
            self.on_view_change_quorum(new_view);
        }
    }

    /// Quorum of StartViewChange: hand our log to the new primary.
    fn on_view_change_quorum(&mut self, new_view: u64) {
        if self.sent_do_view_change == Some(new_view) {
            return;
        }
        self.sent_do_view_change = Some(new_view);

        let new_primary = self.primary_for_view(new_view);
        let info = DoViewChangeInfo {
            node_id: self.node_id,
            last_normal_view: self.manifest.last_normal_view(),
            commit_index: self.committed_index(),
            log: self.log.entries().to_vec(),
        };

        info!(node_id = self.node_id, new_view, new_primary, "view change quorum reached");

        if new_primary == self.node_id {
            self.store_do_view_change(new_view, info);
            self.check_do_view_change_quorum(new_view);
        } else {
            self.network.send_to(
                new_primary,
                VsrMessage::DoViewChange {
                    new_view,
                    node_id: info.node_id,
                    last_normal_view: info.last_normal_view,
                    commit_index: info.commit_index,
                    log: info.log,
                },
            );
        }
    }

    fn store_do_view_change(&mut self, new_view: u64, info: DoViewChangeInfo) {
        let msgs = self.do_view_change_msgs.entry(new_view).or_default();
        if !msgs.iter().any(|m| m.node_id == info.node_id) {
            msgs.push(info);
        }
    }

    fn handle_do_view_change(&mut self, new_view: u64, info: DoViewChangeInfo) {
        if self.primary_for_view(new_view) != self.node_id || new_view < self.view {
            return;
        }
        if new_view == self.view {
            // Already established; the sender missed our StartView.
            if self.role == NodeRole::Primary {
                self.network.send_to(info.node_id, self.start_view_message());
            }
            return;
        }
        if self.role != NodeRole::ViewChangeInProgress || new_view > self.proposed_view {
            self.start_view_change(new_view);
            if self.proposed_view != new_view {
                return;
            }
        }
        if new_view < self.proposed_view {
            return;
        }

        debug!(node_id = self.node_id, new_view, from = info.node_id, log_len = info.log.len(), "DoViewChange");
        self.store_do_view_change(new_view, info);
        self.check_do_view_change_quorum(new_view);
    }

    /// Become primary once a quorum of DoViewChange (our own included) is in.
    fn check_do_view_change_quorum(&mut self, new_view: u64) {
        let ready = self
            .do_view_change_msgs
            .get(&new_view)
            .map(|msgs| {
                msgs.len() as u32 >= self.quorum() && msgs.iter().any(|m| m.node_id == self.node_id)
            })
            .unwrap_or(false);
        if ready {
            self.become_primary(new_view);
        }
    }

    /// Adopt the most up to date log among the DoViewChange quorum and
    /// broadcast StartView.
    fn become_primary(&mut self, new_view: u64) {
        let msgs = match self.do_view_change_msgs.remove(&new_view) {
            Some(msgs) => msgs,
            None => return,
        };
        let best = match msgs.iter().max_by_key(|m| m.rank()) {
            Some(best) => best.log.clone(),
            None => return,
        };
        let master_commit = msgs.iter().filter_map(|m| m.commit_index).max();

        if let Err(e) = self.log.adopt(best, self.executor.applied_index()) {
            error!(node_id = self.node_id, new_view, error = %e, "cannot adopt log, abandoning view");
            return;
        }
        if let Err(e) = self.manifest.enter_normal_view(new_view) {
            error!(node_id = self.node_id, new_view, error = %e, "failed to persist view");
            return;
        }

        self.view = new_view;
        self.proposed_view = new_view;
        self.role = NodeRole::Primary;
        self.clear_view_change_state();

        let commit = match (master_commit, self.log.last_index()) {
            (Some(c), Some(last)) => Some(c.min(last)),
            _ => None,
        };
        if let Some(c) = commit {
            self.committed_state.advance(c);
        }

        let mut tracker = QuorumTracker::new(self.cluster_size, self.node_id);
        let first_uncommitted = self.committed_index().map_or(0, |c| c + 1);
        for index in first_uncommitted..self.log.next_index() {
            tracker.record_local_write(index);
        }
        self.quorum_tracker = Some(tracker);

        info!(
            node_id = self.node_id,
            view = new_view,
            log_len = self.log.len(),
            commit_index = ?self.committed_index(),
            "became primary"
        );

        self.network.broadcast(self.start_view_message());
        self.last_sent = Instant::now();
        self.apply_committed();
        self.try_commit();
    }

    /// Adopt the new primary's log and become its backup.
    fn handle_start_view(
        &mut self,
        new_view: u64,
        primary_id: u32,
        commit_index: Option<u64>,
        log: Vec<LogEntry>,
    ) {
        if new_view < self.view || (new_view == self.view && self.role == NodeRole::Primary) {
            return;
        }
        if primary_id != self.primary_for_view(new_view) {
            warn!(node_id = self.node_id, new_view, primary_id, "StartView from wrong primary");
            return;
        }

        if let Err(e) = self.log.adopt(log, self.executor.applied_index()) {
            error!(node_id = self.node_id, new_view, error = %e, "cannot adopt primary log");
            return;
        }
        if let Err(e) = self.manifest.enter_normal_view(new_view) {
            error!(node_id = self.node_id, new_view, error = %e, "failed to persist view");
            return;
        }

        self.view = new_view;
        self.proposed_view = new_view;
        self.role = NodeRole::Backup;
        self.quorum_tracker = None;
        self.last_primary_contact = Instant::now();
        self.clear_view_change_state();

        info!(
            node_id = self.node_id,
            view = new_view,
            primary = primary_id,
            log_len = self.log.len(),
            "transitioned to backup"
        );

        // Vouch for the uncommitted suffix so the new primary can commit it.
        let first_uncommitted = commit_index.map_or(0, |c| c + 1);
        for index in first_uncommitted..self.log.next_index() {
            self.send_prepare_ok(primary_id, index);
        }
        self.advance_commit(commit_index);
    }

    fn clear_view_change_state(&mut self) {
        self.start_view_change_votes.clear();
        self.do_view_change_msgs.clear();
        self.sent_do_view_change = None;
        self.catch_up_target = None;
        self.catch_up_requested_at = None;
        self.catch_up_buffer.clear();
        self.last_recovery_request = None;
    }
}
