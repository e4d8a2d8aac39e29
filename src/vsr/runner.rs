//! Threaded replica runner.
//!
//! Each `VsrNode` is owned by one thread. Callers talk to it through a
//! command channel; replies for commands that go through the log are held
//! until the entry is applied locally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::engine::committed::CommittedState;
use crate::error::NotaryError;
use crate::kernel::traits::ReplicatedApplication;

use super::node::{NodeRole, Proposal, SubmitError, VsrNode};

/// Reply channel for one submitted command.
pub type ReplySender<O> = Sender<Result<O, NotaryError>>;

/// Commands that can be sent to a replica thread.
pub enum NodeCommand<A: ReplicatedApplication> {
    /// Order a command; the reply is sent once it is applied (or refused).
    Submit {
        command: A::Command,
        reply: ReplySender<A::Output>,
    },
    /// Report the replica's current state.
    Status(Sender<NodeStatus>),
    Stop,
}

/// State snapshot from a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: u32,
    pub role: NodeRole,
    pub view: u64,
    pub leader_hint: Option<u32>,
    pub committed_index: Option<u64>,
    pub next_index: u64,
    pub halted: bool,
    pub fenced_message_count: u64,
}

/// Handle to a running replica thread.
pub struct NodeHandle<A: ReplicatedApplication> {
    pub node_id: u32,
    command_tx: Sender<NodeCommand<A>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    committed_state: Arc<CommittedState>,
    killed: Arc<AtomicBool>,
}

impl<A: ReplicatedApplication> NodeHandle<A> {
    /// Hand a command to the replica. The returned receiver yields the
    /// outcome; dropping it abandons the wait without cancelling the command.
    pub fn submit(&self, command: A::Command) -> Result<Receiver<Result<A::Output, NotaryError>>, NotaryError> {
        if self.is_killed() {
            return Err(NotaryError::unavailable(format!("replica {} is down", self.node_id)));
        }
        let (reply, rx) = bounded(1);
        self.command_tx
            .send(NodeCommand::Submit { command, reply })
            .map_err(|_| NotaryError::unavailable(format!("replica {} is down", self.node_id)))?;
        Ok(rx)
    }

    /// Current replica state, or `None` if it does not answer in time.
    pub fn status(&self) -> Option<NodeStatus> {
        if self.is_killed() {
            return None;
        }
        let (tx, rx) = bounded(1);
        self.command_tx.send(NodeCommand::Status(tx)).ok()?;
        rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    pub fn committed_index(&self) -> Option<u64> {
        self.committed_state.committed_index()
    }

    pub fn applied_index(&self) -> Option<u64> {
        self.committed_state.applied_index()
    }

    /// Stop the thread and mark the replica dead. Its pending proposals fail
    /// with `Unavailable`.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.stop();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        let _ = self.command_tx.send(NodeCommand::Stop);
        let handle = self.thread_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(node_id = self.node_id, "replica thread panicked");
            }
        }
    }
}

impl<A: ReplicatedApplication> Drop for NodeHandle<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a thread that owns `node`, waking every `tick_interval`.
pub fn spawn_node<A: ReplicatedApplication>(node: VsrNode<A>, tick_interval: Duration) -> NodeHandle<A> {
    let node_id = node.node_id;
    let committed_state = node.committed_state();
    let killed = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = unbounded();

    let mut runner = NodeRunner {
        node,
        command_rx,
        killed: killed.clone(),
        pending: HashMap::new(),
        tick_interval,
    };
    let thread_handle = thread::Builder::new()
        .name(format!("replica-{}", node_id))
        .spawn(move || runner.run());

    let thread_handle = match thread_handle {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(node_id, error = %e, "failed to spawn replica thread");
            killed.store(true, Ordering::SeqCst);
            None
        }
    };

    NodeHandle {
        node_id,
        command_tx,
        thread_handle: Mutex::new(thread_handle),
        committed_state,
        killed,
    }
}

/// Log index → (entry hash at submission, reply).
type PendingMap<O> = HashMap<u64, ([u8; 16], ReplySender<O>)>;

struct NodeRunner<A: ReplicatedApplication> {
    node: VsrNode<A>,
    command_rx: Receiver<NodeCommand<A>>,
    killed: Arc<AtomicBool>,
    pending: PendingMap<A::Output>,
    tick_interval: Duration,
}

impl<A: ReplicatedApplication> NodeRunner<A> {
    fn run(&mut self) {
        info!(node_id = self.node.node_id, "replica thread started");
        while !self.killed.load(Ordering::SeqCst) {
            while let Ok(cmd) = self.command_rx.try_recv() {
                match cmd {
                    NodeCommand::Submit { command, reply } => self.submit(command, reply),
                    NodeCommand::Status(tx) => {
                        let _ = tx.send(self.status());
                    }
                    NodeCommand::Stop => {
                        self.fail_pending("replica stopped");
                        info!(node_id = self.node.node_id, "replica thread stopped");
                        return;
                    }
                }
            }

            self.node.process_all();
            self.node.tick();
            self.deliver_applied();

            if !self.pending.is_empty() && (!self.node.is_primary() || self.node.is_halted()) {
                self.fail_pending("lost leadership before commit");
            }

            thread::sleep(self.tick_interval);
        }
        self.fail_pending("replica killed");
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.node_id,
            role: self.node.role,
            view: self.node.view,
            leader_hint: self.node.leader_hint(),
            committed_index: self.node.committed_index(),
            next_index: self.node.next_index(),
            halted: self.node.is_halted(),
            fenced_message_count: self.node.fenced_message_count,
        }
    }

    fn submit(&mut self, command: A::Command, reply: ReplySender<A::Output>) {
        match self.node.submit_command(&command) {
            Ok(Proposal::Immediate(output)) => {
                let _ = reply.send(Ok(output));
            }
            Ok(Proposal::Pending { index, hash }) => {
                self.pending.insert(index, (hash, reply));
            }
            Err(e) => {
                let _ = reply.send(Err(submit_error(e)));
            }
        }
    }

    /// Answer proposals whose entries were applied. An index that now holds
    /// a different entry was replaced by a view change; its proposer learns
    /// nothing about the outcome and must resubmit.
    fn deliver_applied(&mut self) {
        for applied in self.node.drain_applied() {
            let (hash, reply) = match self.pending.remove(&applied.index) {
                Some(p) => p,
                None => continue,
            };
            let result = if hash != applied.hash {
                debug!(node_id = self.node.node_id, index = applied.index, "proposal replaced");
                Err(NotaryError::unavailable("proposal replaced during view change"))
            } else {
                applied.result.map_err(|message| NotaryError::InternalStorage {
                    message,
                    retryable: false,
                })
            };
            let _ = reply.send(result);
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        if self.pending.is_empty() {
            return;
        }
        warn!(node_id = self.node.node_id, pending = self.pending.len(), reason, "failing pending proposals");
        for (_, (_, reply)) in self.pending.drain() {
            let _ = reply.send(Err(NotaryError::unavailable(reason)));
        }
    }
}

fn submit_error(e: SubmitError) -> NotaryError {
    match e {
        SubmitError::NotPrimary { leader_hint } => NotaryError::NotLeader { leader_hint },
        SubmitError::Halted => NotaryError::unavailable("state machine halted"),
        SubmitError::Refused(error) => error,
        SubmitError::Encode(message) => NotaryError::InternalStorage {
            message,
            retryable: false,
        },
    }
}
