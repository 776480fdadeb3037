//! Work queue driving closest-node sends, one attempt at a time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::common::{Message, PeerInfo};

use super::Lifecycle;

#[derive(Debug)]
pub(crate) enum DispatcherMessage {
    Send(SendJob),
    Shutdown,
}

#[derive(Debug, Clone)]
/// One attempt of sending `message` to the closest peer to its destination.
pub(crate) struct SendJob {
    pub message: Message,
    /// Peer the previous attempt was sent to.
    pub last_tried: Option<PeerInfo>,
    /// Consecutive attempts already made to `last_tried`.
    pub attempts: u8,
    /// Do not start this attempt before this instant.
    pub not_before: Option<Instant>,
}

impl SendJob {
    pub fn new(message: Message) -> Self {
        SendJob {
            message,
            last_tried: None,
            attempts: 0,
            not_before: None,
        }
    }
}

#[derive(Debug)]
struct Deferred {
    due: Instant,
    seq: u64,
    job: SendJob,
}

impl PartialEq for Deferred {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Deferred {}

impl PartialOrd for Deferred {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deferred {
    // Reversed, so the max-heap pops the earliest due job first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
/// Receives [SendJob]s and runs them on the dispatcher thread,
/// holding back the ones that are not yet due.
pub(crate) struct Dispatcher {
    receiver: Receiver<DispatcherMessage>,
    lifecycle: Lifecycle,
    deferred: BinaryHeap<Deferred>,
    next_seq: u64,
}

impl Dispatcher {
    pub fn new(receiver: Receiver<DispatcherMessage>, lifecycle: Lifecycle) -> Self {
        Dispatcher {
            receiver,
            lifecycle,
            deferred: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Run jobs until shutdown, or until every sender is dropped.
    pub fn run(mut self, mut handle: impl FnMut(SendJob)) {
        while self.lifecycle.is_running() {
            let now = Instant::now();
            while self.deferred.peek().is_some_and(|d| d.due <= now) {
                if let Some(deferred) = self.deferred.pop() {
                    handle(deferred.job);
                }

                if !self.lifecycle.is_running() {
                    break;
                }
            }

            let received = match self.deferred.peek() {
                Some(next) => self.receiver.recv_deadline(next.due),
                None => self
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(DispatcherMessage::Send(job)) => match job.not_before {
                    Some(due) if due > Instant::now() => self.defer(due, job),
                    _ => handle(job),
                },
                Ok(DispatcherMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        debug!(
            context = "dispatcher",
            dropped = self.deferred.len(),
            "Dispatcher stopped"
        );
    }

    fn defer(&mut self, due: Instant, job: SendJob) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.deferred.push(Deferred { due, seq, job });
    }
}
