//! Per-partition workers.
//!
//! Every (topic, partition) pair gets its own task fed through a bounded
//! queue, so messages of one partition are handled strictly one after another
//! while partitions progress independently. A `Redeliver` disposition keeps the
//! worker on the same message, backing off between attempts, because
//! committing any later offset of the partition would implicitly commit it.
//! Once a queue is full the router parks further messages in a backlog and
//! reports the partition as backlogged so the consumer can pause fetching it.
//!
//! Each worker runs under its own session token registered in
//! [`PartitionSessions`]. Revoking the partition cancels the token, and the
//! worker stops without committing anything further.

use crate::traits::{MessageHandler, OffsetCommitter};
use crate::types::{BusMessage, Disposition, RedeliveryConfig, WorkerConfig};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type PartitionKey = (String, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Committed,
    /// The session ended before the handler committed; the offset stays put.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Queued,
    /// The partition's queue is full and the message was parked.
    Backlogged,
}

impl RedeliveryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(self.initial_backoff_ms);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Session tokens of the partitions this member currently works on, shared
/// with the rebalance callback.
#[derive(Clone, Default)]
pub struct PartitionSessions {
    tokens: Arc<Mutex<HashMap<PartitionKey, CancellationToken>>>,
}

impl PartitionSessions {
    fn tokens(&self) -> MutexGuard<'_, HashMap<PartitionKey, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a session for the partition under `parent`, ending any earlier one.
    pub fn open(&self, topic: &str, partition: i32, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        if let Some(previous) = self.tokens().insert((topic.to_string(), partition), token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Ends the partition's session. Returns whether one was open.
    pub fn revoke(&self, topic: &str, partition: i32) -> bool {
        match self.tokens().remove(&(topic.to_string(), partition)) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn revoke_all(&self) {
        for (_, token) in self.tokens().drain() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs `message` through `handler` until it commits or `cancel` fires.
pub async fn process_message(
    message: &BusMessage,
    handler: &dyn MessageHandler,
    committer: &dyn OffsetCommitter,
    cancel: &CancellationToken,
    redelivery: &RedeliveryConfig,
) -> MessageOutcome {
    let mut backoff = redelivery.backoff();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let disposition = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(topic = %message.topic, partition = message.partition, offset = message.offset, "session ended mid-message");
                return MessageOutcome::Abandoned;
            }
            disposition = handler.handle(message) => disposition,
        };

        match disposition {
            Disposition::Commit => {
                // A revoked partition belongs to another member now.
                if cancel.is_cancelled() {
                    return MessageOutcome::Abandoned;
                }
                if let Err(e) = committer.commit(message) {
                    // The next commit on this partition covers this offset too.
                    warn!(topic = %message.topic, partition = message.partition, offset = message.offset, error = %e, "offset commit failed");
                }
                return MessageOutcome::Committed;
            }
            Disposition::Redeliver => {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| Duration::from_millis(redelivery.max_backoff_ms));
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    attempt,
                    ?delay,
                    "message not committed, redelivering"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return MessageOutcome::Abandoned,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_partition_worker(
    mut queue: mpsc::Receiver<BusMessage>,
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    session: CancellationToken,
    redelivery: RedeliveryConfig,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = session.cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        if process_message(&message, handler.as_ref(), committer.as_ref(), &session, &redelivery).await
            == MessageOutcome::Abandoned
        {
            break;
        }
    }
}

struct PartitionQueue {
    sender: mpsc::Sender<BusMessage>,
    session: CancellationToken,
    backlog: VecDeque<BusMessage>,
}

impl PartitionQueue {
    fn is_live(&self) -> bool {
        !self.session.is_cancelled() && !self.sender.is_closed()
    }

    fn push(&mut self, message: BusMessage) -> RouteOutcome {
        if !self.backlog.is_empty() {
            self.backlog.push_back(message);
            return RouteOutcome::Backlogged;
        }

        match self.sender.try_send(message) {
            Ok(()) => RouteOutcome::Queued,
            Err(TrySendError::Full(message)) => {
                self.backlog.push_back(message);
                RouteOutcome::Backlogged
            }
            Err(TrySendError::Closed(message)) => {
                // Only reachable once the session ended; the message stays uncommitted.
                debug!(topic = %message.topic, partition = message.partition, offset = message.offset, "partition worker gone, message left for redelivery");
                RouteOutcome::Queued
            }
        }
    }

    /// Moves parked messages into the queue while it has room. True once the
    /// backlog is empty.
    fn drain(&mut self) -> bool {
        while let Some(message) = self.backlog.pop_front() {
            match self.sender.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    self.backlog.push_front(message);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                    return true;
                }
            }
        }
        true
    }
}

/// Fans messages out to one worker per (topic, partition).
pub struct PartitionRouter {
    handler: Arc<dyn MessageHandler>,
    committer: Arc<dyn OffsetCommitter>,
    cancel: CancellationToken,
    sessions: PartitionSessions,
    config: WorkerConfig,
    queues: HashMap<PartitionKey, PartitionQueue>,
    workers: JoinSet<()>,
}

impl PartitionRouter {
    pub fn new(
        handler: Arc<dyn MessageHandler>,
        committer: Arc<dyn OffsetCommitter>,
        cancel: CancellationToken,
        sessions: PartitionSessions,
        config: WorkerConfig,
    ) -> Self {
        Self {
            handler,
            committer,
            cancel,
            sessions,
            config,
            queues: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    pub fn active_partitions(&self) -> usize {
        self.queues.len()
    }

    pub fn backlog_len(&self, topic: &str, partition: i32) -> usize {
        self.queues
            .get(&(topic.to_string(), partition))
            .map_or(0, |queue| queue.backlog.len())
    }

    fn start_worker(&mut self, key: &PartitionKey) -> PartitionQueue {
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let session = self.sessions.open(&key.0, key.1, &self.cancel);
        debug!(topic = %key.0, partition = key.1, "starting partition worker");
        self.workers.spawn(run_partition_worker(
            receiver,
            self.handler.clone(),
            self.committer.clone(),
            session.clone(),
            self.config.redelivery.clone(),
        ));

        PartitionQueue {
            sender,
            session,
            backlog: VecDeque::new(),
        }
    }

    pub fn route(&mut self, message: BusMessage) -> RouteOutcome {
        let key = (message.topic.clone(), message.partition);
        let mut queue = match self.queues.remove(&key) {
            Some(queue) if queue.is_live() => queue,
            _ => self.start_worker(&key),
        };

        let outcome = queue.push(message);
        self.queues.insert(key, queue);
        outcome
    }

    /// Refills queues from their backlogs. Returns the partitions that have
    /// no backlog left.
    pub fn drain_backlogs(&mut self) -> Vec<PartitionKey> {
        self.queues
            .iter_mut()
            .filter(|(_, queue)| queue.is_live())
            .filter_map(|(key, queue)| queue.drain().then(|| key.clone()))
            .collect()
    }

    /// Forgets partitions whose session was revoked, dropping their queued
    /// and parked messages. Returns the forgotten partitions.
    pub fn prune_revoked(&mut self) -> Vec<PartitionKey> {
        let revoked: Vec<PartitionKey> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.session.is_cancelled())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &revoked {
            if let Some(queue) = self.queues.remove(key) {
                debug!(topic = %key.0, partition = key.1, dropped = queue.backlog.len(), "partition session ended");
            }
        }

        while let Some(joined) = self.workers.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "partition worker panicked");
            }
        }
        revoked
    }

    /// Closes every queue and waits for the workers to finish.
    pub async fn shutdown(mut self) {
        self.queues.clear();
        let count = self.workers.len();
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "partition worker panicked");
            }
        }
        info!(workers = count, "partition workers stopped");
    }
}
