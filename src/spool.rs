// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Spool Consumer
//!
//! The spool consumer pulls messages from a [`Queue`] in bounded batches
//! instead of letting the broker push them. Every iteration of its loop (a
//! tick) receives up to `messages_per_tick` messages, runs each one through
//! the middleware pipeline, invokes the [`TickStrategy`] and, when nothing was
//! received, waits before trying again.
//!
//! The loop moves through `Idle -> Running -> {Draining, Stopped}` and always
//! ends with exactly one stop event carrying a [`ConsumerStoppedReason`].
//!
//! A stop request is cooperative. It is observed before each receive batch,
//! between the messages of a batch and during the idle wait, which it cuts
//! short. It never interrupts a handler.

use crate::{
    configs::{ConsumerLimits, SpoolConsumerConfiguration},
    consumer::{consume, ConsumerScope},
    errors::MessagingError,
    events::{emit, ConsumerEvent, EventSink, TracingSink},
    message::ReceivedMessage,
    pipeline::Pipeline,
    queue::Queue,
    registry::Registry,
    tag::ConsumerTagGenerator,
    tick::{
        Continuation, ConsumerStopped, ConsumerStoppedReason, NotifyTickStrategy, TickDecision,
        TickStrategy,
    },
};
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Reports the memory the process currently uses.
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> u64;
}

/// Resident set size of the current process, read from `/proc/self/status`.
///
/// Reports 0 where procfs is not available, which disables the memory limit.
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn resident_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss(&status))
            .unwrap_or(0)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Lifecycle of a spool consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> ConsumerState {
        match value {
            1 => ConsumerState::Running,
            2 => ConsumerState::Draining,
            3 => ConsumerState::Stopped,
            _ => ConsumerState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConsumerState::Idle => 0,
            ConsumerState::Running => 1,
            ConsumerState::Draining => 2,
            ConsumerState::Stopped => 3,
        }
    }
}

enum Received {
    Message(ReceivedMessage),
    Empty,
    TimedOut,
}

/// Batched pull consumer over one queue.
pub struct SpoolConsumer {
    queue: Arc<dyn Queue>,
    pipeline: Pipeline<ReceivedMessage>,
    config: SpoolConsumerConfiguration,
    limits: ConsumerLimits,
    sink: Arc<dyn EventSink>,
    tick_strategy: Option<Arc<dyn TickStrategy>>,
    memory: Arc<dyn MemoryProbe>,
    consumer_tag: String,
    continuation: Option<Continuation>,
    cancel: CancellationToken,
    state: AtomicU8,
}

impl SpoolConsumer {
    /// Creates a consumer with no limits, a broker assigned tag and events
    /// forwarded to `tracing`.
    ///
    /// # Parameters
    /// * `queue` - Queue the loop pulls from
    /// * `pipeline` - Chain every received message runs through
    /// * `config` - Batch sizes and idle timeout, already validated
    ///
    /// # Returns
    /// An idle consumer. Nothing is received until [`SpoolConsumer::run`].
    pub fn new(
        queue: Arc<dyn Queue>,
        pipeline: Pipeline<ReceivedMessage>,
        config: SpoolConsumerConfiguration,
    ) -> SpoolConsumer {
        SpoolConsumer {
            queue,
            pipeline,
            config,
            limits: ConsumerLimits::default(),
            sink: Arc::new(TracingSink),
            tick_strategy: None,
            memory: Arc::new(ProcessMemory),
            consumer_tag: String::new(),
            continuation: None,
            cancel: CancellationToken::new(),
            state: AtomicU8::new(ConsumerState::Idle.as_u8()),
        }
    }

    /// Sets the conditions that stop the loop on their own.
    ///
    /// Limits are checked before every receive batch, after every message and
    /// after every tick. The time limit also cuts an idle wait short.
    ///
    /// # Parameters
    /// * `limits` - Message count, memory, duration and receive timeout
    pub fn limits(mut self, limits: ConsumerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Receives lifecycle, per-message and stop events.
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the default strategy, which reports each tick to the sink.
    pub fn tick_strategy(mut self, strategy: Arc<dyn TickStrategy>) -> Self {
        self.tick_strategy = Some(strategy);
        self
    }

    /// Replaces the process memory reading used by the memory limit.
    ///
    /// # Parameters
    /// * `probe` - Source of the resident size compared to `max_memory_bytes`
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Tags the consumer with a name from `tags`.
    ///
    /// # Parameters
    /// * `tags` - Generator called once, here
    ///
    /// # Returns
    /// The consumer, reporting the generated tag in every event.
    pub fn consumer_tag(mut self, tags: &dyn ConsumerTagGenerator) -> Self {
        self.consumer_tag = tags.generate();
        self
    }

    /// Names the consumer to hand off to once this one stops on a limit.
    ///
    /// Replaces any list set with [`SpoolConsumer::remaining_consumers`].
    pub fn next_consumer(mut self, key: &str) -> Self {
        self.continuation = Some(Continuation::Next(key.to_owned()));
        self
    }

    /// Lists sibling consumers still running, reported with the stop event.
    pub fn remaining_consumers(mut self, keys: Vec<String>) -> Self {
        self.continuation = Some(Continuation::Remaining(keys));
        self
    }

    /// Token cancelling the loop. Cancel it from anywhere to stop the consumer.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn get_consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Runs the loop until a stop condition is met.
    ///
    /// # Returns
    /// The stop event, or the fatal error that stopped the loop with
    /// `ByError`. A consumer runs once; running it again is an error.
    pub async fn run(&self) -> Result<ConsumerStopped, MessagingError> {
        if self
            .state
            .compare_exchange(
                ConsumerState::Idle.as_u8(),
                ConsumerState::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            error!(queue = self.queue.name(), "consumer already ran");
            return Err(MessagingError::InternalError);
        }

        let tick_strategy = self
            .tick_strategy
            .clone()
            .unwrap_or_else(|| Arc::new(NotifyTickStrategy::new(self.sink.clone())));
        let scope = ConsumerScope {
            queue: self.queue.name(),
            consumer_tag: &self.consumer_tag,
            sink: self.sink.as_ref(),
        };

        emit(
            self.sink.as_ref(),
            ConsumerEvent::Started {
                queue: self.queue.name().to_owned(),
                consumer_tag: self.consumer_tag.clone(),
            },
        );

        let started = Instant::now();
        let mut processed: u64 = 0;
        let mut after_idle = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.stopped(ConsumerStoppedReason::ByUser));
            }

            if let Some(reason) = self.limit_reached(processed, started) {
                return Ok(self.stopped(reason));
            }

            let limit = self.config.tick_limit(after_idle);
            let mut received = 0;

            while received < limit {
                if received > 0 && self.cancel.is_cancelled() {
                    debug!(queue = self.queue.name(), "stop requested, draining");
                    self.set_state(ConsumerState::Draining);
                    break;
                }

                let msg = match self.receive().await {
                    Ok(Received::Message(msg)) => msg,
                    Ok(Received::Empty) => break,
                    Ok(Received::TimedOut) => {
                        return Ok(self.stopped(ConsumerStoppedReason::ByTimeoutExceeded))
                    }
                    Err(err) => return self.failed(err),
                };

                received += 1;
                processed += 1;

                if let Err(err) = consume(&scope, &self.pipeline, msg).await {
                    return self.failed(err);
                }

                if let Some(reason) = self.limit_reached(processed, started) {
                    return Ok(self.stopped(reason));
                }
            }

            if let TickDecision::Stop(reason) =
                tick_strategy.tick(self.queue.name(), &self.consumer_tag).await
            {
                return Ok(self.stopped(reason));
            }

            if let Some(reason) = self.limit_reached(processed, started) {
                return Ok(self.stopped(reason));
            }

            after_idle = received == 0;
            if after_idle {
                if let Some(reason) = self.idle(started).await {
                    return Ok(self.stopped(reason));
                }
            }
        }
    }

    async fn receive(&self) -> Result<Received, MessagingError> {
        let fetched = match self.limits.receive_timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, self.queue.get()).await {
                Ok(fetched) => fetched?,
                Err(_) => {
                    warn!(queue = self.queue.name(), "broker did not answer in time");
                    return Ok(Received::TimedOut);
                }
            },
            None => self.queue.get().await?,
        };

        Ok(match fetched {
            Some(msg) => Received::Message(msg),
            None => Received::Empty,
        })
    }

    /// Waits for the next tick.
    ///
    /// Returns the stop reason when a stop was requested or the time limit
    /// passed during the wait.
    async fn idle(&self, started: Instant) -> Option<ConsumerStoppedReason> {
        let deadline = async {
            match self.limits.duration() {
                Some(max) => tokio::time::sleep_until(started + max).await,
                None => std::future::pending().await,
            }
        };
        let wait = async {
            match self.config.timeout() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => self.queue.ready().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(ConsumerStoppedReason::ByUser),
            _ = deadline => Some(ConsumerStoppedReason::ByLimitTime),
            _ = wait => None,
        }
    }

    fn limit_reached(&self, processed: u64, started: Instant) -> Option<ConsumerStoppedReason> {
        if let Some(max) = self.limits.max_messages {
            if processed >= max {
                return Some(ConsumerStoppedReason::ByLimitMessages);
            }
        }

        if let Some(max) = self.limits.max_memory_bytes {
            if self.memory.resident_bytes() > max {
                return Some(ConsumerStoppedReason::ByLimitMemory);
            }
        }

        if let Some(max) = self.limits.duration() {
            if started.elapsed() >= max {
                return Some(ConsumerStoppedReason::ByLimitTime);
            }
        }

        None
    }

    fn stopped(&self, reason: ConsumerStoppedReason) -> ConsumerStopped {
        self.set_state(ConsumerState::Stopped);

        let stopped = ConsumerStopped {
            queue: self.queue.name().to_owned(),
            consumer_tag: self.consumer_tag.clone(),
            reason,
            continuation: self.continuation.clone(),
        };
        emit(self.sink.as_ref(), ConsumerEvent::Stopped(stopped.clone()));

        stopped
    }

    fn failed(&self, err: MessagingError) -> Result<ConsumerStopped, MessagingError> {
        error!(
            error = err.to_string(),
            queue = self.queue.name(),
            "consumer stopped by error"
        );
        self.stopped(ConsumerStoppedReason::ByError);
        Err(err)
    }
}

/// Runs the consumer registered under `first`, then keeps handing off to the
/// consumer each one names with [`SpoolConsumer::next_consumer`].
///
/// The chain ends when a consumer names no successor, or stops by user
/// request. A failing consumer ends the chain with its error.
///
/// # Returns
/// The stop events of every consumer that ran, in order
pub async fn run_chain(
    consumers: &Registry<SpoolConsumer>,
    first: &str,
) -> Result<Vec<ConsumerStopped>, MessagingError> {
    let mut history = vec![];
    let mut key = first.to_owned();

    loop {
        let consumer = consumers.get(&key)?;
        let stopped = consumer.run().await?;
        let next = match (&stopped.reason, &stopped.continuation) {
            (ConsumerStoppedReason::ByUser, _) => None,
            (_, Some(Continuation::Next(next))) => Some(next.clone()),
            _ => None,
        };

        history.push(stopped);
        match next {
            Some(next) => {
                debug!(from = key, to = next, "handing off to next consumer");
                key = next;
            }
            None => return Ok(history),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_rss_is_parsed_in_bytes() {
        let status = "Name:\tworker\nVmPeak:\t  9000 kB\nVmRSS:\t    2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
    }
}
