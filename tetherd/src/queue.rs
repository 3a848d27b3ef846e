//! Durable per-agent command delivery with at-least-once semantics.
//!
//! Each agent owns an ordered pending list, an inflight list and a result
//! store. A poll atomically moves the pending head to inflight; an inflight
//! entry older than the redelivery threshold is handed out again on a later
//! poll, so a lost delivery is recovered by the queue rather than by client
//! retry. Posting a result clears the inflight entry and stores the result
//! for adapter pickup, bounded by a retention window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tether_contract::{CommandEnvelope, CommandResult, RESULT_RETENTION_DAYS};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// An inflight command is eligible for redelivery after this long.
pub const REDELIVERY_AFTER: Duration = Duration::seconds(120);
/// Upper bound a single long-poll may block.
pub const MAX_POLL_WAIT: std::time::Duration = std::time::Duration::from_secs(25);

#[derive(Debug, Clone)]
struct InflightRecord {
    command: CommandEnvelope,
    delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredResult {
    result: CommandResult,
    stored_at: DateTime<Utc>,
}

#[derive(Default)]
struct AgentChannel {
    pending: VecDeque<CommandEnvelope>,
    inflight: Vec<InflightRecord>,
    results: HashMap<String, StoredResult>,
}

struct ChannelSlot {
    channel: AgentChannel,
    notify: Arc<Notify>,
}

impl Default for ChannelSlot {
    fn default() -> Self {
        Self {
            channel: AgentChannel::default(),
            notify: Arc::new(Notify::new()),
        }
    }
}

pub struct CommandQueue {
    channels: Mutex<HashMap<String, ChannelSlot>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Append a command to the agent's pending list and wake its poller.
    pub async fn enqueue(&self, agent_id: &str, command: CommandEnvelope) {
        let mut channels = self.channels.lock().await;
        let slot = channels.entry(agent_id.to_string()).or_default();
        info!(
            agent_id = %agent_id,
            command_id = %command.command_id,
            command_type = %command.command_type,
            "Enqueued command"
        );
        slot.channel.pending.push_back(command);
        slot.notify.notify_one();
    }

    /// Hand out the next command, blocking up to `wait` when the agent has no
    /// work. An empty answer after the timeout is the normal idle outcome.
    pub async fn poll(&self, agent_id: &str, wait: std::time::Duration) -> Option<CommandEnvelope> {
        let wait = wait.min(MAX_POLL_WAIT);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notify = {
                let mut channels = self.channels.lock().await;
                let slot = channels.entry(agent_id.to_string()).or_default();
                if let Some(command) = take_next(&mut slot.channel, Utc::now()) {
                    return Some(command);
                }
                slot.notify.clone()
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                // One last look: an enqueue may have raced the timeout.
                let mut channels = self.channels.lock().await;
                let slot = channels.entry(agent_id.to_string()).or_default();
                return take_next(&mut slot.channel, Utc::now());
            }
        }
    }

    /// Record a result: clear the matching inflight entry and store the result
    /// for pickup. Completing a command that is no longer inflight (a
    /// redelivered duplicate finishing late) keeps the first stored result.
    pub async fn complete(&self, agent_id: &str, result: CommandResult) {
        let now = Utc::now();
        let mut channels = self.channels.lock().await;
        let slot = channels.entry(agent_id.to_string()).or_default();

        let before = slot.channel.inflight.len();
        slot.channel
            .inflight
            .retain(|record| record.command.command_id != result.command_id);
        if slot.channel.inflight.len() == before {
            debug!(
                agent_id = %agent_id,
                command_id = %result.command_id,
                "Result for command not inflight (duplicate completion)"
            );
        }

        slot.channel
            .results
            .entry(result.command_id.clone())
            .or_insert(StoredResult {
                result,
                stored_at: now,
            });

        prune_results(&mut slot.channel, now);
    }

    /// Stored result for `(agent_id, command_id)`, if still retained.
    pub async fn result(&self, agent_id: &str, command_id: &str) -> Option<CommandResult> {
        let mut channels = self.channels.lock().await;
        let slot = channels.get_mut(agent_id)?;
        prune_results(&mut slot.channel, Utc::now());
        slot.channel
            .results
            .get(command_id)
            .map(|stored| stored.result.clone())
    }

    /// Counts used by the status surface and tests.
    pub async fn depth(&self, agent_id: &str) -> (usize, usize) {
        let channels = self.channels.lock().await;
        channels
            .get(agent_id)
            .map(|slot| (slot.channel.pending.len(), slot.channel.inflight.len()))
            .unwrap_or((0, 0))
    }
}

/// Pull the next deliverable command: a timed-out inflight entry first, then
/// the pending head. Refreshes the delivery timestamp either way.
fn take_next(channel: &mut AgentChannel, now: DateTime<Utc>) -> Option<CommandEnvelope> {
    if let Some(record) = channel
        .inflight
        .iter_mut()
        .find(|record| now - record.delivered_at >= REDELIVERY_AFTER)
    {
        warn!(
            command_id = %record.command.command_id,
            "Redelivering inflight command past liveness threshold"
        );
        record.delivered_at = now;
        return Some(record.command.clone());
    }

    let command = channel.pending.pop_front()?;
    channel.inflight.push(InflightRecord {
        command: command.clone(),
        delivered_at: now,
    });
    Some(command)
}

fn prune_results(channel: &mut AgentChannel, now: DateTime<Utc>) {
    let retention = Duration::days(RESULT_RETENTION_DAYS);
    channel
        .results
        .retain(|_, stored| now - stored.stored_at <= retention);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tether_contract::CommandResult;

    fn command(id: &str) -> CommandEnvelope {
        CommandEnvelope {
            command_id: id.to_string(),
            idempotency_key: format!("idem-{id}"),
            command_type: "status".to_string(),
            created_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn delivery_follows_enqueue_order() {
        let queue = CommandQueue::new();
        queue.enqueue("agent-1", command("a")).await;
        queue.enqueue("agent-1", command("b")).await;

        let first = queue.poll("agent-1", std::time::Duration::ZERO).await.unwrap();
        let second = queue.poll("agent-1", std::time::Duration::ZERO).await.unwrap();
        assert_eq!(first.command_id, "a");
        assert_eq!(second.command_id, "b");
        assert_eq!(queue.depth("agent-1").await, (0, 2));
    }

    #[tokio::test]
    async fn empty_poll_times_out_without_error() {
        let queue = CommandQueue::new();
        let got = queue
            .poll("agent-1", std::time::Duration::from_millis(20))
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn poll_wakes_on_enqueue() {
        let queue = Arc::new(CommandQueue::new());
        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .poll("agent-1", std::time::Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.enqueue("agent-1", command("a")).await;
        let got = poller.await.unwrap();
        assert_eq!(got.unwrap().command_id, "a");
    }

    #[tokio::test]
    async fn complete_clears_inflight_and_stores_result() {
        let queue = CommandQueue::new();
        queue.enqueue("agent-1", command("a")).await;
        let cmd = queue.poll("agent-1", std::time::Duration::ZERO).await.unwrap();
        assert_eq!(queue.depth("agent-1").await, (0, 1));

        queue
            .complete("agent-1", CommandResult::success(&cmd.command_id, "done"))
            .await;
        assert_eq!(queue.depth("agent-1").await, (0, 0));

        let stored = queue.result("agent-1", "a").await.unwrap();
        assert!(stored.ok);
        assert_eq!(stored.summary, "done");
    }

    #[tokio::test]
    async fn duplicate_completion_keeps_first_result() {
        let queue = CommandQueue::new();
        queue.enqueue("agent-1", command("a")).await;
        queue.poll("agent-1", std::time::Duration::ZERO).await.unwrap();

        queue
            .complete("agent-1", CommandResult::success("a", "first"))
            .await;
        queue
            .complete("agent-1", CommandResult::success("a", "second"))
            .await;
        let stored = queue.result("agent-1", "a").await.unwrap();
        assert_eq!(stored.summary, "first");
    }

    #[tokio::test]
    async fn agents_are_independent() {
        let queue = CommandQueue::new();
        queue.enqueue("agent-1", command("a")).await;
        let other = queue.poll("agent-2", std::time::Duration::ZERO).await;
        assert!(other.is_none());
        let own = queue.poll("agent-1", std::time::Duration::ZERO).await;
        assert!(own.is_some());
    }

    #[test]
    fn stale_inflight_entry_is_redelivered_once_per_sweep() {
        let mut channel = AgentChannel::default();
        let t0 = Utc::now();
        channel.pending.push_back(command("a"));

        let first = take_next(&mut channel, t0).unwrap();
        assert_eq!(first.command_id, "a");

        // Not yet past the threshold: nothing to hand out.
        let just_before = t0 + REDELIVERY_AFTER - Duration::seconds(1);
        assert!(take_next(&mut channel, just_before).is_none());

        // Past the threshold: the same command comes back and its delivery
        // timestamp resets.
        let after = t0 + REDELIVERY_AFTER;
        let redelivered = take_next(&mut channel, after).unwrap();
        assert_eq!(redelivered.command_id, "a");
        assert!(take_next(&mut channel, after + Duration::seconds(1)).is_none());
    }

    #[test]
    fn results_pruned_after_retention() {
        let mut channel = AgentChannel::default();
        let t0 = Utc::now();
        channel.results.insert(
            "a".to_string(),
            StoredResult {
                result: CommandResult::success("a", "done"),
                stored_at: t0,
            },
        );

        prune_results(&mut channel, t0 + Duration::days(RESULT_RETENTION_DAYS - 1));
        assert!(channel.results.contains_key("a"));

        prune_results(&mut channel, t0 + Duration::days(RESULT_RETENTION_DAYS + 1));
        assert!(!channel.results.contains_key("a"));
    }
}
