//! Transport trait and the in-process channel implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::scheduler::TaskDefinition;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Payload dispatched to an agent for one task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub envelope_id: String,
    pub task_id: String,
    pub task_name: String,
    pub task_type: String,
    pub attempt_number: u32,
    pub input_data: serde_json::Value,
}

impl TaskEnvelope {
    pub fn for_attempt(definition: &TaskDefinition, attempt_number: u32) -> Self {
        Self {
            envelope_id: Uuid::new_v4().to_string(),
            task_id: definition.task_id.clone(),
            task_name: definition.task_name.clone(),
            task_type: definition.task_type.clone(),
            attempt_number,
            input_data: definition.input_data.clone(),
        }
    }
}

/// Agent acknowledgement for a dispatched envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAck {
    pub envelope_id: String,
    pub agent_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Transport used by the orchestrator to deliver task payloads.
///
/// Implementations guarantee at most one in-flight send per task attempt and
/// a bounded-time ack; the orchestrator additionally bounds every send with
/// its own dispatch timeout.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, envelope: TaskEnvelope, target_agent_id: &str) -> Result<DispatchAck>;
}

#[derive(Debug, Clone)]
enum TransportFrame {
    Dispatch {
        envelope: TaskEnvelope,
        target: String,
    },
    Ack(DispatchAck),
}

/// In-process transport on a broadcast channel.
///
/// Suitable for tests and single-process deployments; a broker-backed
/// transport implements the same trait behind the same contract.
pub struct ChannelTransport {
    sender: broadcast::Sender<TransportFrame>,
    ack_timeout: Duration,
}

impl ChannelTransport {
    pub fn new(capacity: usize, ack_timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            ack_timeout,
        }
    }

    /// Subscribe an agent to its dispatched envelopes.
    pub fn subscribe(&self, agent_id: impl Into<String>) -> AgentMailbox {
        AgentMailbox {
            agent_id: agent_id.into(),
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, Duration::from_secs(5))
    }
}

#[async_trait]
impl MessageTransport for ChannelTransport {
    async fn send(&self, envelope: TaskEnvelope, target_agent_id: &str) -> Result<DispatchAck> {
        let envelope_id = envelope.envelope_id.clone();
        let mut receiver = self.sender.subscribe();

        self.sender
            .send(TransportFrame::Dispatch {
                envelope,
                target: target_agent_id.to_string(),
            })
            .map_err(|_| MeshError::Transport("No active receivers".into()))?;

        tokio::time::timeout(self.ack_timeout, async {
            loop {
                match receiver.recv().await {
                    Ok(TransportFrame::Ack(ack)) if ack.envelope_id == envelope_id => {
                        return Ok(ack);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MeshError::Transport("Channel closed".into()));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Ack receiver lagged");
                        continue;
                    }
                }
            }
        })
        .await
        .map_err(|_| MeshError::Timeout("Dispatch ack timed out".into()))?
    }
}

/// Receiving side of the channel transport for one agent.
pub struct AgentMailbox {
    agent_id: String,
    receiver: broadcast::Receiver<TransportFrame>,
    sender: broadcast::Sender<TransportFrame>,
}

impl AgentMailbox {
    /// Next envelope addressed to this agent, or `None` when the channel is
    /// closed.
    pub async fn recv(&mut self) -> Option<TaskEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(TransportFrame::Dispatch { envelope, target }) if target == self.agent_id => {
                    return Some(envelope);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(agent = %self.agent_id, skipped = n, "Mailbox lagged");
                    continue;
                }
            }
        }
    }

    /// Acknowledge a received envelope.
    pub fn ack(&self, envelope: &TaskEnvelope, accepted: bool) -> Result<()> {
        self.sender
            .send(TransportFrame::Ack(DispatchAck {
                envelope_id: envelope.envelope_id.clone(),
                agent_id: self.agent_id.clone(),
                accepted,
                message: None,
            }))
            .map_err(|_| MeshError::Transport("No active receivers".into()))?;
        Ok(())
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(task_id: &str) -> TaskEnvelope {
        let def = TaskDefinition::new("work", "t");
        let mut env = TaskEnvelope::for_attempt(&def, 1);
        env.task_id = task_id.to_string();
        env
    }

    #[tokio::test]
    async fn test_dispatch_and_ack() {
        let transport = ChannelTransport::default();
        let mut mailbox = transport.subscribe("agent-1");

        let worker = tokio::spawn(async move {
            let envelope = mailbox.recv().await.unwrap();
            mailbox.ack(&envelope, true).unwrap();
            envelope.task_id
        });

        let ack = transport.send(envelope("t1"), "agent-1").await.unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.agent_id, "agent-1");
        assert_eq!(worker.await.unwrap(), "t1");
    }

    #[tokio::test]
    async fn test_envelope_ignored_by_other_agents() {
        let transport = ChannelTransport::new(16, Duration::from_millis(100));
        let mut other = transport.subscribe("agent-2");
        let mut target = transport.subscribe("agent-1");

        tokio::spawn(async move {
            let envelope = target.recv().await.unwrap();
            target.ack(&envelope, true).unwrap();
        });

        let ack = transport.send(envelope("t1"), "agent-1").await.unwrap();
        assert_eq!(ack.agent_id, "agent-1");

        // The other mailbox saw nothing addressed to it.
        let nothing = tokio::time::timeout(Duration::from_millis(50), other.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let transport = ChannelTransport::new(16, Duration::from_millis(50));
        let _mailbox = transport.subscribe("agent-1");

        // Nobody acks: send must time out, not hang.
        let result = transport.send(envelope("t1"), "agent-1").await;
        assert!(matches!(result, Err(MeshError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_rejected_ack_propagates() {
        let transport = ChannelTransport::default();
        let mut mailbox = transport.subscribe("agent-1");

        tokio::spawn(async move {
            let envelope = mailbox.recv().await.unwrap();
            mailbox.ack(&envelope, false).unwrap();
        });

        let ack = transport.send(envelope("t1"), "agent-1").await.unwrap();
        assert!(!ack.accepted);
    }
}
