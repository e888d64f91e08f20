//! Notification fan-out to live WebSocket sessions.
//!
//! Delivery is best-effort: a failure to push never fails the request
//! that produced the notification. Offline users get a bounded pending
//! queue; under pressure the lowest-priority entry is dropped first,
//! ties broken oldest-first.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, Mutex};

use mq_core::types::{
    FacilityId, MissionId, Notification, NotificationPriority, TenantId, UserId, VipTier,
};

/// Live broadcast channel capacity per user; lagging receivers lose
/// the oldest messages.
const CHANNEL_CAPACITY: usize = 64;

/// Default bound for the offline pending queue.
const DEFAULT_QUEUE_BOUND: usize = 256;

/// Messages pushed over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    CoinCollected { coins: u64, xp: u64 },
    MissionReady { mission_id: MissionId },
    LevelUp { from: u32, to: u32 },
    VipTierUp { from: VipTier, to: VipTier },
    Notification { notification: Notification },
    EmpireIncomeReady { facility_id: FacilityId, pending: u64 },
    Pong,
}

struct UserChannel {
    sender: broadcast::Sender<PushMessage>,
    pending: VecDeque<(NotificationPriority, PushMessage)>,
}

impl UserChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            pending: VecDeque::new(),
        }
    }
}

/// Per-user fan-out hub shared by the coordinator, the scheduler and
/// the WebSocket layer.
pub struct NotificationHub {
    channels: Mutex<HashMap<(String, String), UserChannel>>,
    queue_bound: usize,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_BOUND)
    }
}

impl NotificationHub {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            queue_bound: queue_bound.max(1),
        }
    }

    fn key(tenant: &TenantId, user: &UserId) -> (String, String) {
        (tenant.as_str().to_string(), user.as_str().to_string())
    }

    /// Subscribe a live session. Pending messages queued while the
    /// user was offline are flushed into the channel first.
    pub async fn subscribe(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> broadcast::Receiver<PushMessage> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(Self::key(tenant, user))
            .or_insert_with(UserChannel::new);
        let receiver = channel.sender.subscribe();
        for (_, message) in channel.pending.drain(..) {
            let _ = channel.sender.send(message);
        }
        receiver
    }

    /// Push one message; queues it when no live session is attached.
    pub async fn push(
        &self,
        tenant: &TenantId,
        user: &UserId,
        priority: NotificationPriority,
        message: PushMessage,
    ) {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .entry(Self::key(tenant, user))
            .or_insert_with(UserChannel::new);

        if channel.sender.receiver_count() > 0 {
            let _ = channel.sender.send(message);
            return;
        }

        if channel.pending.len() >= self.queue_bound {
            // Drop the lowest-priority entry, oldest-first.
            let victim = channel
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(index, (priority, _))| (*priority, *index))
                .map(|(index, _)| index);
            match victim {
                Some(index)
                    if channel.pending[index].0 <= priority =>
                {
                    channel.pending.remove(index);
                }
                _ => return, // Incoming message is the lowest priority.
            }
        }
        channel.pending.push_back((priority, message));
    }

    /// Number of queued (offline) messages for a user.
    pub async fn pending_len(&self, tenant: &TenantId, user: &UserId) -> usize {
        let channels = self.channels.lock().await;
        channels
            .get(&Self::key(tenant, user))
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }

    /// Drop channels with no live receivers and no pending messages.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, channel| {
            channel.sender.receiver_count() > 0 || !channel.pending.is_empty()
        });
    }
}
