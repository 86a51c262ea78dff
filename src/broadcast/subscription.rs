// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::event::Event;
use super::{EvictReason, HubInner, SubscriberId, SubscriberState};

/// Handle for one connected client.
///
/// Yields events as a [`Stream`] until the hub disconnects it (eviction,
/// unsubscribe, hub close). The stream is not restartable: register again
/// to resume. Dropping the handle unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Event>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub(super) fn new(id: SubscriberId, rx: mpsc::Receiver<Event>, hub: Weak<HubInner>) -> Self {
        Self { id, rx, hub }
    }

    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event, or `None` once disconnected and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    #[must_use]
    pub fn state(&self) -> SubscriberState {
        self.hub
            .upgrade()
            .and_then(|hub| hub.state_of(self.id))
            .unwrap_or(SubscriberState::Disconnected)
    }

    /// Explicitly leave the hub.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id, EvictReason::ClientClosed);
        }
        self.rx.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
