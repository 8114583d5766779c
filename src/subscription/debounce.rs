//! Coalescing of bursty change events into one invalidation pass per
//! resource type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostpilot_realtime_types::ResourceType;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::cache::{CacheManager, InvalidateOptions};

/// Receives the drained resource types.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    async fn invalidate(&self, resource: ResourceType);
}

#[async_trait]
impl InvalidationSink for CacheManager {
    async fn invalidate(&self, resource: ResourceType) {
        self.invalidate_resource(resource, InvalidateOptions::default())
            .await;
    }
}

/// Pending invalidation set and its timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending {
        resources: Vec<ResourceType>,
        deadline: Instant,
    },
    Draining,
}

/// Debounce state machine driven by a single deadline.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> &DebounceState {
        &self.state
    }

    /// Add `resource` to the pending set and restart the window.
    pub fn push(&mut self, resource: ResourceType, now: Instant) {
        let deadline = now + self.window;
        match &mut self.state {
            DebounceState::Pending {
                resources,
                deadline: current,
            } => {
                if !resources.contains(&resource) {
                    resources.push(resource);
                }
                *current = deadline;
            }
            DebounceState::Idle | DebounceState::Draining => {
                self.state = DebounceState::Pending {
                    resources: vec![resource],
                    deadline,
                };
            }
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            DebounceState::Pending { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// Take the pending set and enter `Draining`.
    pub fn fire(&mut self) -> Vec<ResourceType> {
        match std::mem::replace(&mut self.state, DebounceState::Draining) {
            DebounceState::Pending { resources, .. } => resources,
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }

    /// Leave `Draining`; pushes made while draining stay pending.
    pub fn finish(&mut self) {
        if self.state == DebounceState::Draining {
            self.state = DebounceState::Idle;
        }
    }
}

/// Run the debouncer until `events` closes, then drain what is pending.
pub(crate) async fn run_debouncer(
    window: Duration,
    mut events: mpsc::UnboundedReceiver<ResourceType>,
    sink: Arc<dyn InvalidationSink>,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        // The sleep future is built even when the branch is disabled.
        let deadline = debouncer.deadline();
        let timer = sleep_until(deadline.unwrap_or_else(Instant::now));

        tokio::select! {
            received = events.recv() => match received {
                Some(resource) => debouncer.push(resource, Instant::now()),
                None => break,
            },
            _ = timer, if deadline.is_some() => {
                drain(&mut debouncer, sink.as_ref()).await;
            }
        }
    }
    drain(&mut debouncer, sink.as_ref()).await;
}

async fn drain(debouncer: &mut Debouncer, sink: &dyn InvalidationSink) {
    let batch = debouncer.fire();
    if !batch.is_empty() {
        debug!(resources = ?batch, "Draining pending invalidations");
    }
    for resource in batch {
        sink.invalidate(resource).await;
    }
    debouncer.finish();
}
