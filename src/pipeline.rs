//! Concurrent event pipeline: a single coordinator fans in shutdown,
//! container lifecycle updates, and queued packets.
//!
//! Lifecycle updates mutate shared state inline, so they are strictly
//! ordered with respect to each other. Packet judgments run on blocking
//! worker slots bounded by a semaphore sized to the CPU count; each packet
//! gets exactly one verdict, and draining waits for in-flight judgments.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use netcage_core::container::Container;
use netcage_core::policy;
use netcage_core::{Judge, Verdict};

/// A packet lifted from the kernel queue. The reply closure routes the
/// verdict back to the queue thread and must be called exactly once.
pub struct QueuedPacket {
    pub payload: Vec<u8>,
    pub reply: Box<dyn FnOnce(Verdict) + Send>,
}

/// Container lifecycle transitions relevant for enforcement. IDs are the
/// short (12 character) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Started(String),
    Stopped(String),
    /// The event feed saw a container it could not report properly.
    StartError(String),
}

/// Runtime interface used to hydrate a started container.
pub trait ContainerInspector {
    async fn inspect(&self, id: &str) -> Result<Container>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Draining,
    Stopped,
}

pub struct Pipeline<I> {
    judge: Arc<Judge>,
    inspector: I,
    policy_path: PathBuf,
}

impl<I: ContainerInspector> Pipeline<I> {
    pub fn new(judge: Arc<Judge>, inspector: I, policy_path: PathBuf) -> Self {
        Pipeline {
            judge,
            inspector,
            policy_path,
        }
    }

    /// Runs until `shutdown` resolves or both input channels close, then
    /// drains buffered and in-flight judgments.
    pub async fn run(
        self,
        mut packets: mpsc::Receiver<QueuedPacket>,
        mut events: mpsc::Receiver<LifecycleEvent>,
        shutdown: impl Future<Output = ()>,
    ) {
        let slots = Arc::new(Semaphore::new(num_cpus::get()));
        let mut judgments = JoinSet::new();
        tokio::pin!(shutdown);

        let mut state = State::Running;
        info!("pipeline state: {state:?}");
        while state == State::Running {
            tokio::select! {
                _ = &mut shutdown => state = State::Draining,
                event = events.recv() => match event {
                    Some(event) => self.handle_lifecycle(event).await,
                    None => state = State::Draining,
                },
                packet = packets.recv() => match packet {
                    Some(packet) => self.spawn_judgment(packet, &slots, &mut judgments).await,
                    None => state = State::Draining,
                },
            }
        }
        info!("pipeline state: {state:?}");

        // Already-queued packets still get a verdict each.
        packets.close();
        while let Some(packet) = packets.recv().await {
            self.spawn_judgment(packet, &slots, &mut judgments).await;
        }
        while judgments.join_next().await.is_some() {}

        state = State::Stopped;
        info!("pipeline state: {state:?}");
    }

    async fn spawn_judgment(
        &self,
        packet: QueuedPacket,
        slots: &Arc<Semaphore>,
        judgments: &mut JoinSet<()>,
    ) {
        // Waiting for a slot here backpressures the queue thread through
        // the bounded packet channel.
        let slot = slots
            .clone()
            .acquire_owned()
            .await
            .expect("judgment semaphore closed");
        let judge = self.judge.clone();
        judgments.spawn(async move {
            // Packet attribution reads procfs; keep it off the async workers.
            let result = tokio::task::spawn_blocking(move || {
                let verdict = judge.judge(&packet.payload);
                (packet.reply)(verdict);
            })
            .await;
            if let Err(err) = result {
                warn!("judgment task failed: {err}");
            }
            drop(slot);
        });
    }

    async fn handle_lifecycle(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Started(id) => {
                let container = match self.inspector.inspect(&id).await {
                    Ok(container) => container,
                    Err(err) => {
                        warn!("inspecting started container {id} failed: {err:#}");
                        return;
                    }
                };
                info!("container started: {container}");
                self.judge.registry().add(container);
                self.reload_policy();
                self.judge.flush_caches();
            }
            LifecycleEvent::Stopped(id) => {
                match self.judge.registry().remove(&id) {
                    Some(container) => info!("container stopped: {container}"),
                    None => debug!("stop event for unknown container {id}"),
                }
                self.judge.flush_caches();
            }
            LifecycleEvent::StartError(message) => {
                warn!("container event feed error: {message}");
            }
        }
    }

    /// Re-resolves the policy against the updated container set. A failed
    /// reload keeps the last good policy in force.
    fn reload_policy(&self) {
        match policy::load(&self.policy_path, &self.judge.registry().snapshot()) {
            Ok(policies) => {
                debug!("reloaded {} policies", policies.len());
                self.judge.engine().replace(policies);
            }
            Err(err) => warn!("policy reload failed, keeping current policies: {err}"),
        }
    }
}
