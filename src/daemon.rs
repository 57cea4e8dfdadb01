//! Daemon bootstrap: seed state from the runtime, bind the queue, divert
//! traffic, run the pipeline, and restore the host on the way out.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use log::{info, warn};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use netcage_core::Judge;
use netcage_core::container::{Container, ContainerRegistry};
use netcage_core::policy::{self, PolicyEngine};
use netcage_core::proc::ProcessResolver;
use netcage_docker::DockerClient;
use netcage_docker::client::daemon_pid;

use crate::cli::NetcageOpts;
use crate::iptables::NfqueueRule;
use crate::notify;
use crate::pipeline::{ContainerInspector, Pipeline};
use crate::queue::PacketQueue;

impl ContainerInspector for DockerClient {
    async fn inspect(&self, id: &str) -> Result<Container> {
        Ok(DockerClient::inspect(self, id).await?)
    }
}

pub async fn run(options: NetcageOpts) -> Result<()> {
    log::trace!("Netcage options: {options:?}");

    let is_root = nix::unistd::Uid::effective().is_root();
    ensure!(is_root, "You must run this as root user!!!");

    let client =
        DockerClient::unix(options.docker_socket.clone()).context("connecting to docker")?;

    // Seed the registry with whatever is already running.
    let registry = Arc::new(ContainerRegistry::default());
    for id in client
        .running_containers()
        .await
        .context("listing containers")?
    {
        match client.inspect(&id).await {
            Ok(container) => {
                info!("enforcing {container}");
                registry.add(container);
            }
            Err(err) => warn!("skipping container {id}: {err:#}"),
        }
    }

    // A policy that does not load at startup is fatal; later reloads fall
    // back to the last good one instead.
    let policies = policy::load(&options.policy, &registry.snapshot())
        .with_context(|| format!("loading policy from {}", options.policy.display()))?;
    info!(
        "loaded {} container policies from {}",
        policies.len(),
        options.policy.display()
    );

    let trusted_dns_pid = if options.no_trust_runtime_dns {
        None
    } else {
        match daemon_pid(&options.docker_pidfile) {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!("runtime DNS exemption disabled: {err:#}");
                None
            }
        }
    };

    let judge = Arc::new(Judge::new(
        registry,
        ProcessResolver::new(),
        PolicyEngine::new(policies, trusted_dns_pid),
    ));

    let (queue, packets) = PacketQueue::bind(options.queue_num, options.queue_len)?;
    let rule = NfqueueRule::new(&options.chain, options.queue_num);
    if let Err(err) = rule.install() {
        queue.shutdown();
        return Err(err.context("installing the NFQUEUE rule"));
    }

    let (updates, events) = mpsc::channel(16);
    let notifier = tokio::spawn({
        let client = client.clone();
        async move {
            if let Err(err) = notify::watch(client, updates).await {
                warn!("event feed failed: {err:#}");
            }
        }
    });

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sig_int.recv() => info!("SIGINT received"),
            _ = sig_term.recv() => info!("SIGTERM received"),
        }
    };

    Pipeline::new(judge, client, options.policy.clone())
        .run(packets, events, shutdown)
        .await;

    notifier.abort();
    queue.shutdown();
    if let Err(err) = rule.remove() {
        warn!("removing the NFQUEUE rule failed: {err:#}");
    }
    Ok(())
}
