//! Owns the netfilter queue socket on a dedicated thread.
//!
//! The nfq handle is not shareable across threads, so one thread does all
//! kernel I/O: it lifts packets into the bounded pipeline channel and
//! returns the verdicts workers send back. Reply closures carry the decided
//! message over a std channel since they run on blocking worker threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use nfq::Queue;
use tokio::sync::mpsc;

use crate::pipeline::QueuedPacket;
use netcage_core::Verdict;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct PacketQueue {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PacketQueue {
    /// Binds the queue and starts the owning thread. `queue_len` caps both
    /// the kernel queue and the returned channel, so at most that many
    /// packets are in flight end to end.
    pub fn bind(queue_num: u16, queue_len: usize) -> Result<(Self, mpsc::Receiver<QueuedPacket>)> {
        let mut queue = Queue::open().context("opening netfilter queue")?;
        queue
            .bind(queue_num)
            .with_context(|| format!("binding netfilter queue {queue_num}"))?;
        queue
            .set_queue_max_len(queue_num, u32::try_from(queue_len).unwrap_or(u32::MAX))
            .with_context(|| format!("sizing netfilter queue {queue_num}"))?;
        queue.set_nonblocking(true);

        let stop = Arc::new(AtomicBool::new(false));
        let (packets, receiver) = mpsc::channel(queue_len);
        let thread = thread::Builder::new()
            .name("nfqueue".into())
            .spawn({
                let stop = stop.clone();
                move || serve(queue, packets, stop)
            })
            .context("spawning the queue thread")?;

        Ok((
            PacketQueue {
                stop,
                thread: Some(thread),
            },
            receiver,
        ))
    }

    /// Stops kernel I/O and waits for the queue thread. Verdicts of packets
    /// already in flight are still delivered before the thread exits.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(mut queue: Queue, packets: mpsc::Sender<QueuedPacket>, stop: Arc<AtomicBool>) {
    let (verdicts, decided) = std_mpsc::channel::<nfq::Message>();

    while !stop.load(Ordering::Relaxed) {
        // Flush decided packets before fetching new ones.
        while let Ok(message) = decided.try_recv() {
            if let Err(err) = queue.verdict(message) {
                warn!("setting verdict failed: {err}");
            }
        }

        let mut message = match queue.recv() {
            Ok(message) => message,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(err) => {
                warn!("reading from netfilter queue failed: {err}");
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        let payload = message.get_payload().to_vec();
        let reply_to = verdicts.clone();
        let reply = Box::new(move |verdict: Verdict| {
            message.set_verdict(match verdict {
                Verdict::Accept => nfq::Verdict::Accept,
                Verdict::Drop => nfq::Verdict::Drop,
            });
            let _ = reply_to.send(message);
        });

        if packets.blocking_send(QueuedPacket { payload, reply }).is_err() {
            debug!("pipeline gone, stopping queue thread");
            break;
        }
    }

    // Wait for the verdicts of everything still being judged. The iterator
    // ends once every reply closure is consumed or dropped.
    drop(packets);
    drop(verdicts);
    for message in decided {
        if let Err(err) = queue.verdict(message) {
            warn!("setting verdict failed: {err}");
        }
    }
}
