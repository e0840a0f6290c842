use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::trace;


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendMode {
    Normal,
    /// Copies for logging connections. These may be dropped if the connection is busy.
    Log,
}

/// the result of a send, passed to its completion callback
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketOutcome {
    pub num_targets: usize,
    pub num_failed: usize,
}

pub type CompletionCallback = Box<dyn FnOnce(PacketOutcome) + Send>;

/// Tracks one outgoing message across all destination connections it was handed to. The
///  packet completes when every destination is done with it, successfully or not, and the
///  completion callback runs exactly once at that point.
pub struct Packet {
    id: u64,
    mode: SendMode,
    num_targets: usize,
    remaining: AtomicUsize,
    failed: AtomicUsize,
    on_completion: Mutex<Option<CompletionCallback>>,
    done: watch::Sender<bool>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{#{}:{:?}:{}/{}}}", self.id, self.mode, self.remaining.load(Ordering::Acquire), self.num_targets)
    }
}

impl Packet {
    /// Creates a packet for `num_targets` destinations, returning one [PacketRef] per
    ///  destination. A packet without destinations is complete immediately.
    pub fn start(id: u64, mode: SendMode, num_targets: usize, on_completion: Option<CompletionCallback>) -> (Arc<Packet>, Vec<PacketRef>) {
        let (done, _) = watch::channel(false);
        let packet = Arc::new(Packet {
            id,
            mode,
            num_targets,
            remaining: AtomicUsize::new(num_targets),
            failed: AtomicUsize::new(0),
            on_completion: Mutex::new(on_completion),
            done,
        });

        if num_targets == 0 {
            packet.complete();
        }

        let refs = (0..num_targets)
            .map(|_| PacketRef { packet: packet.clone(), failed: false })
            .collect();
        (packet, refs)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> SendMode {
        self.mode
    }

    pub fn is_complete(&self) -> bool {
        *self.done.borrow()
    }

    pub fn outcome(&self) -> PacketOutcome {
        PacketOutcome {
            num_targets: self.num_targets,
            num_failed: self.failed.load(Ordering::Acquire),
        }
    }

    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = done.wait_for(|d| *d).await;
    }

    fn target_done(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::AcqRel);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete();
        }
    }

    fn complete(&self) {
        trace!("{:?} complete", self);
        let callback = match self.on_completion.lock() {
            Ok(mut callback) => callback.take(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback(self.outcome());
        }
        self.done.send_replace(true);
    }
}

/// One destination's share of a [Packet]. Dropping it marks the destination as done, so a
///  message that is discarded with its queue still completes its packet.
pub struct PacketRef {
    packet: Arc<Packet>,
    failed: bool,
}

impl PacketRef {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

impl Drop for PacketRef {
    fn drop(&mut self) {
        self.packet.target_done(self.failed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    fn counting_callback() -> (Arc<AtomicU32>, Arc<Mutex<Option<PacketOutcome>>>, CompletionCallback) {
        let count = Arc::new(AtomicU32::new(0));
        let outcome = Arc::new(Mutex::new(None));
        let count_clone = count.clone();
        let outcome_clone = outcome.clone();
        let callback: CompletionCallback = Box::new(move |o| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            *outcome_clone.lock().unwrap() = Some(o);
        });
        (count, outcome, callback)
    }

    #[rstest]
    #[case::none(0, 0)]
    #[case::one(1, 0)]
    #[case::five(5, 0)]
    #[case::five_with_failures(5, 2)]
    fn test_completion_runs_once(#[case] num_targets: usize, #[case] num_failed: usize) {
        let (count, outcome, callback) = counting_callback();
        let (packet, refs) = Packet::start(1, SendMode::Normal, num_targets, Some(callback));
        assert_eq!(refs.len(), num_targets);
        assert_eq!(packet.is_complete(), num_targets == 0);

        for (i, mut r) in refs.into_iter().enumerate() {
            assert_eq!(count.load(Ordering::SeqCst), 0);
            if i < num_failed {
                r.mark_failed();
            }
            drop(r);
        }

        assert!(packet.is_complete());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*outcome.lock().unwrap(), Some(PacketOutcome { num_targets, num_failed }));
    }

    #[tokio::test]
    async fn test_wait() {
        let (packet, mut refs) = Packet::start(2, SendMode::Log, 2, None);
        let r1 = refs.pop().unwrap();
        let r2 = refs.pop().unwrap();

        let waiter = {
            let packet = packet.clone();
            tokio::spawn(async move { packet.wait().await })
        };

        drop(r1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(r2);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(packet.mode(), SendMode::Log);
    }

    #[tokio::test]
    async fn test_refs_completed_on_other_tasks() {
        let (count, _, callback) = counting_callback();
        let (packet, refs) = Packet::start(3, SendMode::Normal, 20, Some(callback));

        let handles: Vec<_> = refs.into_iter()
            .map(|r| tokio::spawn(async move { drop(r) }))
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        packet.wait().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
