//! Progress fan-out for in-flight spawns
//!
//! A [`ProgressChannel`] belongs to one spawn attempt. The driver's progress
//! sequence is pumped into an append-only log; every reader holds its own
//! cursor into that log, starting at the position the log had when the reader
//! attached. Readers that attach before the first event therefore see the
//! whole sequence, and late readers see only what remains.
//!
//! The spawn attempt closes the channel with [`ProgressChannel::finish`]. From
//! then on the pump stops pulling from the driver, late driver events are
//! dropped, and the terminal event passed to `finish` is the last one any
//! reader observes. Driver events that already claim completion are held back
//! so the terminal event always reflects the real outcome.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sh_core::types::ProgressEvent;

/// Stream handed to progress readers
pub type ProgressStream = BoxStream<'static, ProgressEvent>;

#[derive(Debug, Default)]
struct ProgressLog {
    events: Vec<ProgressEvent>,
    finished: bool,
}

/// Single-writer, multi-reader progress pipe for one spawn attempt
pub struct ProgressChannel {
    log: watch::Sender<ProgressLog>,
    cutoff: CancellationToken,
}

impl ProgressChannel {
    /// Create an open, empty channel
    pub fn new() -> Arc<Self> {
        let (log, _) = watch::channel(ProgressLog::default());
        Arc::new(Self {
            log,
            cutoff: CancellationToken::new(),
        })
    }

    /// Sequence used when the driver reports no progress of its own
    pub fn fallback_sequence() -> ProgressStream {
        stream::iter(vec![ProgressEvent::new(50, "Spawning server...")]).boxed()
    }

    /// Append an intermediate event. Returns false once the channel is finished.
    pub fn publish(&self, event: ProgressEvent) -> bool {
        let mut accepted = false;
        self.log.send_if_modified(|log| {
            if log.finished {
                return false;
            }
            log.events.push(event);
            accepted = true;
            true
        });
        accepted
    }

    /// Close the channel with its terminal event.
    ///
    /// Only the first call has an effect; it returns true.
    pub fn finish(&self, mut terminal: ProgressEvent) -> bool {
        self.cutoff.cancel();
        terminal.progress = ProgressEvent::COMPLETE;
        self.log.send_if_modified(|log| {
            if log.finished {
                return false;
            }
            log.events.push(terminal);
            log.finished = true;
            true
        })
    }

    /// Whether the terminal event has been appended
    pub fn is_finished(&self) -> bool {
        self.log.borrow().finished
    }

    /// The terminal event, once finished
    pub fn terminal_event(&self) -> Option<ProgressEvent> {
        let log = self.log.borrow();
        if log.finished {
            log.events.last().cloned()
        } else {
            None
        }
    }

    /// Drive a producer sequence into the log until it ends or the channel finishes
    pub async fn pump(self: Arc<Self>, mut producer: ProgressStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cutoff.cancelled() => break,
                next = producer.next() => next,
            };

            let Some(event) = next else {
                break;
            };

            if event.is_terminal() {
                tracing::debug!("Holding back driver-reported completion: {}", event.message);
                continue;
            }

            tracing::trace!("Progress {}%: {}", event.progress, event.message);
            if !self.publish(event) {
                break;
            }
        }
    }

    /// Attach a reader.
    ///
    /// The reader starts at the current end of the log. If the channel is
    /// already finished it still receives the terminal event.
    pub fn subscribe(&self) -> ProgressStream {
        let rx = self.log.subscribe();
        let start = {
            let log = rx.borrow();
            if log.finished {
                log.events.len().saturating_sub(1)
            } else {
                log.events.len()
            }
        };

        stream::unfold(Some((rx, start)), |state| async move {
            let (mut rx, cursor) = state?;
            loop {
                let (next, finished) = {
                    let log = rx.borrow_and_update();
                    let finished = log.finished;
                    let last = finished && cursor + 1 == log.events.len();
                    let next = log.events.get(cursor).cloned().map(|event| (event, last));
                    (next, finished)
                };

                match next {
                    Some((event, true)) => return Some((event, None)),
                    Some((event, false)) => return Some((event, Some((rx, cursor + 1)))),
                    None if finished => return None,
                    None => {
                        if rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_producer() -> (mpsc::UnboundedSender<ProgressEvent>, ProgressStream) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let producer = stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        (tx, producer)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_full_sequence() {
        let channel = ProgressChannel::new();
        let a = channel.subscribe();
        let b = channel.subscribe();

        channel.publish(ProgressEvent::new(10, "one"));
        channel.publish(ProgressEvent::new(20, "two"));
        channel.finish(ProgressEvent::ready("http://127.0.0.1:9000"));

        let a: Vec<_> = a.collect().await;
        let b: Vec<_> = b.collect().await;
        assert_eq!(a, b);
        assert_eq!(
            a.iter().map(|e| e.progress).collect::<Vec<_>>(),
            vec![10, 20, 100]
        );
        assert_eq!(a[2].ready, Some(true));
    }

    #[tokio::test]
    async fn test_late_reader_gets_remaining_events_only() {
        let channel = ProgressChannel::new();
        channel.publish(ProgressEvent::new(10, "already consumed"));

        let late = channel.subscribe();
        channel.publish(ProgressEvent::new(60, "fresh"));
        channel.finish(ProgressEvent::failed("boom"));

        let events: Vec<_> = late.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "fresh");
        assert_eq!(events[1].failed, Some(true));
    }

    #[tokio::test]
    async fn test_reader_after_finish_gets_terminal_event() {
        let channel = ProgressChannel::new();
        channel.publish(ProgressEvent::new(50, "halfway"));
        channel.finish(ProgressEvent::ready("http://x"));

        let events: Vec<_> = channel.subscribe().collect().await;
        assert_eq!(events, vec![ProgressEvent::ready("http://x")]);
        assert_eq!(channel.terminal_event(), Some(ProgressEvent::ready("http://x")));
    }

    #[tokio::test]
    async fn test_finish_is_first_wins() {
        let channel = ProgressChannel::new();
        assert!(channel.finish(ProgressEvent::ready("http://x")));
        assert!(!channel.finish(ProgressEvent::failed("late")));
        assert!(!channel.publish(ProgressEvent::new(99, "too late")));
        assert_eq!(channel.terminal_event().unwrap().ready, Some(true));
    }

    #[tokio::test]
    async fn test_pump_stops_at_cutoff() {
        let channel = ProgressChannel::new();
        let reader = channel.subscribe();
        let (tx, producer) = channel_producer();
        let pump = tokio::spawn(Arc::clone(&channel).pump(producer));

        tx.send(ProgressEvent::new(1, "Stage 1")).unwrap();
        settle().await;
        channel.finish(ProgressEvent::ready("http://x"));
        pump.await.unwrap();

        // the producer is still going but nobody listens any more
        let _ = tx.send(ProgressEvent::new(2, "Stage 2"));

        let events: Vec<_> = reader.collect().await;
        assert_eq!(
            events.iter().map(|e| e.progress).collect::<Vec<_>>(),
            vec![1, 100]
        );
    }

    #[tokio::test]
    async fn test_pump_holds_back_driver_completion() {
        let channel = ProgressChannel::new();
        let reader = channel.subscribe();
        let producer = stream::iter(vec![
            ProgressEvent::new(40, "working"),
            ProgressEvent::new(100, "driver thinks it is done"),
        ])
        .boxed();

        Arc::clone(&channel).pump(producer).await;
        assert!(!channel.is_finished());
        channel.finish(ProgressEvent::failed("actually it crashed"));

        let events: Vec<_> = reader.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "Spawn failed: actually it crashed");
    }

    #[tokio::test]
    async fn test_reader_waits_for_events() {
        let channel = ProgressChannel::new();
        let mut reader = channel.subscribe();

        let writer = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.publish(ProgressEvent::new(30, "later"));
        });

        let event = tokio::time::timeout(Duration::from_secs(1), reader.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.progress, 30);
    }

    #[tokio::test]
    async fn test_dropped_channel_ends_readers() {
        let channel = ProgressChannel::new();
        let reader = channel.subscribe();
        drop(channel);
        let events: Vec<_> = reader.collect().await;
        assert!(events.is_empty());
    }
}
