use crate::worker::WorkerHandle;
use fanout_core::{FinalResult, OutputEvent};
use futures_util::future::join_all;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Arrival-ordered multiplex of several workers' event channels.
///
/// Each poll scans the sources round-robin, starting just after the source
/// that yielded last, so one worker with a backlog cannot starve the others.
/// The first scan starts at index 0. A source is retired after its terminal
/// event or when its channel closes; the stream ends once every source is
/// retired.
pub struct MergedEvents {
    sources: Vec<Option<mpsc::Receiver<OutputEvent>>>,
    start: usize,
}

impl MergedEvents {
    /// Merge receivers, given in worker-index order.
    pub fn new(sources: Vec<mpsc::Receiver<OutputEvent>>) -> Self {
        Self {
            sources: sources.into_iter().map(Some).collect(),
            start: 0,
        }
    }

    /// Number of sources that have not yet finished.
    pub fn active_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }
}

impl Stream for MergedEvents {
    type Item = OutputEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let len = this.sources.len();
        let mut pending = false;
        for offset in 0..len {
            let position = (this.start + offset) % len;
            let slot = &mut this.sources[position];
            let Some(rx) = slot else {
                continue;
            };
            match rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if event.is_terminal() {
                        *slot = None;
                    }
                    this.start = (position + 1) % len;
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => *slot = None,
                Poll::Pending => pending = true,
            }
        }
        if pending {
            Poll::Pending
        } else {
            Poll::Ready(None)
        }
    }
}

/// Combines worker handles into a merged stream or a final result mapping.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Merge the live event channels of `handles`.
    ///
    /// Handles whose channel was already taken contribute nothing.
    pub fn merge(handles: &[WorkerHandle]) -> MergedEvents {
        MergedEvents::new(
            handles
                .iter()
                .filter_map(WorkerHandle::take_events)
                .collect(),
        )
    }

    /// Wait for every handle to finish, up to `timeout` overall.
    ///
    /// Workers still running at the deadline are expired and recorded as
    /// `TimedOut`. The mapping always holds one entry per handle.
    pub async fn collect(
        handles: &[WorkerHandle],
        timeout: Duration,
    ) -> BTreeMap<usize, FinalResult> {
        // Untaken channels would otherwise stall workers once they fill.
        for handle in handles {
            handle.detach_events();
        }

        let all = join_all(handles.iter().map(|h| h.wait_terminal()));
        let results = match tokio::time::timeout(timeout, all).await {
            Ok(results) => results,
            Err(_) => {
                let stragglers: Vec<usize> = handles
                    .iter()
                    .filter(|h| !h.state().is_terminal())
                    .map(WorkerHandle::index)
                    .collect();
                warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    ?stragglers,
                    "Batch deadline elapsed, expiring running workers"
                );
                for handle in handles {
                    handle.expire(timeout);
                }
                join_all(handles.iter().map(|h| h.wait_terminal())).await
            }
        };

        handles
            .iter()
            .map(WorkerHandle::index)
            .zip(results)
            .collect()
    }
}
