//! Typed watch streams.
//!
//! A spawned pump task reads the backend change stream, decodes and filters
//! each change and forwards the result over a bounded channel. The consumer
//! holds a [`Watcher`]; cancelling it (or dropping it) stops the pump.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kiln_core::{StoreResult, WatchEvent};

use crate::backend::{BackendWatchStream, RawEvent, RawEventKind};
use crate::matcher::SelectionPredicate;
use crate::Object;

pub struct Watcher<K> {
    rx: mpsc::Receiver<StoreResult<WatchEvent<K>>>,
    token: CancellationToken,
}

impl<K> Unpin for Watcher<K> {}

impl<K> Watcher<K> {
    pub(crate) fn new(rx: mpsc::Receiver<StoreResult<WatchEvent<K>>>, token: CancellationToken) -> Self {
        Self { rx, token }
    }

    /// Stop delivery. Events already queued are discarded.
    pub fn cancel(&self) { self.token.cancel() }
    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }
    pub fn cancel_token(&self) -> CancellationToken { self.token.clone() }

    /// Next event, `None` once the watch ended or was cancelled.
    pub async fn recv(&mut self) -> Option<StoreResult<WatchEvent<K>>> {
        if self.token.is_cancelled() {
            self.rx.close();
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            ev = self.rx.recv() => ev,
        }
    }
}

impl<K> Stream for Watcher<K> {
    type Item = StoreResult<WatchEvent<K>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.rx.close();
            return Poll::Ready(None);
        }
        this.rx.poll_recv(cx)
    }
}

impl<K> Drop for Watcher<K> {
    fn drop(&mut self) { self.token.cancel() }
}

/// Turn one backend change into the event a predicate-filtered watcher sees.
/// Leaving the matched set is a `Deleted` of the previous state, entering it
/// an `Added`.
pub(crate) fn translate<K, D>(ev: &RawEvent, decode: &D, pred: &SelectionPredicate<K>) -> StoreResult<Option<WatchEvent<K>>>
where
    K: Object,
    D: Fn(&[u8], u64) -> StoreResult<K>,
{
    let cur = match (ev.kind, &ev.value) {
        (RawEventKind::Put, Some(v)) => Some(decode(v, ev.revision)?),
        _ => None,
    };
    let prev = match &ev.prev_value {
        Some(v) => Some(decode(v, ev.revision)?),
        None => None,
    };
    let cur = cur.filter(|o| pred.matches(o));
    let prev = prev.filter(|o| pred.matches(o));
    Ok(match (ev.kind, prev, cur) {
        (RawEventKind::Put, None, Some(c)) => Some(WatchEvent::Added(c)),
        (RawEventKind::Put, Some(_), Some(c)) => Some(WatchEvent::Modified(c)),
        (RawEventKind::Put, Some(p), None) => Some(WatchEvent::Deleted(p)),
        (RawEventKind::Delete, Some(p), _) => Some(WatchEvent::Deleted(p)),
        _ => None,
    })
}

pub(crate) struct PumpConfig<K: Object> {
    pub resource: String,
    pub pred: SelectionPredicate<K>,
    /// Deliver changes of this key only.
    pub exact_key: Option<String>,
    pub capacity: usize,
}

pub(crate) fn spawn_pump<K, D>(cfg: PumpConfig<K>, initial: Vec<K>, mut events: BackendWatchStream, decode: D) -> Watcher<K>
where
    K: Object,
    D: Fn(&[u8], u64) -> StoreResult<K> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(cfg.capacity.max(1));
    let token = CancellationToken::new();
    let stop = token.clone();
    let PumpConfig { resource, pred, exact_key, .. } = cfg;

    tokio::spawn(async move {
        for obj in initial {
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = tx.send(Ok(WatchEvent::Added(obj))) => if sent.is_err() { return },
            }
        }
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = events.next() => next,
            };
            let Some(item) = next else { break };
            let out = match item {
                Ok(ev) => {
                    if exact_key.as_deref().map_or(false, |k| k != ev.key) {
                        continue;
                    }
                    match translate(&ev, &decode, &pred) {
                        Ok(Some(e)) => Ok(e),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e.into_store_error(&resource, "")),
            };
            let fatal = out.is_err();
            match &out {
                Ok(_) => metrics::counter!("watch_events_total", 1u64, "resource" => resource.clone()),
                Err(e) => warn!(resource = %resource, error = %e, "store: watch failed"),
            }
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sent = tx.send(out) => if sent.is_err() { break },
            }
            if fatal {
                break;
            }
        }
        debug!(resource = %resource, "store: watch closed");
    });

    Watcher::new(rx, token)
}
