// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper around flume bounded channels, exposing just the blocking
//! operations the coordinator and worker threads use.

use flume::{Receiver, Sender};
use std::time::Duration;

/// Error from a non-blocking send; hands the item back to the caller.
#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

impl<T> BoundedSender<T> {
    /// Blocking send; blocks while the channel is at capacity.
    pub fn send_blocking(&self, item: T) -> Result<(), crate::error::Error> {
        self.tx
            .send(item)
            .map_err(|_| crate::error::Error::ChannelClosed)
    }

    /// Non-blocking send.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(item).map_err(|e| match e {
            flume::TrySendError::Full(item) => TrySendError::Full(item),
            flume::TrySendError::Disconnected(item) => TrySendError::Closed(item),
        })
    }

    /// Number of queued items, used for backpressure pacing.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Blocking receive; `None` once all senders are dropped.
    pub fn recv_blocking(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with timeout; `None` on timeout or disconnect.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}
