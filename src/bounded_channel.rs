// SPDX-License-Identifier: Apache-2.0

use flume::{Receiver, Sender, TrySendError as FlumeTrySendError};
use std::fmt;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

/// Returned from [`BoundedSender::try_send`], hands the rejected item back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    Full(T),
    Disconnected(T),
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Disconnected(_) => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    /// Non-blocking send, never waits for capacity.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(FlumeTrySendError::Full(item)) => Err(TrySendError::Full(item)),
            Err(FlumeTrySendError::Disconnected(item)) => Err(TrySendError::Disconnected(item)),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Takes up to `max` queued items in FIFO order without waiting.
    pub fn drain_up_to(&self, max: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max.min(self.rx.len()));
        while items.len() < max {
            match self.rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}
