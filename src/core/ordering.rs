// src/core/ordering.rs

//! The indexed ordering monitor behind both the total-order queue and the
//! commit queue.
//!
//! A [`TotalOrder`] serializes critical sections by a strictly increasing
//! sequence number: at any moment exactly one position is admissible, and a
//! task that wants position `k` parks until every position below `k` has
//! been released or cancelled. The same primitive is instantiated twice by
//! the engine — once for the certification critical section (the
//! "total-order queue") and once for the commit critical section — because
//! the two phases are ordered independently.
//!
//! Positions live in a fixed ring sized at construction; a grab for a
//! position beyond the ring window parks on an internal notifier and
//! resumes when the window advances, so callers never see a "try again"
//! error and never spin.

use crate::core::seqno::Seqno;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

/// Why an ordering-monitor operation did not take the slot.
///
/// `Interrupted` and `Canceled` are expected protocol signals (brute-force
/// abort and cooperative skip); everything else means the caller broke the
/// usage discipline and is treated as fatal by the engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingError {
    /// A waiting grab was woken by `interrupt`. The position is left
    /// unclaimed; a later grab or a self-cancel must consume it.
    #[error("interrupted while waiting for position {0}")]
    Interrupted(Seqno),

    /// The position was marked passed-without-work by `self_cancel`.
    #[error("position {0} was canceled")]
    Canceled(Seqno),

    /// The position was already traversed.
    #[error("position {0} already passed (current position {1})")]
    Passed(Seqno, Seqno),

    /// `release` was called for a position the caller does not hold.
    #[error("position {0} is not held")]
    NotHeld(Seqno),

    /// Another task already grabbed or is waiting for the position.
    #[error("position {0} is already claimed")]
    Claimed(Seqno),
}

/// What the admission side tells a parked grabber.
enum Admission {
    Granted,
    Interrupted,
}

/// Per-position bookkeeping inside the ring.
enum Slot {
    /// Nothing recorded for the position yet.
    Vacant,
    /// A grab is parked, to be admitted when the position becomes current.
    Waiting(oneshot::Sender<Admission>),
    /// `interrupt` arrived before the grab; the next grab fails once.
    Interrupted,
    /// `self_cancel` marked the position; it is skipped when reached.
    Canceled,
}

struct Inner {
    /// The position that is currently admissible (or held).
    current: Seqno,
    /// Whether `current` is owned by a grabber right now.
    held: bool,
    slots: Vec<Slot>,
}

impl Inner {
    fn slot_mut(&mut self, seqno: Seqno) -> &mut Slot {
        let idx = (seqno as usize) % self.slots.len();
        &mut self.slots[idx]
    }

    fn in_window(&self, seqno: Seqno) -> bool {
        seqno < self.current + self.slots.len() as Seqno
    }

    /// Consumes the current position and moves forward, skipping cancelled
    /// positions and admitting the next parked grabber if there is one.
    /// An `Interrupted` mark does not auto-skip: the recovery path must
    /// either re-grab or self-cancel that position.
    fn advance(&mut self) {
        self.held = false;
        self.current += 1;
        loop {
            match std::mem::replace(self.slot_mut(self.current), Slot::Vacant) {
                Slot::Canceled => {
                    self.current += 1;
                }
                Slot::Waiting(tx) => {
                    self.held = true;
                    // A dropped receiver means the grabber went away; the
                    // position stays held until the engine aborts, which is
                    // the correct fate for an abandoned critical section.
                    let _ = tx.send(Admission::Granted);
                    return;
                }
                Slot::Vacant => return,
                Slot::Interrupted => {
                    *self.slot_mut(self.current) = Slot::Interrupted;
                    return;
                }
            }
        }
    }
}

/// A monitor admitting one holder at a time in sequence-number order.
pub struct TotalOrder {
    name: &'static str,
    inner: Mutex<Inner>,
    /// Signalled whenever `current` advances, re-waking tasks whose target
    /// position was beyond the ring window.
    window_moved: Notify,
}

impl TotalOrder {
    /// Creates a monitor whose first admissible position is `start` and
    /// whose ring holds `capacity` positions.
    pub fn new(name: &'static str, capacity: usize, start: Seqno) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Vacant);
        Self {
            name,
            inner: Mutex::new(Inner {
                current: start,
                held: false,
                slots,
            }),
            window_moved: Notify::new(),
        }
    }

    /// The position that would be admitted next (for logs and tests).
    pub fn current(&self) -> Seqno {
        self.inner.lock().current
    }

    /// Blocks until `seqno` becomes the current position and takes
    /// ownership of it. Fails with [`OrderingError::Interrupted`] if the
    /// wait was broken by [`interrupt`](Self::interrupt), or with
    /// [`OrderingError::Canceled`] if the position was self-cancelled.
    pub async fn grab(&self, seqno: Seqno) -> Result<(), OrderingError> {
        let rx = loop {
            let notified = {
                let mut inner = self.inner.lock();
                if seqno < inner.current {
                    return Err(OrderingError::Passed(seqno, inner.current));
                }
                if !inner.in_window(seqno) {
                    let mut notified = Box::pin(self.window_moved.notified());
                    notified.as_mut().enable();
                    notified
                } else if seqno == inner.current && inner.held {
                    return Err(OrderingError::Claimed(seqno));
                } else if seqno == inner.current {
                    match std::mem::replace(inner.slot_mut(seqno), Slot::Vacant) {
                        Slot::Vacant => {
                            inner.held = true;
                            return Ok(());
                        }
                        Slot::Interrupted => return Err(OrderingError::Interrupted(seqno)),
                        Slot::Canceled => {
                            // Skipped position racing with a late grab: put the
                            // mark back so advance() still skips it.
                            *inner.slot_mut(seqno) = Slot::Canceled;
                            return Err(OrderingError::Canceled(seqno));
                        }
                        Slot::Waiting(_) => return Err(OrderingError::Claimed(seqno)),
                    }
                } else {
                    let slot = inner.slot_mut(seqno);
                    match slot {
                        Slot::Vacant => {
                            let (tx, rx) = oneshot::channel();
                            *slot = Slot::Waiting(tx);
                            break rx;
                        }
                        Slot::Interrupted => {
                            *slot = Slot::Vacant;
                            return Err(OrderingError::Interrupted(seqno));
                        }
                        Slot::Canceled => return Err(OrderingError::Canceled(seqno)),
                        Slot::Waiting(_) => return Err(OrderingError::Claimed(seqno)),
                    }
                }
            };
            notified.await;
        };

        match rx.await {
            Ok(Admission::Granted) => Ok(()),
            Ok(Admission::Interrupted) => Err(OrderingError::Interrupted(seqno)),
            // The monitor was dropped while we waited.
            Err(_) => Err(OrderingError::Canceled(seqno)),
        }
    }

    /// Releases position `seqno`, advancing the monitor. Caller must hold
    /// the position via a successful [`grab`](Self::grab).
    pub fn release(&self, seqno: Seqno) -> Result<(), OrderingError> {
        let mut inner = self.inner.lock();
        if seqno != inner.current || !inner.held {
            return Err(OrderingError::NotHeld(seqno));
        }
        inner.advance();
        drop(inner);
        self.window_moved.notify_waiters();
        Ok(())
    }

    /// Marks position `seqno` as passed without work, equivalent to
    /// `grab(seqno); release(seqno)` but without waiting for the turn.
    pub async fn self_cancel(&self, seqno: Seqno) -> Result<(), OrderingError> {
        loop {
            let notified = {
                let mut inner = self.inner.lock();
                if seqno < inner.current {
                    return Err(OrderingError::Passed(seqno, inner.current));
                }
                if !inner.in_window(seqno) {
                    let mut notified = Box::pin(self.window_moved.notified());
                    notified.as_mut().enable();
                    notified
                } else if seqno == inner.current {
                    if inner.held {
                        return Err(OrderingError::Claimed(seqno));
                    }
                    inner.advance();
                    drop(inner);
                    self.window_moved.notify_waiters();
                    return Ok(());
                } else {
                    return match inner.slot_mut(seqno) {
                        slot @ (Slot::Vacant | Slot::Interrupted) => {
                            // A pending interrupt mark is superseded: the
                            // recovery path decided to skip the position
                            // entirely.
                            *slot = Slot::Canceled;
                            Ok(())
                        }
                        Slot::Canceled => Ok(()),
                        Slot::Waiting(_) => Err(OrderingError::Claimed(seqno)),
                    };
                }
            };
            notified.await;
        }
    }

    /// Wakes a grab parked at `seqno` with [`OrderingError::Interrupted`],
    /// or arms the position so the next grab fails once. The position is
    /// left unclaimed. Fails with [`OrderingError::Passed`] if the position
    /// was already traversed or is currently held — the caller then tries
    /// the next queue in the brute-force-abort ladder.
    pub fn interrupt(&self, seqno: Seqno) -> Result<(), OrderingError> {
        let mut inner = self.inner.lock();
        if seqno < inner.current || (seqno == inner.current && inner.held) {
            return Err(OrderingError::Passed(seqno, inner.current));
        }
        if !inner.in_window(seqno) {
            // Nothing can be waiting this far ahead; the victim's grab has
            // not reached the ring yet and there is no slot to arm.
            return Err(OrderingError::Passed(seqno, inner.current));
        }
        match std::mem::replace(inner.slot_mut(seqno), Slot::Interrupted) {
            Slot::Waiting(tx) => {
                *inner.slot_mut(seqno) = Slot::Vacant;
                let _ = tx.send(Admission::Interrupted);
                Ok(())
            }
            Slot::Vacant | Slot::Interrupted => Ok(()),
            Slot::Canceled => {
                *inner.slot_mut(seqno) = Slot::Canceled;
                Err(OrderingError::Passed(seqno, inner.current))
            }
        }
    }

    /// The monitor's name, used in fatal-path diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }
}
