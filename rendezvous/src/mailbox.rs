use std::{collections::VecDeque, error::Error, fmt, num::NonZeroUsize, sync::Arc};

use parking_lot::{Condvar, Mutex};

/// A bounded, blocking, FIFO mailbox between compute contexts.
///
/// The sending half is cloneable (many producers), the receiving half is
/// unique. `send` blocks while the mailbox is at capacity, `recv` blocks
/// while it is empty. There are no timeouts: a peer that never sends keeps
/// the receiver parked indefinitely.
struct Mailbox<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct State<T> {
    items: VecDeque<T>,
    capacity: usize,
    senders: usize,
    receiver_alive: bool,
}

/// Creates a connected sender/receiver pair over a mailbox that holds at
/// most `capacity` items.
pub fn mailbox<T>(capacity: NonZeroUsize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let shared = Arc::new(Mailbox {
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity.get()),
            capacity: capacity.get(),
            senders: 1,
            receiver_alive: true,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });

    (
        MailboxSender {
            shared: Arc::clone(&shared),
        },
        MailboxReceiver { shared },
    )
}

/// The sending half of a mailbox.
pub struct MailboxSender<T> {
    shared: Arc<Mailbox<T>>,
}

/// The receiving half of a mailbox.
pub struct MailboxReceiver<T> {
    shared: Arc<Mailbox<T>>,
}

impl<T> MailboxSender<T> {
    /// Enqueues `item`, blocking while the mailbox is full.
    ///
    /// # Returns
    /// `Err(SendError)` handing the item back if the receiver was dropped.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        let mut state = self.shared.state.lock();
        loop {
            if !state.receiver_alive {
                return Err(SendError(item));
            }
            if state.items.len() < state.capacity {
                state.items.push_back(item);
                self.shared.not_empty.notify_one();
                return Ok(());
            }
            self.shared.not_full.wait(&mut state);
        }
    }
}

impl<T> MailboxReceiver<T> {
    /// Dequeues the oldest item, blocking while the mailbox is empty.
    ///
    /// # Returns
    /// `Err(RecvError)` only once the mailbox is drained and every sender
    /// has been dropped.
    pub fn recv(&mut self) -> Result<T, RecvError> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if state.senders == 0 {
                return Err(RecvError);
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        let mut state = self.shared.state.lock();
        if let Some(item) = state.items.pop_front() {
            self.shared.not_full.notify_one();
            return Ok(item);
        }
        if state.senders == 0 {
            Err(TryRecvError::Disconnected)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().senders += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for MailboxSender<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.senders -= 1;
        if state.senders == 0 {
            drop(state);
            self.shared.not_empty.notify_all();
        }
    }
}

impl<T> Drop for MailboxReceiver<T> {
    fn drop(&mut self) {
        self.shared.state.lock().receiver_alive = false;
        self.shared.not_full.notify_all();
    }
}

/// The receiver hung up; the unsent item is handed back.
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sending into a mailbox with no receiver")
    }
}

impl<T> Error for SendError<T> {}

/// Every sender hung up and the mailbox is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("receiving from a mailbox with no senders")
    }
}

impl Error for RecvError {}

/// Non-blocking receive outcome when no item was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.write_str("mailbox is empty"),
            TryRecvError::Disconnected => f.write_str("mailbox is empty and has no senders"),
        }
    }
}

impl Error for TryRecvError {}
