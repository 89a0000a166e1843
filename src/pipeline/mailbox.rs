//! FIFO mailbox with optional synchronous replies
//!
//! Any number of threads may send; one worker receives. A send that names a
//! reply slot blocks until the worker answers on that slot. Each slot holds
//! one outstanding request at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use flume::{Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{CameraError, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyId(pub usize);

struct ReplySlot {
    busy: AtomicBool,
    tx: Sender<Status>,
    rx: Receiver<Status>,
}

impl ReplySlot {
    fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            busy: AtomicBool::new(false),
            tx,
            rx,
        }
    }
}

pub struct Mailbox<M> {
    name: String,
    tx: Sender<M>,
    rx: Receiver<M>,
    replies: Vec<ReplySlot>,
    closed: AtomicBool,
}

impl<M> Mailbox<M> {
    /// `num_reply` reply slots; zero disables synchronous sends.
    pub fn new(name: impl Into<String>, num_reply: usize) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name: name.into(),
            tx,
            rx,
            replies: (0..num_reply).map(|_| ReplySlot::new()).collect(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue `msg`. With a reply id, block until the receiver replies and
    /// return its status.
    pub fn send(&self, msg: M, reply: Option<ReplyId>) -> Status {
        let Some(id) = reply else {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CameraError::MailboxClosed);
            }
            return self.tx.send(msg).map_err(|_| CameraError::MailboxClosed);
        };

        if self.replies.is_empty() {
            return Err(CameraError::BadValue(format!(
                "{}: replies are not enabled",
                self.name
            )));
        }
        let slot = self.replies.get(id.0).ok_or_else(|| {
            CameraError::BadValue(format!("{}: no reply slot {}", self.name, id.0))
        })?;

        if slot.busy.swap(true, Ordering::SeqCst) {
            return Err(CameraError::BadValue(format!(
                "{}: reply slot {} is in use",
                self.name, id.0
            )));
        }
        if self.closed.load(Ordering::SeqCst) {
            slot.busy.store(false, Ordering::SeqCst);
            return Err(CameraError::MailboxClosed);
        }

        // Drop anything left over from a duplicate reply.
        while slot.rx.try_recv().is_ok() {}

        let status = match self.tx.send(msg) {
            Ok(()) => slot.rx.recv().unwrap_or(Err(CameraError::MailboxClosed)),
            Err(_) => Err(CameraError::MailboxClosed),
        };
        slot.busy.store(false, Ordering::SeqCst);
        status
    }

    /// Block until a message arrives.
    pub fn receive(&self) -> Result<M, CameraError> {
        self.rx.recv().map_err(|_| CameraError::MailboxClosed)
    }

    /// Wake the sender waiting on `id`.
    pub fn reply(&self, id: ReplyId, status: Status) {
        let Some(slot) = self.replies.get(id.0) else {
            warn!("{}: reply to unknown slot {}", self.name, id.0);
            return;
        };
        if slot.tx.try_send(status).is_err() {
            warn!("{}: reply slot {} already holds a status", self.name, id.0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn size(&self) -> usize {
        self.rx.len()
    }

    /// Refuse further sends and fail every sender still waiting for a reply.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (i, slot) in self.replies.iter().enumerate() {
            if slot.busy.load(Ordering::SeqCst) {
                debug!("{}: failing pending reply {}", self.name, i);
                let _ = slot.tx.try_send(Err(CameraError::MailboxClosed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn messages_come_out_in_send_order() {
        let mb = Mailbox::new("test", 0);
        for i in 0..5 {
            mb.send(i, None).unwrap();
        }
        assert_eq!(mb.size(), 5);
        let got: Vec<_> = (0..5).map(|_| mb.receive().unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(mb.is_empty());
    }

    #[test]
    fn reply_without_reply_slots_is_bad_value() {
        let mb = Mailbox::new("test", 0);
        assert!(matches!(
            mb.send(1, Some(ReplyId(0))),
            Err(CameraError::BadValue(_))
        ));
        assert!(mb.is_empty());
    }

    #[test]
    fn synchronous_send_returns_the_worker_status() {
        let mb = Arc::new(Mailbox::new("test", 2));
        let worker = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                let msg: u32 = mb.receive().unwrap();
                let status = if msg == 7 {
                    Err(CameraError::BadValue("seven".into()))
                } else {
                    Ok(())
                };
                mb.reply(ReplyId(1), status);
            })
        };

        assert!(matches!(
            mb.send(7, Some(ReplyId(1))),
            Err(CameraError::BadValue(_))
        ));
        worker.join().unwrap();
    }

    #[test]
    fn reply_slot_is_reused_only_after_its_reply() {
        let mb = Arc::new(Mailbox::<u32>::new("test", 1));
        let first = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.send(1, Some(ReplyId(0))))
        };

        // Once the first request is queued its slot is taken.
        assert_eq!(mb.receive().unwrap(), 1);
        assert!(matches!(
            mb.send(2, Some(ReplyId(0))),
            Err(CameraError::BadValue(_))
        ));
        assert!(mb.is_empty());

        mb.reply(ReplyId(0), Ok(()));
        assert_eq!(first.join().unwrap(), Ok(()));

        let worker = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                let msg = mb.receive().unwrap();
                mb.reply(ReplyId(0), Ok(()));
                msg
            })
        };
        assert_eq!(mb.send(3, Some(ReplyId(0))), Ok(()));
        assert_eq!(worker.join().unwrap(), 3);
    }

    #[test]
    fn closing_wakes_a_waiting_sender() {
        let mb = Arc::new(Mailbox::<u32>::new("test", 1));
        let sender = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.send(1, Some(ReplyId(0))))
        };

        // Wait for the request to land, then close without replying.
        let _ = mb.receive().unwrap();
        mb.close();
        assert_eq!(sender.join().unwrap(), Err(CameraError::MailboxClosed));
        assert_eq!(mb.send(2, None), Err(CameraError::MailboxClosed));
    }
}
