//! Frame consumers and the return path back to the coordinator

use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::capture::frame::{BufferHandle, Frame};
use crate::pipeline::coordinator::Message;
use crate::pipeline::mailbox::Mailbox;

/// Outcome of handing a frame to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The consumer kept the frame and will report it done later.
    Accepted,
    /// The consumer did not keep the frame; it counts as returned now.
    Declined,
}

/// Downstream stage fed by the coordinator.
pub trait FrameSink: Send {
    fn deliver(&mut self, frame: Frame) -> Delivery;

    /// Drop frames accepted but not yet picked up, returning their handles.
    /// Flushed frames are never reported done; frames the consumer already
    /// holds are not affected.
    fn flush(&mut self) -> Vec<BufferHandle>;
}

/// The three downstream stages.
pub struct Consumers {
    pub preview: Box<dyn FrameSink>,
    pub video: Box<dyn FrameSink>,
    pub still: Box<dyn FrameSink>,
}

impl Default for Consumers {
    fn default() -> Self {
        Self {
            preview: Box::new(NullSink),
            video: Box::new(NullSink),
            still: Box::new(NullSink),
        }
    }
}

/// Forwards frames over a flume channel to a task that owns the receiver.
pub struct ChannelSink {
    name: &'static str,
    tx: Sender<Frame>,
    pending: Receiver<Frame>,
}

impl ChannelSink {
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, Receiver<Frame>) {
        let (tx, rx) = flume::bounded(capacity);
        let sink = Self {
            name,
            tx,
            pending: rx.clone(),
        };
        (sink, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, frame: Frame) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Accepted,
            Err(TrySendError::Full(frame)) => {
                debug!("{} consumer full, dropping {:?}", self.name, frame.handle);
                Delivery::Declined
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("{} consumer disconnected", self.name);
                Delivery::Declined
            }
        }
    }

    fn flush(&mut self) -> Vec<BufferHandle> {
        let dropped: Vec<BufferHandle> = self.pending.drain().map(|f| f.handle).collect();
        if !dropped.is_empty() {
            debug!("{} consumer flushed {} frames", self.name, dropped.len());
        }
        dropped
    }
}

/// Consumer that keeps nothing.
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&mut self, _frame: Frame) -> Delivery {
        Delivery::Declined
    }

    fn flush(&mut self) -> Vec<BufferHandle> {
        Vec::new()
    }
}

/// Return path for consumers. Cheap to clone; every call is a fire-and-forget
/// message to the coordinator.
#[derive(Clone)]
pub struct BufferReturns {
    mailbox: Arc<Mailbox<Message>>,
}

impl BufferReturns {
    pub(crate) fn new(mailbox: Arc<Mailbox<Message>>) -> Self {
        Self { mailbox }
    }

    pub fn preview_done(&self, handle: BufferHandle) {
        self.post(Message::PreviewDone(handle));
    }

    pub fn recording_done(&self, handle: BufferHandle) {
        self.post(Message::RecordingDone(handle));
    }

    pub fn picture_done(&self, handle: BufferHandle) {
        self.post(Message::PictureDone(handle));
    }

    fn post(&self, msg: Message) {
        if self.mailbox.send(msg, None).is_err() {
            debug!("coordinator gone, dropping buffer return");
        }
    }
}
