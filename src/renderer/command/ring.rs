//! Command ring between the scene and render threads.
//!
//! A bounded `flume` channel carries the commands; a shared byte counter
//! enforces the ring's capacity. The producer reserves a command's
//! [`encoded_size`](RenderCommand::encoded_size) before sending and blocks
//! while the ring is full. The consumer returns the bytes with
//! [`CommandConsumer::finish_read`] once the command has executed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use flume::RecvTimeoutError;

use super::commands::RenderCommand;
use crate::errors::{Result, ShadowError};

/// Default ring capacity in bytes.
pub const RENDERING_COMMAND_BUFFER_SIZE: usize = 256 * 1024;

/// Creates a connected producer/consumer pair.
#[must_use]
pub fn command_ring(capacity: usize) -> (CommandProducer, CommandConsumer) {
    let slots = (capacity / size_of::<RenderCommand>()).max(1);
    let (sender, receiver) = flume::bounded(slots);
    let used = Arc::new(AtomicUsize::new(0));
    (
        CommandProducer {
            sender,
            used: Arc::clone(&used),
            capacity,
        },
        CommandConsumer { receiver, used },
    )
}

#[derive(Debug)]
struct Entry {
    command: RenderCommand,
    size: usize,
}

/// Scene-thread end of the ring.
#[derive(Debug)]
pub struct CommandProducer {
    sender: flume::Sender<Entry>,
    used: Arc<AtomicUsize>,
    capacity: usize,
}

impl CommandProducer {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes reserved by commands not yet finished.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Appends `command`, waiting for space if the ring is full.
    ///
    /// A command larger than the whole ring can never be written and is a
    /// fatal [`ShadowError::CommandTooLarge`].
    pub fn enqueue(&self, command: RenderCommand) -> Result<()> {
        let size = command.encoded_size();
        if size > self.capacity {
            return Err(ShadowError::CommandTooLarge {
                size,
                capacity: self.capacity,
            });
        }
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used + size <= self.capacity
                && self
                    .used
                    .compare_exchange_weak(used, used + size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                break;
            }
            if self.sender.is_disconnected() {
                return Err(ShadowError::RingDisconnected);
            }
            std::thread::yield_now();
        }
        self.sender.send(Entry { command, size }).map_err(|_| {
            self.used.fetch_sub(size, Ordering::AcqRel);
            ShadowError::RingDisconnected
        })
    }
}

/// A command taken from the ring; hand its size back with
/// [`CommandConsumer::finish_read`].
#[derive(Debug)]
pub struct RingRead {
    pub command: RenderCommand,
    pub size: usize,
}

/// Render-thread end of the ring.
#[derive(Debug)]
pub struct CommandConsumer {
    receiver: flume::Receiver<Entry>,
    used: Arc<AtomicUsize>,
}

impl CommandConsumer {
    /// Waits up to `timeout` for the next command.
    ///
    /// `Ok(None)` on timeout, `Err` once the producer is gone and the ring
    /// is empty.
    pub fn wait_for_read(&self, timeout: Duration) -> Result<Option<RingRead>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Entry { command, size }) => Ok(Some(RingRead { command, size })),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ShadowError::RingDisconnected),
        }
    }

    /// Releases the bytes of a command that has finished executing.
    pub fn finish_read(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_command_is_rejected() {
        let (producer, _consumer) = command_ring(size_of::<RenderCommand>() - 1);
        assert!(matches!(
            producer.enqueue(RenderCommand::Stop),
            Err(ShadowError::CommandTooLarge { .. })
        ));
    }

    #[test]
    fn bytes_return_after_finish_read() {
        let (producer, consumer) = command_ring(RENDERING_COMMAND_BUFFER_SIZE);
        producer.enqueue(RenderCommand::Stop).unwrap();
        assert_eq!(producer.used(), size_of::<RenderCommand>());
        let read = consumer.wait_for_read(Duration::from_millis(1)).unwrap().unwrap();
        assert!(matches!(read.command, RenderCommand::Stop));
        consumer.finish_read(read.size);
        assert_eq!(producer.used(), 0);
        assert!(consumer.wait_for_read(Duration::from_millis(1)).unwrap().is_none());
    }
}
