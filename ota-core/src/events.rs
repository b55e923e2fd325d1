//! Event queue abstractions shared between firmware and host targets.
//!
//! Remote commands and transfer notifications reach the control loop through
//! one queue so they are handled strictly one at a time. Firmware binds the
//! traits to an Embassy channel; host tooling uses [`LocalEventQueue`].

use heapless::Deque;

use crate::command::{DecodeError, RemoteCommand, decode};
use crate::transfer::TransferEvent;

/// Work item consumed by the supervisor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    Command(RemoteCommand),
    /// Frame carrying an opcode that names no command.
    UnknownOpcode(u16),
    Transfer(TransferEvent),
}

impl From<RemoteCommand> for DeviceEvent {
    fn from(value: RemoteCommand) -> Self {
        DeviceEvent::Command(value)
    }
}

impl From<TransferEvent> for DeviceEvent {
    fn from(value: TransferEvent) -> Self {
        DeviceEvent::Transfer(value)
    }
}

/// Error surfaced when an event cannot be enqueued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EnqueueError<E = ()> {
    /// Queue has reached its maximum capacity.
    QueueFull,
    /// Queue has been disconnected from its consumer.
    Disconnected,
    /// Transport-specific failure.
    Other(E),
}

impl<E> EnqueueError<E> {
    /// Maps the inner error type.
    pub fn map_other<F, M>(self, mapper: M) -> EnqueueError<F>
    where
        M: FnOnce(E) -> F,
    {
        match self {
            EnqueueError::QueueFull => EnqueueError::QueueFull,
            EnqueueError::Disconnected => EnqueueError::Disconnected,
            EnqueueError::Other(err) => EnqueueError::Other(mapper(err)),
        }
    }
}

/// Error surfaced when dequeueing fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DequeueError<E = ()> {
    /// Queue has been disconnected from its producers.
    Disconnected,
    /// Transport-specific failure.
    Other(E),
}

/// Trait implemented by producers that push events into the control loop.
pub trait EventQueueProducer {
    /// Transport-specific error type.
    type Error;

    /// Attempts to enqueue an event without blocking.
    fn try_enqueue(&mut self, event: DeviceEvent) -> Result<(), EnqueueError<Self::Error>>;

    /// Returns the queue capacity if it is known.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Returns the current queue depth if it can be observed.
    fn len(&self) -> Option<usize> {
        None
    }

    /// Returns `true` when the queue reports that it currently holds no items.
    fn is_empty(&self) -> Option<bool> {
        self.len().map(|current| current == 0)
    }

    /// Decodes a raw command frame and enqueues the result.
    ///
    /// Frames naming no command are forwarded as [`DeviceEvent::UnknownOpcode`]
    /// so the control loop can record them; truncated frames are dropped.
    fn push_frame(&mut self, frame: &[u8]) -> Result<(), EnqueueError<Self::Error>> {
        match decode(frame) {
            Ok(command) => self.try_enqueue(command.into()),
            Err(DecodeError::UnknownOpcode(opcode)) => {
                self.try_enqueue(DeviceEvent::UnknownOpcode(opcode))
            }
            Err(DecodeError::Truncated { .. }) => Ok(()),
        }
    }
}

/// Trait implemented by the consumer side owned by the control loop.
pub trait EventQueueConsumer {
    /// Transport-specific error type.
    type Error;

    /// Attempts to dequeue an event without blocking.
    ///
    /// Returns `Ok(None)` when the queue is currently empty.
    fn try_dequeue(&mut self) -> Result<Option<DeviceEvent>, DequeueError<Self::Error>>;
}

/// Single-owner FIFO implementing both queue traits.
#[derive(Clone, Debug, Default)]
pub struct LocalEventQueue<const N: usize> {
    events: Deque<DeviceEvent, N>,
}

impl<const N: usize> LocalEventQueue<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: Deque::new(),
        }
    }
}

impl<const N: usize> EventQueueProducer for LocalEventQueue<N> {
    type Error = ();

    fn try_enqueue(&mut self, event: DeviceEvent) -> Result<(), EnqueueError<Self::Error>> {
        self.events
            .push_back(event)
            .map_err(|_| EnqueueError::QueueFull)
    }

    fn capacity(&self) -> Option<usize> {
        Some(N)
    }

    fn len(&self) -> Option<usize> {
        Some(self.events.len())
    }
}

impl<const N: usize> EventQueueConsumer for LocalEventQueue<N> {
    type Error = ();

    fn try_dequeue(&mut self) -> Result<Option<DeviceEvent>, DequeueError<Self::Error>> {
        Ok(self.events.pop_front())
    }
}

impl<Q> EventQueueConsumer for &mut Q
where
    Q: EventQueueConsumer + ?Sized,
{
    type Error = Q::Error;

    fn try_dequeue(&mut self) -> Result<Option<DeviceEvent>, DequeueError<Self::Error>> {
        (**self).try_dequeue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferErrorCode;

    #[test]
    fn preserves_fifo_order() {
        let mut queue = LocalEventQueue::<4>::new();
        queue
            .try_enqueue(RemoteCommand::Validate.into())
            .expect("enqueue command");
        queue
            .try_enqueue(TransferEvent::Failed(TransferErrorCode::Receive).into())
            .expect("enqueue transfer");

        assert_eq!(
            queue.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Validate)))
        );
        assert_eq!(
            queue.try_dequeue(),
            Ok(Some(DeviceEvent::Transfer(TransferEvent::Failed(
                TransferErrorCode::Receive
            ))))
        );
        assert_eq!(queue.try_dequeue(), Ok(None));
    }

    #[test]
    fn reports_full_queue() {
        let mut queue = LocalEventQueue::<1>::new();
        queue
            .try_enqueue(RemoteCommand::Restart.into())
            .expect("first enqueue");
        assert_eq!(
            queue.try_enqueue(RemoteCommand::Restart.into()),
            Err(EnqueueError::QueueFull)
        );
        assert_eq!(queue.is_empty(), Some(false));
    }

    #[test]
    fn frames_are_decoded_before_queueing() {
        let mut queue = LocalEventQueue::<4>::new();
        queue.push_frame(&[0xD4, 0x5E, 0x00]).expect("rollback frame");
        queue.push_frame(&[0x01, 0x02]).expect("unknown frame");
        queue.push_frame(&[0x01]).expect("short frame dropped");

        assert_eq!(queue.len(), Some(2));
        assert_eq!(
            queue.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Rollback)))
        );
        assert_eq!(
            queue.try_dequeue(),
            Ok(Some(DeviceEvent::UnknownOpcode(0x0201)))
        );
    }
}
