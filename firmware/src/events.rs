//! Embassy channel bindings for the device event queue.
//!
//! Command frames from the USB control port and notifications from the
//! upload task share one channel so the supervisor handles them in arrival
//! order. The adapters below expose the channel halves through the queue
//! traits from `ota-core`.

use embassy_sync::channel::{Channel, Receiver, Sender, TryReceiveError, TrySendError};
use heapless::Vec;
use ota_core::command::OPCODE_LEN;
use ota_core::events::{
    DequeueError, DeviceEvent, EnqueueError, EventQueueConsumer, EventQueueProducer,
};

/// Depth of the shared event channel.
pub const EVENT_QUEUE_DEPTH: usize = 8;

#[cfg(target_os = "none")]
pub type EventQueueMutex = embassy_sync::blocking_mutex::raw::ThreadModeRawMutex;
#[cfg(not(target_os = "none"))]
pub type EventQueueMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;

pub type EventChannel = Channel<EventQueueMutex, DeviceEvent, EVENT_QUEUE_DEPTH>;
pub type EventSender<'a> = Sender<'a, EventQueueMutex, DeviceEvent, EVENT_QUEUE_DEPTH>;
pub type EventReceiver<'a> = Receiver<'a, EventQueueMutex, DeviceEvent, EVENT_QUEUE_DEPTH>;

/// Producer half handed to the USB tasks.
pub struct EventProducer<'a> {
    sender: EventSender<'a>,
}

impl<'a> EventProducer<'a> {
    pub const fn new(sender: EventSender<'a>) -> Self {
        Self { sender }
    }

    /// Waits for room and enqueues `event`.
    ///
    /// Transfer notifications use this path; dropping a completion would
    /// leave the coordinator locked in a transfer that already ended.
    pub async fn send(&self, event: DeviceEvent) {
        self.sender.send(event).await;
    }
}

impl EventQueueProducer for EventProducer<'_> {
    type Error = ();

    fn try_enqueue(&mut self, event: DeviceEvent) -> Result<(), EnqueueError<Self::Error>> {
        self.sender
            .try_send(event)
            .map_err(|TrySendError::Full(_)| EnqueueError::QueueFull)
    }

    fn capacity(&self) -> Option<usize> {
        Some(EVENT_QUEUE_DEPTH)
    }

    fn len(&self) -> Option<usize> {
        Some(self.sender.len())
    }
}

/// Consumer half owned by the supervisor.
pub struct EventConsumer<'a> {
    receiver: EventReceiver<'a>,
}

impl<'a> EventConsumer<'a> {
    pub const fn new(receiver: EventReceiver<'a>) -> Self {
        Self { receiver }
    }
}

impl EventQueueConsumer for EventConsumer<'_> {
    type Error = ();

    fn try_dequeue(&mut self) -> Result<Option<DeviceEvent>, DequeueError<Self::Error>> {
        match self.receiver.try_receive() {
            Ok(event) => Ok(Some(event)),
            Err(TryReceiveError::Empty) => Ok(None),
        }
    }
}

/// Splits a USB byte stream into command frames.
///
/// Packets are not frame aligned; a frame split across two packets is
/// completed by the next one. Partial frames are dropped on reconnect.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Vec<u8, OPCODE_LEN>,
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Forwards every completed frame and returns how many were dropped
    /// because the queue was full.
    pub fn feed<Q>(&mut self, bytes: &[u8], producer: &mut Q) -> usize
    where
        Q: EventQueueProducer,
    {
        let mut dropped = 0;
        for &byte in bytes {
            if self.pending.push(byte).is_err() {
                self.pending.clear();
                continue;
            }
            if self.pending.is_full() {
                if producer.push_frame(&self.pending).is_err() {
                    dropped += 1;
                }
                self.pending.clear();
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::command::RemoteCommand;
    use ota_core::transfer::TransferEvent;

    #[test]
    fn frames_cross_the_channel_in_order() {
        let channel = EventChannel::new();
        let mut producer = EventProducer::new(channel.sender());
        let mut consumer = EventConsumer::new(channel.receiver());

        producer
            .push_frame(&RemoteCommand::Validate.encode())
            .expect("enqueue validate");
        producer
            .try_enqueue(TransferEvent::Started.into())
            .expect("enqueue transfer");
        assert_eq!(producer.len(), Some(2));

        assert_eq!(
            consumer.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Validate)))
        );
        assert_eq!(
            consumer.try_dequeue(),
            Ok(Some(DeviceEvent::Transfer(TransferEvent::Started)))
        );
        assert_eq!(consumer.try_dequeue(), Ok(None));
    }

    #[test]
    fn full_channel_is_reported() {
        let channel = EventChannel::new();
        let mut producer = EventProducer::new(channel.sender());

        for _ in 0..EVENT_QUEUE_DEPTH {
            producer
                .try_enqueue(RemoteCommand::Restart.into())
                .expect("room left");
        }
        assert_eq!(
            producer.try_enqueue(RemoteCommand::Restart.into()),
            Err(EnqueueError::QueueFull)
        );
    }

    #[test]
    fn frames_split_across_packets_are_reassembled() {
        let channel = EventChannel::new();
        let mut producer = EventProducer::new(channel.sender());
        let mut consumer = EventConsumer::new(channel.receiver());
        let mut assembler = FrameAssembler::new();

        let validate = RemoteCommand::Validate.encode();
        let rollback = RemoteCommand::Rollback.encode();
        assert_eq!(assembler.feed(&validate[..1], &mut producer), 0);
        assert_eq!(consumer.try_dequeue(), Ok(None));

        let mut packet = [0u8; 3];
        packet[0] = validate[1];
        packet[1..].copy_from_slice(&rollback);
        assert_eq!(assembler.feed(&packet, &mut producer), 0);

        assert_eq!(
            consumer.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Validate)))
        );
        assert_eq!(
            consumer.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Rollback)))
        );
    }

    #[test]
    fn reset_discards_half_frames() {
        let channel = EventChannel::new();
        let mut producer = EventProducer::new(channel.sender());
        let mut consumer = EventConsumer::new(channel.receiver());
        let mut assembler = FrameAssembler::new();

        assembler.feed(&[0xAA], &mut producer);
        assembler.reset();
        assembler.feed(&RemoteCommand::Restart.encode(), &mut producer);

        assert_eq!(
            consumer.try_dequeue(),
            Ok(Some(DeviceEvent::Command(RemoteCommand::Restart)))
        );
        assert_eq!(consumer.try_dequeue(), Ok(None));
    }
}
