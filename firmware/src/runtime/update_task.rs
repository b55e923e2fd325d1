use heapless::String;
use ota_core::transfer::MAX_SECRET_LEN;
use ota_core::upload::UploadSession;

use super::{EVENT_QUEUE, UPLOAD_QUEUE, UploadIngress};
use crate::events::EventProducer;
use crate::platform::flash::FlashImageSink;
use crate::status;

/// Feeds update-port traffic into the upload state machine.
///
/// Transfer events wait for queue space instead of being dropped.
#[embassy_executor::task]
pub async fn run(sink: FlashImageSink, password: Option<String<MAX_SECRET_LEN>>) -> ! {
    let ingress = UPLOAD_QUEUE.receiver();
    let events = EventProducer::new(EVENT_QUEUE.sender());
    let mut session = UploadSession::new(sink);

    loop {
        match ingress.receive().await {
            UploadIngress::Data(chunk) => {
                if !status::service_running() {
                    if let Some(event) = session.disconnect() {
                        events.send(event.into()).await;
                    }
                    continue;
                }
                for event in session.feed(&chunk, password.as_deref()) {
                    events.send(event.into()).await;
                }
            }
            UploadIngress::Disconnected => {
                if let Some(event) = session.disconnect() {
                    defmt::warn!("update: host left mid-transfer");
                    events.send(event.into()).await;
                }
            }
        }
    }
}
