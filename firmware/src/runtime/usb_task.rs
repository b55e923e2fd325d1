use super::{EVENT_QUEUE, UPLOAD_QUEUE, USB_STORAGE, UploadChunk, UploadIngress};
use crate::events::{EventProducer, FrameAssembler};
use crate::status;
use crate::usb::{self, CdcAcmHandle};
use embassy_futures::join::{join, join3};
use embassy_futures::select::{Either, select};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_usb::driver::EndpointError;

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);
    let usb::UsbPorts {
        mut device,
        command,
        update,
    } = usb::build(driver, storage);

    join3(
        device.run(),
        run_command_interface(command),
        run_update_interface(update),
    )
    .await;
    loop {
        core::future::pending::<()>().await;
    }
}

async fn run_command_interface<D>(handle: CdcAcmHandle<D>) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let CdcAcmHandle {
        mut sender,
        mut receiver,
        control,
    } = handle;
    let mut producer = EventProducer::new(EVENT_QUEUE.sender());
    let mut assembler = FrameAssembler::new();
    let mut ingress = [0u8; usb::MAX_PACKET_SIZE as usize];

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        assembler.reset();

        defmt::info!("usb: command interface connected");

        loop {
            match select(receiver.read_packet(&mut ingress), control.control_changed()).await {
                Either::First(Ok(count)) => {
                    let dropped = assembler.feed(&ingress[..count], &mut producer);
                    if dropped > 0 {
                        defmt::warn!("usb: event queue full, dropped {} command(s)", dropped);
                    }
                }
                Either::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: command interface disabled");
                    break;
                }
                Either::First(Err(_)) => {
                    defmt::warn!("usb: command read error");
                }
                Either::Second(()) => {
                    if !sender.dtr() {
                        defmt::warn!("usb: command host dropped DTR");
                        break;
                    }
                }
            }
        }
    }
}

async fn run_update_interface<D>(handle: CdcAcmHandle<D>) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let CdcAcmHandle {
        mut sender,
        mut receiver,
        control,
    } = handle;
    let uploads = UPLOAD_QUEUE.sender();
    let mut ingress = [0u8; usb::MAX_PACKET_SIZE as usize];

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        status::set_usb_configured(true);
        wait_for_dtr(&control, &mut sender).await;
        status::set_update_port_attached(true);

        defmt::info!("usb: update interface connected");

        loop {
            match select(receiver.read_packet(&mut ingress), control.control_changed()).await {
                Either::First(Ok(0)) => {}
                Either::First(Ok(count)) => match UploadChunk::from_slice(&ingress[..count]) {
                    Ok(chunk) => uploads.send(UploadIngress::Data(chunk)).await,
                    Err(_) => defmt::warn!("usb: dropping upload packet len={}", count),
                },
                Either::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: update interface disabled");
                    status::set_usb_configured(false);
                    break;
                }
                Either::First(Err(_)) => {
                    defmt::warn!("usb: update read error");
                }
                Either::Second(()) => {
                    if !sender.dtr() {
                        defmt::warn!("usb: update host dropped DTR");
                        break;
                    }
                }
            }
        }

        status::set_update_port_attached(false);
        uploads.send(UploadIngress::Disconnected).await;
    }
}

async fn wait_for_dtr<D>(
    control: &embassy_usb::class::cdc_acm::ControlChanged<'static>,
    sender: &mut embassy_usb::class::cdc_acm::Sender<'static, D>,
) where
    D: embassy_usb::driver::Driver<'static>,
{
    while !sender.dtr() {
        control.control_changed().await;
    }
}
