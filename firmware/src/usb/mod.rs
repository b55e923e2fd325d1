//! Dual-CDC USB composite device.
//!
//! CDC0 carries two-byte command frames for the supervisor. CDC1 carries
//! firmware uploads; the host holding DTR on it is what the supervisor sees
//! as the network link being up.

use embassy_usb::class::cdc_acm::{CdcAcmClass, ControlChanged, Receiver, Sender, State};
use embassy_usb::driver::Driver;
use embassy_usb::{Builder, Config, UsbDevice};

/// Full-speed bulk packet size used by both ports.
pub const MAX_PACKET_SIZE: u16 = 64;

const VENDOR_ID: u16 = 0x1209;
const PRODUCT_ID: u16 = 0x0002;
const DESCRIPTOR_LEN: usize = 256;

const MANUFACTURER: &str = "OTA Guard";
const PRODUCT: &str = "Rollback Coordinator";

/// Descriptor buffers and class state that must outlive the device.
pub struct UsbDeviceStorage {
    control: [u8; MAX_PACKET_SIZE as usize],
    config: [u8; DESCRIPTOR_LEN],
    bos: [u8; DESCRIPTOR_LEN],
    msos: [u8; DESCRIPTOR_LEN],
    command: State<'static>,
    update: State<'static>,
}

impl UsbDeviceStorage {
    pub fn new() -> Self {
        Self {
            control: [0; MAX_PACKET_SIZE as usize],
            config: [0; DESCRIPTOR_LEN],
            bos: [0; DESCRIPTOR_LEN],
            msos: [0; DESCRIPTOR_LEN],
            command: State::new(),
            update: State::new(),
        }
    }
}

/// One CDC ACM interface split into its halves.
pub struct CdcAcmHandle<D: Driver<'static>> {
    pub sender: Sender<'static, D>,
    pub receiver: Receiver<'static, D>,
    pub control: ControlChanged<'static>,
}

impl<D: Driver<'static>> From<CdcAcmClass<'static, D>> for CdcAcmHandle<D> {
    fn from(class: CdcAcmClass<'static, D>) -> Self {
        let (sender, receiver, control) = class.split_with_control();
        Self {
            sender,
            receiver,
            control,
        }
    }
}

/// The USB device plus its command and update ports.
pub struct UsbPorts<D: Driver<'static>> {
    pub device: UsbDevice<'static, D>,
    pub command: CdcAcmHandle<D>,
    pub update: CdcAcmHandle<D>,
}

/// Builds the composite device.
pub fn build<D: Driver<'static>>(driver: D, storage: &'static mut UsbDeviceStorage) -> UsbPorts<D> {
    let mut config = Config::new(VENDOR_ID, PRODUCT_ID);
    config.manufacturer = Some(MANUFACTURER);
    config.product = Some(PRODUCT);
    config.max_packet_size_0 = 64;
    config.max_power = 100;
    // Miscellaneous class with interface association descriptors, so hosts
    // bind one ACM driver per port.
    config.device_class = 0xEF;
    config.device_sub_class = 0x02;
    config.device_protocol = 0x01;
    config.composite_with_iads = true;

    let mut builder = Builder::new(
        driver,
        config,
        &mut storage.config,
        &mut storage.bos,
        &mut storage.msos,
        &mut storage.control,
    );

    let command = CdcAcmClass::new(&mut builder, &mut storage.command, MAX_PACKET_SIZE);
    let update = CdcAcmClass::new(&mut builder, &mut storage.update, MAX_PACKET_SIZE);

    UsbPorts {
        device: builder.build(),
        command: command.into(),
        update: update.into(),
    }
}
