//! Shared status storage for the firmware target.
//!
//! The USB tasks and the supervisor run on one executor but never share
//! borrows; these atomics carry the few facts that cross between them.

use core::fmt::Write as _;

use ota_core::link::{LinkStatus, NetworkLink};
use ota_core::status::{StatusFormatter, StatusSnapshot};
use ota_core::transfer::{ServiceError, ServiceIdentity, UpdateService};
use portable_atomic::{AtomicBool, Ordering};

use crate::telemetry::emit_text;

/// Host holds DTR on the update port.
static UPDATE_PORT_ATTACHED: AtomicBool = AtomicBool::new(false);
/// USB device has been configured by the host.
static USB_CONFIGURED: AtomicBool = AtomicBool::new(false);
/// Update service accepts uploads.
static SERVICE_RUNNING: AtomicBool = AtomicBool::new(false);

pub fn set_usb_configured(configured: bool) {
    USB_CONFIGURED.store(configured, Ordering::Relaxed);
}

pub fn set_update_port_attached(attached: bool) {
    UPDATE_PORT_ATTACHED.store(attached, Ordering::Relaxed);
}

/// Returns `true` while uploads should be accepted.
pub fn service_running() -> bool {
    SERVICE_RUNNING.load(Ordering::Acquire)
}

fn link_status() -> LinkStatus {
    match (
        USB_CONFIGURED.load(Ordering::Relaxed),
        UPDATE_PORT_ATTACHED.load(Ordering::Relaxed),
    ) {
        (_, true) => LinkStatus::Connected,
        (true, false) => LinkStatus::Connecting,
        (false, false) => LinkStatus::Disconnected,
    }
}

/// Network link backed by the USB update port.
///
/// Enumeration is driven by the host, so reconnecting has nothing to do.
#[derive(Default)]
pub struct UsbLink;

impl UsbLink {
    pub const fn new() -> Self {
        Self
    }
}

impl NetworkLink for UsbLink {
    fn status(&self) -> LinkStatus {
        link_status()
    }

    fn reconnect(&mut self) {}
}

/// Update service that gates the upload task.
#[derive(Default)]
pub struct UsbUpdateService;

impl UsbUpdateService {
    pub const fn new() -> Self {
        Self
    }
}

impl UpdateService for UsbUpdateService {
    fn start(&mut self, identity: &ServiceIdentity) -> Result<(), ServiceError> {
        if identity.hostname.is_empty() {
            return Err(ServiceError::InvalidHostname);
        }
        SERVICE_RUNNING.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        SERVICE_RUNNING.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        service_running()
    }
}

/// Writes the status report to the log, one line per entry.
pub fn log_status(snapshot: &StatusSnapshot) {
    let mut report = heapless::String::<256>::new();
    if StatusFormatter::new(snapshot).write_all(&mut report, "\n").is_err() {
        report.clear();
        let _ = write!(report, "status report truncated");
    }
    for line in report.lines() {
        emit_text("status", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::String;

    fn identity(hostname: &str) -> ServiceIdentity {
        ServiceIdentity {
            hostname: String::try_from(hostname).expect("fits"),
            password: None,
            port: 3232,
        }
    }

    #[test]
    fn service_flag_tracks_start_and_stop() {
        let mut service = UsbUpdateService::new();
        assert_eq!(
            service.start(&identity("")),
            Err(ServiceError::InvalidHostname)
        );

        service.start(&identity("ota-guard")).expect("start");
        assert!(service.is_running());
        service.stop();
        assert!(!service.is_running());
    }

    #[test]
    fn link_follows_usb_state() {
        let link = UsbLink::new();
        set_usb_configured(false);
        set_update_port_attached(false);
        assert_eq!(link.status(), LinkStatus::Disconnected);

        set_usb_configured(true);
        assert_eq!(link.status(), LinkStatus::Connecting);

        set_update_port_attached(true);
        assert_eq!(link.status(), LinkStatus::Connected);
        set_update_port_attached(false);
        set_usb_configured(false);
    }
}
