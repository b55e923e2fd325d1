use std::io;

#[allow(dead_code)]
#[path = "../device.rs"]
mod device;

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Session, TranscriptProfile};

fn main() -> io::Result<()> {
    record_profile(TranscriptProfile::Rollback)?;
    record_profile(TranscriptProfile::SafeMode)?;
    record_profile(TranscriptProfile::Validate)?;
    Ok(())
}

fn record_profile(profile: TranscriptProfile) -> io::Result<()> {
    let mut session = Session::for_profile(profile)?;
    let script: &[&str] = match profile {
        TranscriptProfile::Rollback => &[
            "upload ok",
            "status",
            "crash watchdog",
            "crash watchdog",
            "crash watchdog",
            "status",
        ],
        TranscriptProfile::SafeMode => &[
            "crash panic",
            "send validate",
            "link down",
            "tick 2000",
            "link up",
            "upload bad-password",
            "upload ok",
            "status",
        ],
        TranscriptProfile::Validate => &[
            "upload corrupt",
            "upload ok",
            "tick 5000",
            "send validate",
            "reset",
            "send 0x1234",
            "status",
            "log",
        ],
    };
    for line in script {
        let _ = session.handle_command(line)?;
    }
    Ok(())
}
