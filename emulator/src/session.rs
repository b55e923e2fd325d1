use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use ota_core::command::RemoteCommand;
use ota_core::config::DeviceConfig;
use ota_core::reset::ResetReason;

use crate::device::{SimDevice, StorageFault, UploadScript};

/// Configuration used when no `--config` file is given.
pub const DEFAULT_CONFIG: &str = "\
wifi.ssid = sim-lab
wifi.passphrase = sim-passphrase
ota.hostname = ota-guard-sim
ota.password = bench-secret
probation.boots = 3
firmware.version = 0.1.0-sim
";

const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "send",
        "send <validate|rollback|restart|service-start|service-stop|log-reset|0xNNNN>  - deliver a command frame",
    ),
    (
        "upload",
        "upload <ok|bad-password|corrupt|drop>  - push a synthetic image to the update service",
    ),
    ("link", "link <up|down>                 - change network availability"),
    (
        "crash",
        "crash <watchdog|panic|brownout>  - reset the device with a crash cause",
    ),
    ("reset", "reset                          - press the reset pin"),
    (
        "power-cycle",
        "power-cycle                    - remove and restore power",
    ),
    (
        "fault",
        "fault <tear N|write|erase|clear> - inject storage faults",
    ),
    ("tick", "tick [ms]                      - advance virtual time"),
    ("status", "status                         - show the status report"),
    ("log", "log                            - dump the telemetry ring"),
    ("help", "help [topic]                   - show help for a command"),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TranscriptProfile {
    Rollback,
    SafeMode,
    Validate,
}

impl TranscriptProfile {
    pub fn log_path(self) -> &'static str {
        match self {
            TranscriptProfile::Rollback => "transcripts/emulator-rollback.log",
            TranscriptProfile::SafeMode => "transcripts/emulator-safe-mode.log",
            TranscriptProfile::Validate => "transcripts/emulator-validate.log",
        }
    }

    pub fn header(self) -> &'static str {
        match self {
            TranscriptProfile::Rollback => "OTA Guard emulator rollback transcript",
            TranscriptProfile::SafeMode => "OTA Guard emulator safe-mode transcript",
            TranscriptProfile::Validate => "OTA Guard emulator validation transcript",
        }
    }
}

pub struct Session {
    device: SimDevice,
    transcript: Option<TranscriptLogger>,
}

impl Session {
    /// Powers on a simulated device and returns the boot output.
    pub fn new(
        config: DeviceConfig,
        transcript: Option<(&Path, &str)>,
    ) -> io::Result<(Self, Vec<String>)> {
        let transcript = transcript
            .map(|(path, header)| TranscriptLogger::new(path, header))
            .transpose()?;
        let (device, lines) = SimDevice::power_on(config)?;
        let mut session = Self { device, transcript };
        session.record_output(&lines)?;
        Ok((session, lines))
    }

    /// Starts a session whose transcript goes to the profile's log file.
    pub fn for_profile(profile: TranscriptProfile) -> io::Result<Self> {
        let config = DeviceConfig::parse(DEFAULT_CONFIG)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let path = Path::new(profile.log_path());
        Self::new(config, Some((path, profile.header()))).map(|(session, _)| session)
    }

    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        self.record(TranscriptRole::Host, trimmed)?;

        let mut words = trimmed.split_whitespace();
        let verb = words.next().unwrap_or_default().to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        let lines = match (verb.as_str(), args.as_slice()) {
            ("help", []) => help_lines(None),
            ("help", [topic]) => help_lines(Some(*topic)),
            ("status", []) => self.device.status_lines(),
            ("log", []) => self.device.log_lines(),
            ("reset", []) => self.device.restart(ResetReason::ExternalReset)?,
            ("power-cycle", []) => self.device.restart(ResetReason::PowerOn)?,
            ("crash", [cause]) => match crash_reason(cause) {
                Some(reason) => self.device.restart(reason)?,
                None => usage("crash"),
            },
            ("fault", args) => match parse_fault(args) {
                Some(fault) => {
                    self.device.inject_fault(fault);
                    vec![format!("OK fault armed: {fault:?}")]
                }
                None => usage("fault"),
            },
            _ if self.device.halted().is_some() => {
                vec!["ERR device halted; reset or power-cycle to continue".to_string()]
            }
            ("tick", []) => self.device.advance(DEFAULT_TICK)?,
            ("tick", [millis]) => match millis.parse::<u64>() {
                Ok(millis) => self.device.advance(Duration::from_millis(millis))?,
                Err(_) => usage("tick"),
            },
            ("send", [target]) => match parse_frame(target) {
                Some(frame) => self.device.send_frame(&frame)?,
                None => usage("send"),
            },
            ("upload", [script]) => match UploadScript::from_tag(script) {
                Some(script) => self.device.upload(script)?,
                None => usage("upload"),
            },
            ("link", ["up"]) => {
                self.device.set_link(true);
                self.device.advance(DEFAULT_TICK)?
            }
            ("link", ["down"]) => {
                self.device.set_link(false);
                self.device.advance(DEFAULT_TICK)?
            }
            (verb, _) if HELP_TOPICS.iter().any(|(name, _)| *name == verb) => usage(verb),
            (verb, _) => vec![
                format!("Unknown command `{verb}`."),
                format!("Available topics: {}", help_topic_list()),
            ],
        };

        self.record_output(&lines)?;
        Ok(lines)
    }

    fn record(&mut self, role: TranscriptRole, line: &str) -> io::Result<()> {
        let elapsed = Duration::from_millis(self.device.now().as_millis());
        match self.transcript.as_mut() {
            Some(transcript) => transcript.append_line(elapsed, role, line),
            None => Ok(()),
        }
    }

    fn record_output(&mut self, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.record(TranscriptRole::Emulator, line)?;
        }
        Ok(())
    }
}

fn crash_reason(cause: &str) -> Option<ResetReason> {
    match cause {
        "watchdog" => Some(ResetReason::Watchdog),
        "panic" => Some(ResetReason::Panic),
        "brownout" => Some(ResetReason::Brownout),
        _ => None,
    }
}

/// Accepts a command label or a raw `0x`-prefixed opcode.
fn parse_frame(target: &str) -> Option<[u8; 2]> {
    if let Some(hex) = target
        .strip_prefix("0x")
        .or_else(|| target.strip_prefix("0X"))
    {
        return u16::from_str_radix(hex, 16).ok().map(u16::to_le_bytes);
    }
    RemoteCommand::from_label(target).map(RemoteCommand::encode)
}

fn parse_fault(args: &[&str]) -> Option<StorageFault> {
    match args {
        ["tear", bytes] => bytes.parse().ok().map(StorageFault::Tear),
        ["write"] => Some(StorageFault::FailWrites),
        ["erase"] => Some(StorageFault::FailErases),
        ["clear"] => Some(StorageFault::Clear),
        _ => None,
    }
}

fn help_lines(topic: Option<&str>) -> Vec<String> {
    let mut lines = Vec::new();
    match topic {
        Some(target) => {
            if let Some((_, detail)) = HELP_TOPICS
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(target))
            {
                lines.push((*detail).to_string());
            } else {
                lines.push(format!("No help available for `{target}`."));
                lines.push(format!("Available topics: {}", help_topic_list()));
            }
        }
        None => {
            lines.push("Available commands:".to_string());
            for (_, detail) in HELP_TOPICS {
                lines.push(format!("  {detail}"));
            }
            lines.push("Type `help <topic>` for a specific command.".to_string());
        }
    }
    lines
}

fn usage(verb: &str) -> Vec<String> {
    let mut lines = vec!["ERR invalid arguments".to_string()];
    lines.extend(help_lines(Some(verb)));
    lines
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path, header: &str) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };

        logger.write_header(header)?;
        Ok(logger)
    }

    fn write_header(&mut self, header: &str) -> io::Result<()> {
        writeln!(self.writer, "# {header}")?;
        writeln!(
            self.writer,
            "# Timestamps are milliseconds of simulated device time"
        )?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, elapsed: Duration, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(
            self.writer,
            "[+{:>6} ms] {} {}",
            elapsed.as_millis(),
            role.prefix(),
            line
        )?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::partition::SlotId;
    use ota_core::supervisor::RunMode;
    use ota_core::telemetry::OtaEventKind;
    use ota_core::store::StateStore;

    fn session() -> Session {
        let config = DeviceConfig::parse(DEFAULT_CONFIG).expect("default config parses");
        Session::new(config, None).expect("session starts").0
    }

    fn run(session: &mut Session, line: &str) -> Vec<String> {
        session.handle_command(line).expect("command runs")
    }

    fn current_slot(session: &Session) -> SlotId {
        session.device().supervisor().coordinator().current_slot()
    }

    #[test]
    fn fresh_device_boots_stable_with_service_running() {
        let session = session();
        let supervisor = session.device().supervisor();
        assert_eq!(supervisor.mode(), RunMode::Normal);
        assert!(supervisor.coordinator().service_running());
        assert_eq!(supervisor.telemetry().count(OtaEventKind::StableBoot), 1);
    }

    #[test]
    fn new_image_rolls_back_after_repeated_crashes() {
        let mut session = session();
        run(&mut session, "upload ok");
        assert_eq!(current_slot(&session), SlotId::B);

        run(&mut session, "crash watchdog");
        run(&mut session, "crash watchdog");
        assert_eq!(current_slot(&session), SlotId::B);

        let lines = run(&mut session, "crash watchdog");
        assert!(lines.iter().any(|line| line.contains("rollback next=A")));
        assert_eq!(current_slot(&session), SlotId::A);
        assert_eq!(
            session.device().supervisor().coordinator().store().read_raw_counter(),
            -1
        );
    }

    #[test]
    fn validated_image_survives_crashes_in_probation() {
        let mut session = session();
        run(&mut session, "upload ok");
        run(&mut session, "send validate");
        for _ in 0..4 {
            run(&mut session, "reset");
        }
        assert_eq!(current_slot(&session), SlotId::B);
        assert_eq!(session.device().supervisor().mode(), RunMode::Normal);
    }

    #[test]
    fn crash_of_validated_image_enters_safe_mode_and_ignores_commands() {
        let mut session = session();
        run(&mut session, "crash panic");
        assert!(matches!(
            session.device().supervisor().mode(),
            RunMode::SafeMode(_)
        ));

        run(&mut session, "send service-stop");
        let telemetry = session.device().supervisor().telemetry();
        assert_eq!(
            telemetry.count(OtaEventKind::CommandIgnored(RemoteCommand::StopUpdateService)),
            1
        );
        assert!(session.device().supervisor().coordinator().service_running());
    }

    #[test]
    fn wrong_password_upload_is_rejected() {
        let mut session = session();
        let lines = run(&mut session, "upload bad-password");
        assert!(lines.iter().any(|line| line.contains("failed: auth")));
        assert_eq!(current_slot(&session), SlotId::A);
        assert_eq!(
            session.device().supervisor().telemetry().count(OtaEventKind::TransferFailed),
            1
        );
    }

    #[test]
    fn stopped_service_refuses_uploads() {
        let mut session = session();
        run(&mut session, "send service-stop");
        let lines = run(&mut session, "upload ok");
        assert!(lines[0].starts_with("ERR connection refused"));

        // The disabled flag persists across a reset.
        run(&mut session, "reset");
        assert!(!session.device().supervisor().coordinator().service_running());
    }

    #[test]
    fn failed_counter_persist_halts_until_power_cycle() {
        let mut session = session();
        run(&mut session, "upload ok");
        run(&mut session, "fault write");
        let lines = run(&mut session, "crash watchdog");
        assert!(lines.iter().any(|line| line.starts_with("HALT")));
        assert!(session.device().halted().is_some());

        let refused = run(&mut session, "send validate");
        assert!(refused[0].starts_with("ERR device halted"));

        run(&mut session, "fault clear");
        run(&mut session, "power-cycle");
        assert!(session.device().halted().is_none());
        assert_eq!(session.device().supervisor().mode(), RunMode::Normal);
    }

    #[test]
    fn unknown_opcode_is_recorded() {
        let mut session = session();
        run(&mut session, "send 0x1234");
        assert_eq!(
            session.device().supervisor().telemetry().count(OtaEventKind::UnknownOpcode),
            1
        );
    }

    #[test]
    fn help_lists_topics_for_unknown_commands() {
        let mut session = session();
        let lines = run(&mut session, "frobnicate");
        assert!(lines[0].contains("Unknown command"));
        assert!(lines[1].contains("upload"));
    }
}
