mod device;
mod session;

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use ota_core::config::DeviceConfig;
use session::{DEFAULT_CONFIG, Session};

struct Options {
    config: Option<PathBuf>,
    transcript: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let options = parse_options().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("Usage: ota-guard-emulator [--config <path>] [--transcript <path>]");
        process::exit(2);
    });

    let config = load_config(options.config.as_deref()).unwrap_or_else(|err| {
        eprintln!("{err}");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    writeln!(
        writer,
        "OTA Guard emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    let transcript = options
        .transcript
        .as_deref()
        .map(|path| (path, "OTA Guard emulator session"));
    let (mut session, boot_lines) = Session::new(config, transcript)?;
    for response in boot_lines {
        writeln!(writer, "{response}")?;
    }

    let mut line = String::new();
    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        config: None,
        transcript: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        let slot = match arg.as_str() {
            "--config" => &mut options.config,
            "--transcript" => &mut options.transcript,
            other => return Err(format!("Unknown argument `{other}`")),
        };
        let value = args
            .next()
            .ok_or_else(|| format!("Expected value after {arg}"))?;
        *slot = Some(PathBuf::from(value));
    }
    Ok(options)
}

fn load_config(path: Option<&std::path::Path>) -> Result<DeviceConfig, String> {
    let text = match path {
        Some(path) => fs::read_to_string(path)
            .map_err(|err| format!("Could not read {}: {err}", path.display()))?,
        None => DEFAULT_CONFIG.to_string(),
    };
    DeviceConfig::parse(&text).map_err(|err| format!("Invalid configuration: {err}"))
}
