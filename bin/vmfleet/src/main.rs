// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;

use std::io::{BufRead, Write};
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use config::{GuestCommand, ProcessArgs, ShowMode};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use vmfleet::registry::Target;
use vmfleet::{Credentials, DataDir, FleetController};

fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();

    let data_dir = DataDir::from_env().context("locating data directory")?;
    data_dir.create_layout().context("creating data directory")?;

    let fleet = match &args.config_file {
        Some(path) => Some(
            vmfleet_config::parse(path)
                .with_context(|| format!("reading fleet config {path}"))?,
        ),
        None => None,
    };

    let config_level = fleet.as_ref().and_then(|f| f.log_level.as_ref());
    let level = match (args.log_level, config_level) {
        (Some(level), _) => level,
        (None, Some(level)) => level
            .parse()
            .with_context(|| format!("unknown log level {level:?}"))?,
        (None, None) => tracing::Level::INFO,
    };
    let (log_file, _guard) =
        set_tracing_subscriber(&args, level, &data_dir.logs_dir())?;
    println!("Log file {log_file}");

    info!(?args);

    if let Some(fleet) = fleet {
        return launch(&args, &fleet, data_dir);
    }

    let controller = FleetController::host(data_dir);
    if let Some(mode) = args.show {
        return show(&controller, mode);
    }
    if let Some((command, targets)) = args.guest_command()? {
        let creds = Credentials::new(&args.username, &args.password);
        return send_command(&controller, command, targets, &creds);
    }

    bail!("Nothing to do")
}

fn launch(
    args: &ProcessArgs,
    fleet: &vmfleet_config::FleetConfig,
    data_dir: DataDir,
) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let cwd = Utf8PathBuf::try_from(cwd)
        .context("current directory is not UTF-8")?;
    let requests = fleet.launch_requests(&cwd, args.build)?;
    if requests.is_empty() {
        bail!("No VM to spin up");
    }

    let host_password = host_password()?;
    let mut controller = FleetController::host(data_dir);

    let mut started = Vec::new();
    for request in requests {
        let class = request.vm_class;
        controller
            .set_params(request)
            .with_context(|| format!("preparing {class} guests"))?;
        let outcome = controller
            .start(&host_password)
            .with_context(|| format!("starting {class} guests"))?;
        for uuid in &outcome.skipped {
            warn!(%uuid, %class, "guest is running but was not configured");
        }
        started.push((class, outcome));
    }

    for (class, outcome) in started {
        let ips: Vec<String> = outcome
            .ips()
            .map(|ips| {
                let ips: Vec<String> =
                    ips.iter().map(ToString::to_string).collect();
                ips.join(",")
            })
            .collect();
        println!("{class} VM IPs: {}", ips.join(" "));
    }
    Ok(())
}

fn show(controller: &FleetController, mode: ShowMode) -> anyhow::Result<()> {
    let registry = controller.list()?;
    match mode {
        ShowMode::Details => {
            println!("{}", serde_json::to_string_pretty(&registry)?);
        }
        ShowMode::Ip => {
            for (_, record) in &registry {
                let ips: Vec<String> =
                    record.ips.iter().map(ToString::to_string).collect();
                println!("{}\t{}", record.vm_name, ips.join("\t"));
            }
        }
    }
    Ok(())
}

fn send_command(
    controller: &FleetController,
    command: GuestCommand,
    targets: &str,
    creds: &Credentials,
) -> anyhow::Result<()> {
    let targets = targets
        .split(',')
        .map(|t| t.trim().parse::<Target>())
        .collect::<Result<Vec<_>, _>>()?;

    for target in targets {
        let result = match command {
            GuestCommand::Shutdown => {
                controller.shutdown(target, creds).map(|uuids| uuids.len())
            }
            GuestCommand::Reboot => {
                controller.reboot(target, creds).map(|vms| vms.len())
            }
        };
        match result {
            Ok(count) => info!(?command, %target, count, "done"),
            Err(e) => error!(?command, %target, error = ?e, "command failed"),
        }
    }
    Ok(())
}

/// Clears the terminal's echo flag and restores it when dropped.
struct NoEchoGuard(libc::c_int, libc::termios);

impl NoEchoGuard {
    fn stdin_guard() -> Result<NoEchoGuard, std::io::Error> {
        let fd = std::io::stdin().as_raw_fd();
        let termios = unsafe {
            let mut curr_termios = std::mem::zeroed();
            let r = libc::tcgetattr(fd, &mut curr_termios);
            if r == -1 {
                return Err(std::io::Error::last_os_error());
            }
            curr_termios
        };
        let guard = NoEchoGuard(fd, termios);
        unsafe {
            let mut quiet = termios;
            quiet.c_lflag &= !libc::ECHO;
            let r = libc::tcsetattr(fd, libc::TCSAFLUSH, &quiet);
            if r == -1 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(guard)
    }
}

impl Drop for NoEchoGuard {
    fn drop(&mut self) {
        let r = unsafe { libc::tcsetattr(self.0, libc::TCSADRAIN, &self.1) };
        if r == -1 {
            eprintln!(
                "failed to restore terminal: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// The host password for `sudo`, asked for only if `sudo` wants one.
fn host_password() -> anyhow::Result<String> {
    let passwordless = std::process::Command::new("sudo")
        .args(["-n", "true"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if passwordless {
        return Ok(String::new());
    }

    eprint!("Enter host password: ");
    std::io::stderr().flush()?;
    let mut password = String::new();
    {
        let _guard = NoEchoGuard::stdin_guard().context("disabling echo")?;
        std::io::stdin().lock().read_line(&mut password)?;
    }
    eprintln!();
    Ok(password.trim_end_matches(&['\r', '\n'][..]).to_string())
}

/// Logs to the console at `level` (or as `RUST_LOG` says) and everything to a
/// new file under `logs_dir`. The returned guard flushes the file on drop.
fn set_tracing_subscriber(
    args: &ProcessArgs,
    level: tracing::Level,
    logs_dir: &Utf8Path,
) -> anyhow::Result<(Utf8PathBuf, WorkerGuard)> {
    let now = chrono::Local::now();
    let name = format!("log_{}", now.format("%Y-%m-%d_%H:%M:%S"));
    let appender = tracing_appender::rolling::never(logs_dir, &name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_log = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(LevelFilter::TRACE);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let subscriber = Registry::default().with(file_log);
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("vmfleet".into(), std::io::stdout);
        let subscriber = subscriber
            .with(JsonStorageLayer)
            .with(bunyan_layer.with_filter(filter));
        tracing::subscriber::set_global_default(subscriber)
            .context("installing log subscriber")?;
    } else {
        let stdout_log = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_ansi(!args.disable_ansi)
            .with_filter(filter);
        let subscriber = subscriber.with(stdout_log);
        tracing::subscriber::set_global_default(subscriber)
            .context("installing log subscriber")?;
    }

    Ok((logs_dir.join(name), guard))
}
