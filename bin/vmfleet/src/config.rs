// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{ArgGroup, Parser, ValueEnum};
use vmfleet::request::BuildOption;

/// What `--show` prints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ShowMode {
    /// Every field of every registered guest, as JSON.
    Details,
    /// One line per guest: its name and addresses.
    Ip,
}

/// Commands that can be sent to running guests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GuestCommand {
    Shutdown,
    Reboot,
}

/// Launch, inspect, and control qemu guests for kernel testing.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
#[clap(group(
    ArgGroup::new("action")
        .required(true)
        .args(["config_file", "show", "command"])
))]
pub struct ProcessArgs {
    /// Build and launch the fleet described by this TOML file.
    #[clap(short = 'f', long, value_parser)]
    pub config_file: Option<Utf8PathBuf>,

    /// What to build before launching: all, kernel, module, or run (build
    /// nothing).
    #[clap(short, long, default_value = "all")]
    pub build: BuildOption,

    /// Print the running guests.
    #[clap(
        short,
        long,
        value_enum,
        num_args = 0..=1,
        default_missing_value = "details"
    )]
    pub show: Option<ShowMode>,

    /// Send a command to guests, addressed by a comma-separated list of IPs
    /// or `all`.
    ///
    /// Example: -C reboot 192.168.122.10,192.168.122.12
    #[clap(
        short = 'C',
        long,
        num_args = 2,
        value_names = ["COMMAND", "TARGETS"]
    )]
    pub command: Option<Vec<String>>,

    /// Guest username for commands.
    #[clap(short, long, default_value = "root")]
    pub username: String,

    /// Guest password for commands.
    #[clap(short, long, default_value = "root")]
    pub password: String,

    /// Console log level. Overrides the config file's `log_level`. The log
    /// file always gets everything.
    #[clap(long)]
    pub log_level: Option<tracing::Level>,

    /// Suppress emission of terminal control codes in console log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

impl ProcessArgs {
    /// The command and target list given with `-C`.
    pub fn guest_command(
        &self,
    ) -> anyhow::Result<Option<(GuestCommand, &str)>> {
        let Some(args) = &self.command else {
            return Ok(None);
        };
        let [command, targets] = args.as_slice() else {
            anyhow::bail!("-C takes a command and a list of targets");
        };
        let command = GuestCommand::from_str(command, true)
            .map_err(|e| anyhow::anyhow!("unknown command {command:?}: {e}"))?;
        Ok(Some((command, targets.as_str())))
    }
}
