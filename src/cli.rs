use crate::config::{ConfigError, MailConfig, ReportingConfig, log_dir};
use crate::email::Mailer;
use crate::scheduler::{self, DEFAULT_TIME, parse_time_of_day};
use crate::telemetry::Telemetry;
use chrono::NaiveTime;
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command, crate_version};
use std::process::ExitCode;
use std::sync::mpsc;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    SendNow,
    Run(NaiveTime),
    Usage,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value '{value}' for '--time <HH:MM>': {source}")]
pub struct TimeArgError {
    value: String,
    #[source]
    source: chrono::ParseError,
}

impl Mode {
    /// `--send-now` wins over `--run`; `--time` is only read for `--run`.
    pub fn from_matches(args: &ArgMatches) -> Result<Self, TimeArgError> {
        if args.get_flag("send-now") {
            return Ok(Self::SendNow);
        }
        if args.get_flag("run") {
            let value = args
                .get_one::<String>("time")
                .map(String::as_str)
                .unwrap_or(DEFAULT_TIME);
            let at = parse_time_of_day(value).map_err(|source| TimeArgError {
                value: value.to_string(),
                source,
            })?;
            return Ok(Self::Run(at));
        }
        Ok(Self::Usage)
    }
}

pub fn command() -> Command {
    Command::new("whimsy")
        .about(format!(
            "{}\n{}",
            "Send a daily loving email to your Queen of Whimsies.",
            "SMTP settings are read from the environment or a local .env file.",
        ))
        .arg(
            Arg::new("send-now")
                .action(ArgAction::SetTrue)
                .long("send-now")
                .help("Send the email immediately and exit"),
        )
        .arg(
            Arg::new("run")
                .action(ArgAction::SetTrue)
                .long("run")
                .help("Run scheduler to send every morning at --time local time"),
        )
        .arg(
            Arg::new("time")
                .long("time")
                .value_name("HH:MM")
                .default_value(DEFAULT_TIME)
                .help("Time of day to send in HH:MM (24h) when using --run"),
        )
        .version(crate_version!())
}

/// Unwraps the mail configuration, logging and reporting it when it is invalid.
fn require_config(
    loaded: Result<MailConfig, ConfigError>,
    telemetry: &Telemetry,
) -> Option<MailConfig> {
    match loaded {
        Ok(config) => Some(config),
        Err(e) => {
            error!(error = %e, "Cannot start: invalid configuration");
            telemetry.report(&e);
            None
        }
    }
}

pub fn main() -> ExitCode {
    let mut cli = command();
    let args = cli.get_matches_mut();

    let mode = match Mode::from_matches(&args) {
        Ok(mode) => mode,
        Err(e) => cli.error(ErrorKind::ValueValidation, e).exit(),
    };
    if mode == Mode::Usage {
        if let Err(err) = cli.print_help() {
            eprintln!("{err}");
        }
        return ExitCode::SUCCESS;
    }

    // Logging comes up before the mail settings are parsed so that a bad
    // setting is recorded like any other failure.
    let reporting = ReportingConfig::load();
    let telemetry = match Telemetry::init(&log_dir(), reporting.sentry_dsn()) {
        Ok(t) => t,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };
    telemetry.install_panic_hook();

    let Some(config) = require_config(MailConfig::load(), &telemetry) else {
        return ExitCode::from(2);
    };

    let mailer = Mailer::new(config, telemetry);

    match mode {
        Mode::SendNow => {
            if mailer.send().is_sent() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Mode::Run(at) => {
            let (stop_tx, stop_rx) = mpsc::channel();
            if let Err(e) = ctrlc::set_handler(move || {
                let _ = stop_tx.send(());
            }) {
                error!(error = %e, "Failed to install interrupt handler");
                return ExitCode::FAILURE;
            }
            scheduler::run_daily(at, &stop_rx, move || {
                mailer.send();
            });
            ExitCode::SUCCESS
        }
        Mode::Usage => ExitCode::SUCCESS,
    }
}
