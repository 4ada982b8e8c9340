// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Logging setup shared by all of the control-plane components.

use std::fs::OpenOptions;
use std::str::FromStr;

use anyhow::Context;
use slog::Drain;

/// All logs are emitted in one of these two formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-friendly, colorized terminal output
    Human,
    /// Newline-delimited JSON in the bunyan format
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            x => Err(anyhow::anyhow!("invalid log format: {x}")),
        }
    }
}

fn root_logger<D>(drain: D, name: String) -> slog::Logger
where
    D: Drain<Ok = ()> + Send + 'static,
    <D as Drain>::Err: std::fmt::Debug,
{
    let drain = slog_async::Async::new(drain.fuse())
        .chan_size(32768)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!("name" => name))
}

/// Build the root logger for a daemon or test harness.  Messages go to
/// `log_file` if one is named, and to stdout otherwise.
pub fn init(
    name: impl ToString,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let name = name.to_string();

    let logger = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open {path}"))?;
            match log_format {
                LogFormat::Human => {
                    let decorator = slog_term::PlainDecorator::new(file);
                    let drain = slog_term::FullFormat::new(decorator).build();
                    root_logger(drain, name)
                }
                LogFormat::Json => {
                    let bunyan_name: &'static str =
                        Box::leak(name.clone().into_boxed_str());
                    let drain =
                        slog_bunyan::with_name(bunyan_name, file).build();
                    root_logger(drain, name)
                }
            }
        }
        None => match log_format {
            LogFormat::Human => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain = slog_term::FullFormat::new(decorator).build();
                root_logger(drain, name)
            }
            LogFormat::Json => {
                let bunyan_name: &'static str =
                    Box::leak(name.clone().into_boxed_str());
                let drain =
                    slog_bunyan::with_name(bunyan_name, std::io::stdout())
                        .build();
                root_logger(drain, name)
            }
        },
    };

    Ok(logger)
}
