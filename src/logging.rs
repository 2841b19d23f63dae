use std::{path::Path, str::FromStr};

use anyhow::Context;
use log::LevelFilter;
use log4rs::{
    append::{
        console::ConsoleAppender,
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Handle,
};

use crate::config::{LogSettings, LogWay};

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {h({l:<5})} [{t}] {m}{n}";
/// Size at which the live log file is rolled.
const ROLL_SIZE: u64 = 16 * 1024 * 1024;

/// Installs the console logger used until the decoded configuration is
/// applied through the returned handle.
pub fn init_logging(debug: bool) -> anyhow::Result<Handle> {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let handle = log4rs::init_config(console_config(level)?)
        .context("failed to initialize the default logging configuration")?;
    Ok(handle)
}

/// Replaces the running logging configuration with the one described by
/// `settings`. `debug` raises the level to at least `debug`.
pub fn apply(handle: &Handle, settings: &LogSettings, debug: bool) -> anyhow::Result<()> {
    handle.set_config(build_config(settings, debug)?);
    log::debug!("logging configured: {:?}", settings);
    Ok(())
}

fn build_config(settings: &LogSettings, debug: bool) -> anyhow::Result<log4rs::Config> {
    let mut level = LevelFilter::from_str(&settings.level)
        .with_context(|| format!("unknown log level \"{}\"", settings.level))?;
    if debug && level < LevelFilter::Debug {
        level = LevelFilter::Debug;
    }
    match settings.way {
        LogWay::Console => console_config(level),
        LogWay::File => {
            let path = settings
                .file
                .as_ref()
                .context("log way \"file\" requires a log file path")?;
            let file = rolling_file(path, settings.max_days)?;
            let config = log4rs::Config::builder()
                .appender(Appender::builder().build("file", Box::new(file)))
                .build(Root::builder().appender("file").build(level))?;
            Ok(config)
        }
    }
}

/// File appender keeping `max_days` rolled files as `<path>.1` ..
/// `<path>.<max_days>`, oldest last.
fn rolling_file(path: &Path, max_days: u32) -> anyhow::Result<RollingFileAppender> {
    let trigger = SizeTrigger::new(ROLL_SIZE);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller(path, max_days)?));
    RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(path, Box::new(policy))
        .with_context(|| format!("failed to open log file \"{}\"", path.display()))
}

fn roller(path: &Path, max_days: u32) -> anyhow::Result<FixedWindowRoller> {
    anyhow::ensure!(max_days > 0, "log max_days must be at least 1");
    let pattern = format!("{}.{{}}", path.display());
    FixedWindowRoller::builder()
        .base(1)
        .build(&pattern, max_days)
        .map_err(|error| anyhow::anyhow!("invalid log roll pattern \"{}\": {}", pattern, error))
}

fn console_config(level: LevelFilter) -> anyhow::Result<log4rs::Config> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let config = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;
    Ok(config)
}
