use crate::config::*;
use tracing_subscriber::{
    prelude::*,
    filter::filter_fn,
    fmt::MakeWriter,
    Layer,
    registry::LookupSpan,
};
use tracing_core::LevelFilter;
use tracing::Subscriber;

use std::{
    io::{
        Error as IoError
    },
    path::Path,
};

fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync + 'static>
    where S: Subscriber + Send + Sync,
          for<'span> S: LookupSpan<'span>,
          W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(ansi);

    match format
    {
        LogFormat::Full => layer.boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

fn build_target<S>(conf: LogEntry, dir: impl AsRef<Path>) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>, IoError>
    where S: Subscriber + Send + Sync,
          for<'span> S: LookupSpan<'span>,
{
    let layer = match &conf.target
    {
        LogTarget::File { filename } =>
        {
            std::fs::create_dir_all(dir.as_ref())?;
            format_layer(conf.format, tracing_appender::rolling::daily(dir, filename), false)
        }
        LogTarget::Builtin(BuiltinLogTarget::Stdout) =>
        {
            format_layer(conf.format, std::io::stdout, true)
        }
        LogTarget::Builtin(BuiltinLogTarget::Stderr) =>
        {
            format_layer(conf.format, std::io::stderr, true)
        }
    };

    let level: LevelFilter = conf.level.map(Into::into).unwrap_or(LevelFilter::TRACE);
    let modules = conf.modules;

    let filter = filter_fn(move |metadata| {
        metadata.level() <= &level &&
            (
                modules.is_empty() ||
                    if let Some(module) = metadata.module_path() {
                        modules.iter().any(|m| module.starts_with(m))
                    } else {
                        true
                    }
            )
    });

    Ok(layer.with_filter(filter).boxed())
}

/// Build a subscriber from the logging section of a server config.
///
/// The caller is responsible for installing it, usually with
/// [`SubscriberInitExt::init`](tracing_subscriber::util::SubscriberInitExt::init).
pub fn build_subscriber(conf: LoggingConfig) -> Result<impl Subscriber + Send + Sync, IoError>
{
    let mut layers = Vec::new();

    for target in conf.targets
    {
        layers.push(build_target(target, &conf.dir)?);
    }

    // The global filter is for excluding overly verbose messages from external modules - its default
    // needs to be permissive so that individual log targets can filter as they need to
    let filter = tracing_subscriber::filter::Targets::new()
                    .with_default(conf.default_level.unwrap_or(LogLevel::Trace))
                    .with_targets(conf.module_levels);

    Ok(tracing_subscriber::registry()
            .with(filter)
            .with(layers)
        )
}
