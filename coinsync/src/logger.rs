use std::{path::Path, thread, time};

fn timestamp_secs() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .unwrap_or_else(|e| {
            println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
            time::Duration::from_secs(0)
        })
        .as_secs()
}

/// Install the global logger.
///
/// Lines look like `[<timestamp>][<target>][<level>][thread <name>] <message>`. They always go
/// to stdout, and are appended to `log_file` as well if one is given.
pub fn setup_logger(
    log_level: log::LevelFilter,
    log_file: Option<&Path>,
) -> Result<(), fern::InitError> {
    let mut dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][thread {}] {}",
                timestamp_secs(),
                record.target(),
                record.level(),
                thread::current().name().unwrap_or("unnamed"),
                message
            ))
        })
        .level(log_level)
        // The HTTP stack of the data sources is very chatty at debug level.
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatcher = dispatcher.chain(fern::log_file(path)?);
    }

    dispatcher.apply()?;

    Ok(())
}
