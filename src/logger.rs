use anyhow::Result;
use fern::Dispatch;

use crate::config::Log;

/// Wire the log facade to stdout and, when configured, a log file.
pub fn init(log: &Log) -> Result<()> {
    let mut logger = Dispatch::new()
        .level(log.level.as_filter())
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}] - ({}) - {}",
                record.level(),
                record.file_static().unwrap_or("*"),
                message
            ))
        })
        .chain(std::io::stdout());

    if let Some(path) = &log.file {
        logger = logger.chain(fern::log_file(path)?);
    }

    logger.apply()?;
    Ok(())
}
