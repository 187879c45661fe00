#[cfg(debug_assertions)]
use std::fs::File;

use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
#[cfg(debug_assertions)]
use simplelog::{CombinedLogger, WriteLogger};

use crate::HybridResult;

/// Debug builds log to the terminal and trace everything into `trace.log`.
pub fn log_init() -> HybridResult<()> {
    #[cfg(debug_assertions)]
    {
        CombinedLogger::init(vec![
            TermLogger::new(
                LevelFilter::Debug,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            ),
            WriteLogger::new(
                LevelFilter::Trace,
                Config::default(),
                File::create("trace.log")?,
            ),
        ])?;
    }

    #[cfg(not(debug_assertions))]
    {
        TermLogger::init(
            LevelFilter::Info,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )?;
    }

    Ok(())
}
