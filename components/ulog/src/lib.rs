//! Logger set up shared by the segment tool and the tests of the workspace.
//!
//! Filtering follows `RUST_LOG`; when unset, `info` is used by the tool and `debug` by the tests.

#[cfg(feature = "env")]
use std::io::Write;

#[cfg(feature = "env")]
fn builder(default_filter: &str) -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} [{}] {}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder
}

/// Install the console logger of the command line tool.
#[cfg(feature = "env")]
pub fn init_log() -> Result<(), log::SetLoggerError> {
    builder("info").try_init()
}

/// Install a logger captured by the test harness. Calling it more than once is harmless.
#[cfg(feature = "env")]
pub fn try_init_log() {
    let _ = builder("debug").is_test(true).try_init();
}
