//! Bridge from `morphine_config::Config` sections to runtime types.

use morphine_config::{ExtensionsSection, LoggingSection};
use morphine_extensions::SandboxConfig;
use morphine_telemetry::{LogConfig, LogFormat};

/// Sandbox limits from `[extensions]`.
pub(crate) fn sandbox_config(section: &ExtensionsSection) -> SandboxConfig {
    SandboxConfig {
        turn_timeout: section.load_timeout(),
        init_timeout: section.init_timeout(),
        handler_timeout: section.handler_timeout(),
        memory_limit: section.memory_limit_bytes,
        static_prefix: section.static_prefix.clone(),
        ..SandboxConfig::default()
    }
}

/// Logging setup from `[logging]`. `verbose` forces `debug`.
pub(crate) fn log_config(section: &LoggingSection, verbose: bool) -> LogConfig {
    let level = if verbose { "debug" } else { section.level.as_str() };
    let format = section.format.parse::<LogFormat>().unwrap_or_else(|e| {
        // Logging is not up yet.
        eprintln!("{e}; using compact log format");
        LogFormat::Compact
    });
    section
        .directives
        .iter()
        .fold(LogConfig::new(level).with_format(format), |config, directive| {
            config.with_directive(directive.clone())
        })
}
