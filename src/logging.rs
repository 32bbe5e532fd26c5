use std::sync::Once;

use log::LevelFilter;

static LOG_ONCE: Once = Once::new();

/// Filter directives from `PICO_LOG`, falling back to `RUST_LOG`.
fn env_filters() -> Option<String> {
    std::env::var("PICO_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Level the logger is installed with. `verbose` raises it to at least debug.
pub fn effective_level(env: LevelFilter, verbose: bool) -> LevelFilter {
    if verbose {
        env.max(LevelFilter::Debug)
    } else {
        env
    }
}

/// Install the stderr logger, honouring `PICO_LOG`/`RUST_LOG` (plain levels
/// or `env_logger` directives). Only the first call has an effect.
pub fn init_logging(verbose: bool) {
    LOG_ONCE.call_once(|| {
        let filters = env_filters();
        let env_level = parse_level(filters.as_deref()).unwrap_or(LevelFilter::Info);

        let mut builder = env_logger::Builder::new();
        match filters.as_deref() {
            Some(directives) if parse_level(Some(directives)).is_none() => {
                builder.parse_filters(directives);
                if verbose {
                    builder.filter_level(LevelFilter::Debug);
                }
            }
            _ => {
                builder.filter_level(effective_level(env_level, verbose));
            }
        }
        builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}
