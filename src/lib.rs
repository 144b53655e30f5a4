pub mod device;
pub mod error;
pub mod kernels;
pub mod params;
pub mod plan;
pub mod profile;
pub mod seeds;
pub mod sim;
pub mod sort;
pub mod stats;

/// Sheep species identifier.
pub const SHEEP_ID: u32 = 0;

/// Wolf species identifier.
pub const WOLF_ID: u32 = 1;

/// Reserved index terminating a cell's agent chain.
pub const NULL_AGENT: u32 = u32::MAX;

/// A minimal number of possibly existing agents is required to determine
/// the minimum global worksizes of the agent-dependent kernels.
pub const MIN_AGENTS: u32 = 2;

// Command-line defaults shared by both simulators.
pub const DEFAULT_PARAMS_FILE: &str = "config.txt";
pub const DEFAULT_STATS_FILE: &str = "stats.txt";
pub const DEFAULT_SEED: u32 = 0;
/// Default agent arena capacity; at 16 bytes per agent this allocates
/// 256Mb up front, trading memory for allocation success.
pub const DEFAULT_MAX_AGENTS: u32 = 16_777_216;
pub const DEFAULT_MAX_AGENT_SHUF: u32 = 64;
pub const DEFAULT_AGENT_SIZE: u32 = 64;
pub const DEFAULT_RNG: &str = "xorshift";
pub const DEFAULT_SORT: &str = "sbitonic";

/// Progress bar over the simulation loop.
pub fn progress(n: u64) -> indicatif::ProgressBar {
    let style = "{spinner:.cyan} {elapsed} ~ {percent:>3}% {wide_bar:.cyan}";
    let style = indicatif::ProgressStyle::with_template(style)
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    let progress = indicatif::ProgressBar::new(n);
    progress.set_style(style);
    progress
}

/// Initialize terminal logging; the level comes from the `PREDPREY_LOG`
/// environment variable and defaults to `info`.
pub fn log_init() {
    let level = std::env::var("PREDPREY_LOG")
        .ok()
        .and_then(|v| v.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let config = simplelog::ConfigBuilder::new()
        .set_location_level(log::LevelFilter::Off)
        .set_target_level(log::LevelFilter::Off)
        .set_thread_level(log::LevelFilter::Off)
        .build();
    let _ = simplelog::TermLogger::init(
        level,
        config,
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
}
