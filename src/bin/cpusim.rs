//! Predator-prey simulation, CPU-targeted simulator.

use clap::Parser;
use predprey::device::Device;
use predprey::error::Result;
use predprey::error::exit_with;
use predprey::kernels::rng_by_tag;
use predprey::params::Parameters;
use predprey::sim::cpu::CpuConfig;

/// Predator-prey simulation with a row-striped cooperative scheduler.
#[derive(Parser, Debug)]
#[command(name = "cpusim", version)]
struct Args {
    /// Parameters file
    #[arg(short = 'p', long, value_name = "FILE", default_value = predprey::DEFAULT_PARAMS_FILE)]
    params: String,

    /// Statistics output file
    #[arg(short = 's', long, value_name = "FILE", default_value = predprey::DEFAULT_STATS_FILE)]
    stats: String,

    /// Extra compiler options for the device program
    #[arg(short = 'c', long, value_name = "OPTS")]
    compiler: Option<String>,

    /// Global work size (default is maximum possible)
    #[arg(short = 'g', long, value_name = "SIZE", default_value_t = 0)]
    globalsize: usize,

    /// Local work size (default is selected by the scheduler)
    #[arg(short = 'l', long, value_name = "SIZE", default_value_t = 0)]
    localsize: usize,

    /// Device index (if not given and more than one device is available,
    /// choose the device from a menu)
    #[arg(short = 'd', long, value_name = "INDEX")]
    device: Option<usize>,

    /// List the available devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Seed for the random number generator
    #[arg(short = 'r', long, value_name = "SEED", default_value_t = predprey::DEFAULT_SEED)]
    rng_seed: u32,

    /// Random number generator: xorshift, lcg
    #[arg(short = 'n', long, value_name = "RNG", default_value = predprey::DEFAULT_RNG)]
    rngen: String,

    /// Maximum number of agents
    #[arg(short = 'm', long, value_name = "SIZE", default_value_t = predprey::DEFAULT_MAX_AGENTS)]
    max_agents: u32,

    /// Slots probed when placing a newborn before the linear fallback
    #[arg(long = "max-agents-shuff", value_name = "SIZE",
          default_value_t = predprey::DEFAULT_MAX_AGENT_SHUF)]
    max_agents_shuff: u32,

    /// Record and report per-kernel timings
    #[arg(long)]
    profile: bool,

    /// Export aggregate profiling info to a file
    #[arg(long = "prof-agg", value_name = "FILE")]
    prof_agg: Option<String>,
}

fn main() {
    predprey::log_init();
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            eprint!("{}", e);
            std::process::exit(-1);
        }
        Err(e) => {
            // Help or version request.
            print!("{}", e);
            std::process::exit(0);
        }
    };
    if args.list_devices {
        print!("{}", Device::listing());
        return;
    }
    if let Err(e) = execute(&args) {
        exit_with(e);
    }
}

fn execute(args: &Args) -> Result<()> {
    let params = Parameters::load(&args.params)?;
    let rng = rng_by_tag(&args.rngen)?;
    let device = Device::select(args.device)?;
    let config = CpuConfig {
        params,
        gws: args.globalsize,
        lws: args.localsize,
        max_agents: args.max_agents,
        max_agent_shuf: args.max_agents_shuff,
        rng_seed: args.rng_seed,
        rng,
        compiler_opts: args.compiler.clone(),
        profile: args.profile || args.prof_agg.is_some(),
    };
    let out = predprey::sim::cpu::run(&device, &config)?;
    out.sink.save(&args.stats)?;
    if let Some(path) = &args.prof_agg {
        out.profiler.export_aggregates(path)?;
    }
    out.profiler.print_summary()?;
    println!("Elapsed time: {:.4e}s", out.elapsed.as_secs_f64());
    Ok(())
}
