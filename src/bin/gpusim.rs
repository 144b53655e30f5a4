//! Predator-prey simulation, GPU-targeted simulator.

use clap::Parser;
use predprey::device::Device;
use predprey::error::Result;
use predprey::error::exit_with;
use predprey::kernels::rng_by_tag;
use predprey::params::Parameters;
use predprey::plan::gpu::LwsRequest;
use predprey::plan::gpu::VwRequest;
use predprey::sim::gpu::GpuConfig;
use predprey::sort::sort_by_tag;

/// Predator-prey simulation with a pipelined dataflow over two command
/// streams.
#[derive(Parser, Debug)]
#[command(name = "gpusim", version)]
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

    /// Maximum number of agents
    #[arg(short = 'm', long, value_name = "SIZE", default_value_t = predprey::DEFAULT_MAX_AGENTS)]
    max_agents: u32,

    /// Packed agent width in bits, 32 or 64
    #[arg(short = 'a', long, value_name = "BITS", default_value_t = predprey::DEFAULT_AGENT_SIZE)]
    agent_size: u32,

    /// Record and report per-kernel timings
    #[arg(long)]
    profile: bool,

    /// Export aggregate profiling info to a file
    #[arg(long = "prof-agg", value_name = "FILE")]
    prof_agg: Option<String>,

    /// Dump per-tick agent and cell state to <PREFIX>_agents.txt and
    /// <PREFIX>_cells.txt
    #[arg(long, value_name = "PREFIX")]
    dump: Option<String>,

    /// Random number generator: xorshift, lcg
    #[arg(short = 'n', long, value_name = "RNG", default_value = predprey::DEFAULT_RNG,
          help_heading = "Algorithm selection")]
    rngen: String,

    /// Agent sorting algorithm: sbitonic, oiabitonic
    #[arg(long = "a-sort", value_name = "SORT", default_value = predprey::DEFAULT_SORT,
          help_heading = "Algorithm selection")]
    a_sort: String,

    /// Options for the sorting algorithm
    #[arg(long = "a-sort-opts", value_name = "OPTS", help_heading = "Algorithm selection")]
    a_sort_opts: Option<String>,

    /// Default local work size
    #[arg(long = "l-def", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_def: usize,

    /// Cell initialization kernel local work size
    #[arg(long = "l-init-cell", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_init_cell: usize,

    /// Agent initialization kernel local work size
    #[arg(long = "l-init-agent", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_init_agent: usize,

    /// Grass kernel local work size
    #[arg(long = "l-grass", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_grass: usize,

    /// Grass reduction kernel local work size
    #[arg(long = "l-reduce-grass", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_reduce_grass: usize,

    /// Agent reduction kernel local work size
    #[arg(long = "l-reduce-agent", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_reduce_agent: usize,

    /// Agent movement kernel local work size
    #[arg(long = "l-move-agent", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_move_agent: usize,

    /// Agent sorting kernel local work size
    #[arg(long = "l-sort-agent", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_sort_agent: usize,

    /// Cell index kernel local work size
    #[arg(long = "l-find-index", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_find_index: usize,

    /// Agent actions kernel local work size
    #[arg(long = "l-action-agent", value_name = "SIZE", default_value_t = 0,
          help_heading = "Kernel local work sizes")]
    l_action_agent: usize,

    /// Grass kernel vector width, 0 auto-detects
    #[arg(long = "vw-grass", value_name = "WIDTH", default_value_t = 0,
          help_heading = "Kernel vector widths")]
    vw_grass: u32,

    /// Grass reduction kernels vector width, 0 auto-detects
    #[arg(long = "vw-reduce-grass", value_name = "WIDTH", default_value_t = 0,
          help_heading = "Kernel vector widths")]
    vw_reduce_grass: u32,

    /// Agent reduction kernels vector width, 0 auto-detects
    #[arg(long = "vw-reduce-agent", value_name = "WIDTH", default_value_t = 0,
          help_heading = "Kernel vector widths")]
    vw_reduce_agent: u32,
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
    let sort = sort_by_tag(&args.a_sort)?;
    let device = Device::select(args.device)?;
    let config = GpuConfig {
        params,
        lws: LwsRequest {
            deflt: args.l_def,
            init_cell: args.l_init_cell,
            init_agent: args.l_init_agent,
            grass: args.l_grass,
            reduce_grass: args.l_reduce_grass,
            reduce_agent: args.l_reduce_agent,
            move_agent: args.l_move_agent,
            sort_agent: args.l_sort_agent,
            find_cell_idx: args.l_find_index,
            action_agent: args.l_action_agent,
        },
        vw: VwRequest {
            grass: args.vw_grass,
            reduce_grass: args.vw_reduce_grass,
            reduce_agent: args.vw_reduce_agent,
        },
        max_agents: args.max_agents,
        agent_size: args.agent_size,
        rng_seed: args.rng_seed,
        rng,
        sort,
        sort_opts: args.a_sort_opts.clone(),
        compiler_opts: args.compiler.clone(),
        profile: args.profile || args.prof_agg.is_some(),
        dump: args.dump.clone(),
    };
    let out = predprey::sim::gpu::run(&device, &config)?;
    out.sink.save(&args.stats)?;
    if let Some(path) = &args.prof_agg {
        out.profiler.export_aggregates(path)?;
    }
    out.profiler.print_summary()?;
    println!("Elapsed time: {:.4e}s", out.elapsed.as_secs_f64());
    Ok(())
}
