//! Driver for the GPU-targeted simulator.
//!
//! Two command queues overlap the independent pipeline lanes: queue 0
//! carries the cell work (grass reductions, grass growth), queue 1 the
//! agent work (agent reduction, statistics readback, movement, sort, cell
//! indexing, actions). Cross-lane ordering runs through events:
//!
//! - the grass reduction of tick k waits on the agent actions of k-1,
//! - both second reduction passes of tick k wait on the statistics
//!   readback of k-1, so the host has read the record before it is
//!   overwritten,
//! - the readback of tick k waits on the grass reduction of k,
//! - the actions of tick k wait on the grass growth of k (both touch the
//!   countdown array from different lanes).
//!
//! Worksizes of the agent-dependent kernels are recomputed every tick
//! from `max_agents_iter`, the bound on how many agents can exist.

use super::RunOutput;
use crate::MIN_AGENTS;
use crate::device::Device;
use crate::device::buffer::BufferRegistry;
use crate::device::buffer::Pinned;
use crate::device::event::Event;
use crate::error::Error;
use crate::error::Result;
use crate::kernels::RngInfo;
use crate::kernels::gpu::AgentWord;
use crate::kernels::gpu::GpuBuffers;
use crate::kernels::push_param_defs;
use crate::params::Parameters;
use crate::plan::gpu::GpuPlan;
use crate::plan::gpu::LwsRequest;
use crate::plan::gpu::VwRequest;
use crate::plan::next_multiple;
use crate::profile::Profiler;
use crate::seeds::HostRng;
use crate::sort::SortInfo;
use crate::stats::StatsRecord;
use crate::stats::StatsSink;
use std::fmt::Write;
use std::time::Instant;

pub struct GpuConfig {
    pub params: Parameters,
    pub lws: LwsRequest,
    pub vw: VwRequest,
    pub max_agents: u32,
    /// Packed agent width in bits, 64 or 32.
    pub agent_size: u32,
    pub rng_seed: u32,
    pub rng: &'static RngInfo,
    pub sort: &'static SortInfo,
    pub sort_opts: Option<String>,
    pub compiler_opts: Option<String>,
    pub profile: bool,
    /// Dump live agents and cell state to `<prefix>_agents.txt` and
    /// `<prefix>_cells.txt` every tick. Forces a synchronisation per
    /// tick, so overlapping lanes no longer overlap.
    pub dump: Option<String>,
}

/// Compile options for the GPU program.
fn compiler_opts(config: &GpuConfig, plan: &GpuPlan) -> String {
    let mut opts = String::new();
    let _ = write!(
        opts,
        "-D VW_GRASS={} -D VW_GRASSREDUCE={} -D VW_AGENTREDUCE={} \
         -D REDUCE_GRASS_NUM_WORKGROUPS={} -D MAX_LWS={} -D MAX_AGENTS={} -D CELL_NUM={} ",
        plan.vw_grass,
        plan.vw_reduce_grass,
        plan.vw_reduce_agent,
        plan.reduce_grass_num_workgroups(),
        plan.max_lws,
        config.max_agents,
        config.params.grid_xy(),
    );
    push_param_defs(&mut opts, &config.params);
    let _ = write!(
        opts,
        "-D {} -D {} -D {} ",
        if config.agent_size == 64 {
            "PPG_AG_64"
        } else {
            "PPG_AG_32"
        },
        config.rng.compiler_const,
        config.sort.compiler_const,
    );
    if let Some(extra) = &config.compiler_opts {
        opts.push_str(extra);
    }
    opts
}

/// Run the whole simulation, dispatching on the packed agent width.
pub fn run(device: &Device, config: &GpuConfig) -> Result<RunOutput> {
    match config.agent_size {
        64 => run_width::<u64>(device, config),
        32 => run_width::<u32>(device, config),
        _ => Err(Error::InvalidArgs(
            "the agent size must be either 32 or 64".into(),
        )),
    }
}

fn run_width<W: AgentWord>(device: &Device, config: &GpuConfig) -> Result<RunOutput> {
    let params = &config.params;
    let plan = GpuPlan::compute(
        device,
        params,
        &config.lws,
        &config.vw,
        config.max_agents,
        config.agent_size,
    )?;

    // The packed layout caps the coordinate fields.
    let side_limit = 1u32 << (if W::BITS == 64 { 16 } else { 10 });
    if params.grid_x > side_limit || params.grid_y > side_limit {
        return Err(Error::InvalidArgs(format!(
            "grid {}x{} does not fit the {}-bit agent layout",
            params.grid_x,
            params.grid_y,
            W::BITS
        )));
    }

    let opts = compiler_opts(config, &plan);
    let program = device.build_program(&opts)?;

    let grid_xy = params.grid_xy() as usize;
    let mut registry = BufferRegistry::new();
    let buffers: GpuBuffers<W> = GpuBuffers {
        stats: registry.create("stats", 1),
        cells_grass: registry.create(
            "cells_grass",
            next_multiple(grid_xy, plan.vw_grass as usize),
        ),
        cells_index: registry.create("cells_index", grid_xy),
        agents: registry.create("agents", config.max_agents as usize),
        reduce_grass: registry.create("reduce_grass", plan.reduce_grass_num_workgroups()),
        reduce_agent: registry.create("reduce_agent", plan.lws_reduce_agent1),
        seeds: registry.create("seeds", (config.max_agents as usize).max(grid_xy)),
    };
    log_plan(&plan, &registry, &opts);

    let started = Instant::now();

    // Host-seeded device RNG state, one slot per agent or cell.
    {
        let mut seeds = buffers.seeds.map_mut()?;
        let seeds_len = seeds.len();
        seeds.copy_from_slice(&HostRng::new(config.rng_seed).seed_vector(seeds_len));
    }

    let kernels = crate::kernels::gpu::create(&program, &buffers);
    let mut sorter = crate::sort::create_sorter(
        config.sort.tag,
        config.sort_opts.as_deref(),
        &program,
        &buffers.agents,
    )?;
    log::debug!(
        "sorting with {} ({})",
        config.sort.tag,
        sorter.kernel_names().join(", ")
    );

    let cq0 = device.queue("queue-0");
    let cq1 = device.queue("queue-1");
    let mut profiler = Profiler::new(config.profile);
    let mut sink = StatsSink::new(params.iters, params.grid_xy());

    // The statistics record is host-mapped once and reused for every
    // tick's readback; the host copies it out after each read event.
    let pinned: Pinned<StatsRecord> = Pinned::new();

    let track = |profiler: &mut Profiler, evt: Event| {
        profiler.track(&evt);
        evt
    };

    // Initialisation. Agent init waits on cell init: both advance the
    // same seed slots.
    let evt_init_cell = track(
        &mut profiler,
        cq0.enqueue_kernel(
            &kernels.init_cell,
            plan.init_cell.gws,
            plan.init_cell.lws,
            &[],
            &[],
        )?,
    );
    let evt_init_agent = track(
        &mut profiler,
        cq1.enqueue_kernel(
            &kernels.init_agent,
            plan.init_agent.gws,
            plan.init_agent.lws,
            &[],
            &[evt_init_cell],
        )?,
    );

    let mut dump = config
        .dump
        .as_deref()
        .map(DumpFiles::create)
        .transpose()?;
    if let Some(dump) = &mut dump {
        evt_init_agent.wait()?;
        dump.write(-1, &buffers, config.max_agents, params.grid_x)?;
    }

    let mut max_agents_iter = (params.init_sheep + params.init_wolves).max(MIN_AGENTS);
    let mut evt_action: Option<Event> = None;
    let mut evt_read_stats: Option<Event> = None;

    let bar = crate::progress(params.iters as u64 + 1);
    for iter in 0..=params.iters {
        // Gather statistics: grass reduction pair on the cells lane,
        // agent reduction pair on the agents lane, then the readback.
        let wait_action = evt_action.as_slice();
        track(
            &mut profiler,
            cq0.enqueue_kernel(
                &kernels.reduce_grass1,
                plan.reduce_grass1.gws,
                plan.reduce_grass1.lws,
                &[],
                wait_action,
            )?,
        );

        let sizes = plan.reduce_agent_sizes(max_agents_iter);
        track(
            &mut profiler,
            cq1.enqueue_kernel(
                &kernels.reduce_agent1,
                sizes.gws1,
                plan.lws_reduce_agent1,
                &[max_agents_iter as u64],
                &[],
            )?,
        );

        let wait_read = evt_read_stats.as_slice();
        let evt_reduce_grass2 = track(
            &mut profiler,
            cq0.enqueue_kernel(
                &kernels.reduce_grass2,
                plan.reduce_grass2.gws,
                plan.reduce_grass2.lws,
                &[],
                wait_read,
            )?,
        );
        track(
            &mut profiler,
            cq1.enqueue_kernel(
                &kernels.reduce_agent2,
                sizes.ws2,
                sizes.ws2,
                &[sizes.num_workgroups as u64],
                wait_read,
            )?,
        );

        let stats_buffer = buffers.stats.clone();
        let pinned_slot = pinned.clone();
        let read = cq1.enqueue("Read: stats", &[evt_reduce_grass2], move || {
            let record = stats_buffer.map()?[0];
            pinned_slot.store(record);
            Ok(())
        })?;
        profiler.track(&read);
        evt_read_stats = Some(read);

        // The last tick only gathers; no further state advances.
        if iter == params.iters {
            break;
        }

        // Grass growth on the cells lane.
        let evt_grass = track(
            &mut profiler,
            cq0.enqueue_kernel(&kernels.grass, plan.grass.gws, plan.grass.lws, &[], &[])?,
        );

        // Agent movement.
        let gws_move = GpuPlan::agent_gws(plan.lws_move_agent, max_agents_iter);
        track(
            &mut profiler,
            cq1.enqueue_kernel(&kernels.move_agent, gws_move, plan.lws_move_agent, &[], &[])?,
        );

        // Agent compaction.
        let evt_sort = sorter.sort(&cq1, max_agents_iter, plan.lws_sort_agent, &mut profiler)?;

        // The sort (and with it, in queue order, the readback) must have
        // finished before the host can size the rest of the tick.
        evt_sort.wait()?;
        let record = pinned.load();
        sink.set(iter as usize, record);
        let live = record.sheep as u64 + record.wolves as u64;
        if live > config.max_agents as u64 {
            return Err(Error::OutOfResources(format!(
                "agents required for the next iteration above the limit: iteration {}, \
                 required {}, limit {}",
                iter, live, config.max_agents
            )));
        }
        max_agents_iter = (live as u32).max(MIN_AGENTS);

        // Cell index reconstruction over the sorted agents.
        let gws_find = GpuPlan::agent_gws(plan.lws_find_cell_idx, max_agents_iter);
        track(
            &mut profiler,
            cq1.enqueue_kernel(
                &kernels.find_cell_idx,
                gws_find,
                plan.lws_find_cell_idx,
                &[max_agents_iter as u64],
                &[],
            )?,
        );

        // Agent actions; newborns land in the upper half of the scan
        // range, so the arena must hold twice the dispatch size.
        let gws_action = GpuPlan::agent_gws(plan.lws_action_agent, max_agents_iter);
        if gws_action as u64 * 2 > config.max_agents as u64 {
            return Err(Error::OutOfResources(format!(
                "not enough memory for existing and possible new agents: iteration {}, \
                 total possible agents {}, limit {}",
                iter,
                gws_action * 2,
                config.max_agents
            )));
        }
        let action = track(
            &mut profiler,
            cq1.enqueue_kernel(
                &kernels.action_agent,
                gws_action,
                plan.lws_action_agent,
                &[],
                &[evt_grass],
            )?,
        );
        if let Some(dump) = &mut dump {
            action.wait()?;
            dump.write(iter as i64, &buffers, config.max_agents, params.grid_x)?;
        }
        evt_action = Some(action);

        // Actions may at most double the population; every possible
        // newborn slot stays inside the next tick's scan range.
        max_agents_iter = (gws_action * 2) as u32;
        bar.inc(1);
    }
    bar.finish_and_clear();

    // Final readback, then release the pinned mapping and drain both
    // queues.
    if let Some(read) = &evt_read_stats {
        read.wait()?;
    }
    sink.set(params.iters as usize, pinned.load());
    drop(pinned);
    cq0.finish()?;
    cq1.finish()?;

    Ok(RunOutput {
        sink,
        profiler,
        compiler_opts: opts,
        elapsed: started.elapsed(),
    })
}

/// Per-tick state dump for debugging the pipeline: live agents with
/// their unpacked fields, and every occupied cell with its index span
/// and grass countdown.
struct DumpFiles {
    agents: std::fs::File,
    cells: std::fs::File,
}

impl DumpFiles {
    fn create(prefix: &str) -> Result<Self> {
        let open = |suffix: &str| {
            let path = format!("{}_{}.txt", prefix, suffix);
            std::fs::File::create(&path)
                .map_err(|e| Error::Library(format!("unable to open file \"{}\": {}", path, e)))
        };
        Ok(Self {
            agents: open("agents")?,
            cells: open("cells")?,
        })
    }

    fn write<W: AgentWord>(
        &mut self,
        iter: i64,
        buffers: &GpuBuffers<W>,
        max_agents: u32,
        grid_x: u32,
    ) -> Result<()> {
        use std::io::Write as _;
        let fail = |e: std::io::Error| Error::Library(format!("writing dump: {}", e));

        let agents = buffers.agents.map()?;
        writeln!(self.agents, "\nIteration {}", iter).map_err(fail)?;
        for (i, agent) in agents.iter().enumerate() {
            if !agent.is_dead() {
                writeln!(
                    self.agents,
                    "[{:4}] ({:4}, {:4}) type={} energy={}",
                    i,
                    agent.x(),
                    agent.y(),
                    agent.kind(),
                    agent.energy()
                )
                .map_err(fail)?;
            }
        }

        let grass = buffers.cells_grass.map()?;
        let index = buffers.cells_index.map()?;
        writeln!(self.cells, "\nIteration {}", iter).map_err(fail)?;
        for (cell, span) in index.iter().enumerate() {
            if span.first != max_agents {
                writeln!(
                    self.cells,
                    "({}, {}) -> ({}, {}) [Grass: {}]",
                    cell as u32 % grid_x,
                    cell as u32 / grid_x,
                    span.first,
                    span.last,
                    grass[cell]
                )
                .map_err(fail)?;
            }
        }
        Ok(())
    }
}

fn log_plan(plan: &GpuPlan, registry: &BufferRegistry, opts: &str) {
    log::info!("device memory: {} bytes", registry.total_bytes());
    log::debug!("compiler options: {}", opts.trim_end());
    log::info!(
        "worksizes: init_cell {}/{} | init_agent {}/{} | grass {}/{} | reduce_grass {}/{} \
         then {}/{} | reduce_agent -/{} | move -/{} | sort -/{} | find -/{} | action -/{}",
        plan.init_cell.gws,
        plan.init_cell.lws,
        plan.init_agent.gws,
        plan.init_agent.lws,
        plan.grass.gws,
        plan.grass.lws,
        plan.reduce_grass1.gws,
        plan.reduce_grass1.lws,
        plan.reduce_grass2.gws,
        plan.reduce_grass2.lws,
        plan.lws_reduce_agent1,
        plan.lws_move_agent,
        plan.lws_sort_agent,
        plan.lws_find_cell_idx,
        plan.lws_action_agent,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::rng_by_tag;
    use crate::sort::sort_by_tag;

    fn params() -> Parameters {
        Parameters {
            init_sheep: 20,
            sheep_gain_from_food: 4,
            sheep_reproduce_threshold: 20,
            sheep_reproduce_prob: 5,
            init_wolves: 5,
            wolves_gain_from_food: 8,
            wolves_reproduce_threshold: 20,
            wolves_reproduce_prob: 5,
            grass_restart: 10,
            grid_x: 16,
            grid_y: 16,
            iters: 12,
        }
    }

    fn config(params: Parameters) -> GpuConfig {
        GpuConfig {
            params,
            lws: LwsRequest {
                deflt: 16,
                ..Default::default()
            },
            vw: VwRequest::default(),
            max_agents: 1 << 14,
            agent_size: 64,
            rng_seed: 0,
            rng: rng_by_tag("xorshift").unwrap(),
            sort: sort_by_tag("sbitonic").unwrap(),
            sort_opts: None,
            compiler_opts: None,
            profile: true,
            dump: None,
        }
    }

    fn device() -> Device {
        Device::all().remove(0)
    }

    #[test]
    fn stats_table_shape_and_tick_zero() {
        let out = run(&device(), &config(params())).unwrap();
        let rows = out.sink.records();
        assert_eq!(rows.len(), 13);
        assert_eq!(rows[0].sheep, 20);
        assert_eq!(rows[0].wolves, 5);
        assert!(rows[0].grass > 0 && rows[0].grass <= 256);
        for row in rows {
            assert!(row.sheep as u64 + row.wolves as u64 <= 1 << 14);
            assert_eq!(row.sheep == 0, row.sheep_energy == 0);
            assert_eq!(row.wolves == 0, row.wolves_energy == 0);
        }
    }

    #[test]
    fn determinism_for_fixed_seed() {
        let a = run(&device(), &config(params())).unwrap();
        let b = run(&device(), &config(params())).unwrap();
        assert_eq!(a.sink.render(), b.sink.render());
        let mut other = config(params());
        other.rng_seed = 7;
        let c = run(&device(), &other).unwrap();
        assert_ne!(a.sink.render(), c.sink.render());
    }

    #[test]
    fn threaded_device_matches_serial_device() {
        let devices = Device::all();
        let a = run(&devices[0], &config(params())).unwrap();
        let b = run(&devices[1], &config(params())).unwrap();
        assert_eq!(a.sink.render(), b.sink.render());
    }

    #[test]
    fn narrow_agents_run_and_stay_deterministic() {
        let mut c = config(params());
        c.agent_size = 32;
        let a = run(&device(), &c).unwrap();
        let mut c2 = config(params());
        c2.agent_size = 32;
        let b = run(&device(), &c2).unwrap();
        assert_eq!(a.sink.render(), b.sink.render());
        assert_eq!(a.sink.records()[0].sheep, 20);
    }

    #[test]
    fn both_sorters_produce_identical_tables() {
        let a = run(&device(), &config(params())).unwrap();
        let mut c = config(params());
        c.sort = sort_by_tag("oiabitonic").unwrap();
        let b = run(&device(), &c).unwrap();
        assert_eq!(a.sink.render(), b.sink.render());
    }

    #[test]
    fn empty_world_keeps_populations_at_zero() {
        let mut p = params();
        p.init_sheep = 0;
        p.init_wolves = 0;
        p.iters = 5;
        let out = run(&device(), &config(p)).unwrap();
        for pair in out.sink.records().windows(2) {
            assert!(pair[1].grass >= pair[0].grass);
        }
        for row in out.sink.records() {
            assert_eq!((row.sheep, row.wolves), (0, 0));
        }
    }

    #[test]
    fn wolves_without_food_die_out() {
        let mut p = params();
        p.init_sheep = 0;
        p.init_wolves = 10;
        p.wolves_gain_from_food = 4;
        p.iters = 15;
        let out = run(&device(), &config(p)).unwrap();
        let rows = out.sink.records();
        for row in rows {
            assert_eq!(row.sheep, 0);
        }
        for pair in rows[1..].windows(2) {
            assert!(pair[1].wolves <= pair[0].wolves);
        }
        assert_eq!(rows[15].wolves, 0);
    }

    #[test]
    fn capacity_pressure_fails_with_out_of_resources() {
        let mut p = params();
        p.init_sheep = 30;
        p.init_wolves = 2;
        let mut c = config(p);
        // Room for the initial population but not for an action dispatch
        // and its possible newborns.
        c.max_agents = 40;
        c.lws.deflt = 16;
        assert!(matches!(
            run(&device(), &c),
            Err(Error::OutOfResources(_))
        ));
    }

    #[test]
    fn grid_too_large_for_narrow_layout_is_invalid() {
        let mut p = params();
        p.grid_x = 2048;
        p.grid_y = 4;
        let mut c = config(p);
        c.agent_size = 32;
        assert!(matches!(run(&device(), &c), Err(Error::InvalidArgs(_))));
    }

    #[test]
    fn dump_files_record_every_tick() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("dump").to_str().unwrap().to_string();
        let mut p = params();
        p.iters = 2;
        let mut c = config(p);
        c.dump = Some(prefix.clone());
        run(&device(), &c).unwrap();
        let agents = std::fs::read_to_string(format!("{}_agents.txt", prefix)).unwrap();
        let cells = std::fs::read_to_string(format!("{}_cells.txt", prefix)).unwrap();
        // Initial state plus one entry per advancing tick.
        assert_eq!(agents.matches("Iteration").count(), 3);
        assert_eq!(cells.matches("Iteration").count(), 3);
        assert!(agents.contains("type="));
        assert!(cells.contains("[Grass:"));
    }

    #[test]
    fn profiler_sees_the_whole_pipeline() {
        let mut p = params();
        p.iters = 3;
        let out = run(&device(), &config(p)).unwrap();
        let report = out.profiler.analyze().unwrap();
        let names = report
            .aggregates
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>();
        for expected in [
            "K: init_cell",
            "K: init_agent",
            "K: grass",
            "K: reduce_grass1",
            "K: reduce_grass2",
            "K: reduce_agent1",
            "K: reduce_agent2",
            "K: move_agent",
            "K: sbitonic_step",
            "K: find_cell_idx",
            "K: action_agent",
            "Read: stats",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }
}
