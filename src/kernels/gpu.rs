//! Device program for the pipelined GPU simulator.
//!
//! Agents are packed machine words whose top bits hold the (x, y) cell
//! key, so an unsigned sort groups agents by cell and collects the
//! all-ones dead sentinel at the high end. Cells are split across two
//! buffers: a grass countdown array and a per-cell `(first, last)` index
//! pair into the post-sort agent array.
//!
//! Kernels whose work-items write disjoint slots (init, grass, move, the
//! reduction passes) fan out over a thread pool on the threaded device;
//! their sums are exact in any order, so statistics stay bit-identical.
//! The order-dependent kernels (find cell index, agent actions) always
//! run in index order.

use crate::SHEEP_ID;
use crate::WOLF_ID;
use crate::device::buffer::Buffer;
use crate::device::program::Kernel;
use crate::device::program::Program;
use crate::error::Error;
use crate::error::Result;
use crate::kernels::KernelConstants;
use crate::stats::StatsRecord;
use rayon::prelude::*;
use std::sync::Arc;

/// A packed agent record. The wide layout is
/// `{x:16 | y:16 | type:16 | energy:16}`, the narrow one
/// `{x:10 | y:10 | type:1 | energy:11}`; both put the cell key in the top
/// bits and reserve the all-ones word as the dead sentinel.
pub trait AgentWord:
    Copy + Default + Ord + Eq + Send + Sync + std::fmt::Debug + 'static
{
    const BITS: u32;
    const SENTINEL: Self;
    /// Largest energy the layout can hold.
    const MAX_ENERGY: u32;

    fn pack(x: u32, y: u32, kind: u32, energy: u32) -> Self;
    fn x(self) -> u32;
    fn y(self) -> u32;
    fn kind(self) -> u32;
    fn energy(self) -> u32;

    fn is_dead(self) -> bool {
        self == Self::SENTINEL
    }

    fn cell(self, grid_x: u32) -> u32 {
        self.x() + self.y() * grid_x
    }

    fn with_energy(self, energy: u32) -> Self {
        Self::pack(self.x(), self.y(), self.kind(), energy.min(Self::MAX_ENERGY))
    }
}

impl AgentWord for u64 {
    const BITS: u32 = 64;
    const SENTINEL: u64 = u64::MAX;
    const MAX_ENERGY: u32 = 0xffff;

    fn pack(x: u32, y: u32, kind: u32, energy: u32) -> u64 {
        ((x as u64) << 48) | ((y as u64) << 32) | ((kind as u64) << 16) | energy as u64
    }

    fn x(self) -> u32 {
        (self >> 48) as u32
    }

    fn y(self) -> u32 {
        ((self >> 32) & 0xffff) as u32
    }

    fn kind(self) -> u32 {
        ((self >> 16) & 0xffff) as u32
    }

    fn energy(self) -> u32 {
        (self & 0xffff) as u32
    }
}

impl AgentWord for u32 {
    const BITS: u32 = 32;
    const SENTINEL: u32 = u32::MAX;
    const MAX_ENERGY: u32 = 0x7ff;

    fn pack(x: u32, y: u32, kind: u32, energy: u32) -> u32 {
        (x << 22) | (y << 12) | ((kind & 0x1) << 11) | (energy & 0x7ff)
    }

    fn x(self) -> u32 {
        self >> 22
    }

    fn y(self) -> u32 {
        (self >> 12) & 0x3ff
    }

    fn kind(self) -> u32 {
        (self >> 11) & 0x1
    }

    fn energy(self) -> u32 {
        self & 0x7ff
    }
}

/// Indices of a cell's agents in the post-sort agent array;
/// `first == MAX_AGENTS` marks a cell with no agents this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellSpan {
    pub first: u32,
    pub last: u32,
}

/// Per-work-group partial of the grass reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrassPartial {
    pub grass: u64,
    pub timer: u64,
}

/// Per-work-group partial of the agent reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentPartial {
    pub sheep: u64,
    pub sheep_energy: u64,
    pub wolves: u64,
    pub wolves_energy: u64,
}

/// Device buffers of the GPU simulator, in allocation order.
pub struct GpuBuffers<W> {
    pub stats: Buffer<StatsRecord>,
    pub cells_grass: Buffer<u32>,
    pub cells_index: Buffer<CellSpan>,
    pub agents: Buffer<W>,
    pub reduce_grass: Buffer<GrassPartial>,
    pub reduce_agent: Buffer<AgentPartial>,
    pub seeds: Buffer<u64>,
}

pub struct GpuKernels {
    pub init_cell: Arc<dyn Kernel>,
    pub init_agent: Arc<dyn Kernel>,
    pub grass: Arc<dyn Kernel>,
    pub reduce_grass1: Arc<dyn Kernel>,
    pub reduce_grass2: Arc<dyn Kernel>,
    pub reduce_agent1: Arc<dyn Kernel>,
    pub reduce_agent2: Arc<dyn Kernel>,
    pub move_agent: Arc<dyn Kernel>,
    pub find_cell_idx: Arc<dyn Kernel>,
    pub action_agent: Arc<dyn Kernel>,
}

/// Build the simulation kernels against the program's constant set.
pub fn create<W: AgentWord>(program: &Program, buffers: &GpuBuffers<W>) -> GpuKernels {
    let k = *program.constants();
    let threaded = program.threaded();
    GpuKernels {
        init_cell: Arc::new(InitCell {
            k,
            threaded,
            cells_grass: buffers.cells_grass.clone(),
            seeds: buffers.seeds.clone(),
        }),
        init_agent: Arc::new(InitAgent {
            k,
            threaded,
            agents: buffers.agents.clone(),
            seeds: buffers.seeds.clone(),
        }),
        grass: Arc::new(Grass {
            k,
            threaded,
            cells_grass: buffers.cells_grass.clone(),
        }),
        reduce_grass1: Arc::new(ReduceGrass1 {
            k,
            threaded,
            cells_grass: buffers.cells_grass.clone(),
            partials: buffers.reduce_grass.clone(),
        }),
        reduce_grass2: Arc::new(ReduceGrass2 {
            k,
            partials: buffers.reduce_grass.clone(),
            stats: buffers.stats.clone(),
        }),
        reduce_agent1: Arc::new(ReduceAgent1 {
            threaded,
            agents: buffers.agents.clone(),
            partials: buffers.reduce_agent.clone(),
        }),
        reduce_agent2: Arc::new(ReduceAgent2 {
            partials: buffers.reduce_agent.clone(),
            stats: buffers.stats.clone(),
        }),
        move_agent: Arc::new(MoveAgent {
            k,
            threaded,
            agents: buffers.agents.clone(),
            seeds: buffers.seeds.clone(),
        }),
        find_cell_idx: Arc::new(FindCellIdx {
            k,
            agents: buffers.agents.clone(),
            cells_index: buffers.cells_index.clone(),
        }),
        action_agent: Arc::new(ActionAgent {
            k,
            agents: buffers.agents.clone(),
            cells_grass: buffers.cells_grass.clone(),
            cells_index: buffers.cells_index.clone(),
            seeds: buffers.seeds.clone(),
        }),
    }
}

struct InitCell {
    k: KernelConstants,
    threaded: bool,
    cells_grass: Buffer<u32>,
    seeds: Buffer<u64>,
}

/// Initial countdown for a non-grown cell: uniform in
/// `[1, GRASS_RESTART)`, the wide simulator's historical range.
fn initial_timer(k: &KernelConstants, seed: &mut u64) -> u32 {
    if k.grass_restart > 1 {
        1 + k.rng.range(seed, k.grass_restart - 1)
    } else {
        1
    }
}

impl Kernel for InitCell {
    fn name(&self) -> &'static str {
        "init_cell"
    }

    fn run(&self, gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let k = self.k;
        let mut grass = self.cells_grass.map_mut()?;
        let mut seeds = self.seeds.map_mut()?;
        let n = (k.cell_num as usize).min(gws);
        let body = |(cell, seed): (&mut u32, &mut u64)| {
            *cell = if k.rng.range(seed, 2) == 0 {
                0
            } else {
                initial_timer(&k, seed)
            };
        };
        if self.threaded {
            grass[..n]
                .par_iter_mut()
                .zip(seeds[..n].par_iter_mut())
                .for_each(body);
        } else {
            grass[..n].iter_mut().zip(seeds[..n].iter_mut()).for_each(body);
        }
        Ok(())
    }
}

struct InitAgent<W> {
    k: KernelConstants,
    threaded: bool,
    agents: Buffer<W>,
    seeds: Buffer<u64>,
}

impl<W: AgentWord> Kernel for InitAgent<W> {
    fn name(&self) -> &'static str {
        "init_agent"
    }

    fn run(&self, gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let k = self.k;
        let mut agents = self.agents.map_mut()?;
        let mut seeds = self.seeds.map_mut()?;
        let n = (k.max_agents as usize).min(gws).min(agents.len());
        let body = |(i, (agent, seed)): (usize, (&mut W, &mut u64))| {
            let total = (k.init_sheep + k.init_wolves) as usize;
            *agent = if i < total {
                let x = k.rng.range(seed, k.grid_x);
                let y = k.rng.range(seed, k.grid_y);
                let (kind, gain) = if i < k.init_sheep as usize {
                    (SHEEP_ID, k.sheep_gain_from_food)
                } else {
                    (WOLF_ID, k.wolves_gain_from_food)
                };
                let energy = 1 + k.rng.range(seed, 2 * gain);
                W::pack(x, y, kind, energy.min(W::MAX_ENERGY))
            } else {
                W::SENTINEL
            };
        };
        if self.threaded {
            agents[..n]
                .par_iter_mut()
                .zip(seeds[..n].par_iter_mut())
                .enumerate()
                .for_each(body);
        } else {
            agents[..n]
                .iter_mut()
                .zip(seeds[..n].iter_mut())
                .enumerate()
                .for_each(body);
        }
        Ok(())
    }
}

struct Grass {
    k: KernelConstants,
    threaded: bool,
    cells_grass: Buffer<u32>,
}

impl Kernel for Grass {
    fn name(&self) -> &'static str {
        "grass"
    }

    fn run(&self, _gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let vw = self.k.vw_grass.max(1) as usize;
        let n = self.k.cell_num as usize;
        let mut grass = self.cells_grass.map_mut()?;
        let body = |lane: &mut [u32]| {
            for cell in lane {
                if *cell > 0 {
                    *cell -= 1;
                }
            }
        };
        if self.threaded {
            grass[..n].par_chunks_mut(vw).for_each(body);
        } else {
            grass[..n].chunks_mut(vw).for_each(body);
        }
        Ok(())
    }
}

struct ReduceGrass1 {
    k: KernelConstants,
    threaded: bool,
    cells_grass: Buffer<u32>,
    partials: Buffer<GrassPartial>,
}

impl Kernel for ReduceGrass1 {
    fn name(&self) -> &'static str {
        "reduce_grass1"
    }

    fn run(&self, gws: usize, lws: usize, _scalars: &[u64]) -> Result<()> {
        let k = self.k;
        let vw = k.vw_grassreduce.max(1) as usize;
        let n = k.cell_num as usize;
        let grass = self.cells_grass.map()?;
        let mut partials = self.partials.map_mut()?;
        let groups = group_count(gws, lws, partials.len(), self.name())?;
        let body = |(group, partial): (usize, &mut GrassPartial)| {
            let mut sum = GrassPartial::default();
            // Each work-item strides the lane space; a group covers its
            // items' lanes. Addition is exact, so order cannot matter.
            for item in (group * lws)..(group + 1) * lws {
                let mut lane = item;
                while lane * vw < n {
                    for cell in &grass[lane * vw..(lane * vw + vw).min(n)] {
                        if *cell == 0 {
                            sum.grass += 1;
                        }
                        sum.timer += *cell as u64;
                    }
                    lane += gws;
                }
            }
            *partial = sum;
        };
        if self.threaded {
            partials[..groups].par_iter_mut().enumerate().for_each(body);
        } else {
            partials[..groups].iter_mut().enumerate().for_each(body);
        }
        Ok(())
    }
}

struct ReduceGrass2 {
    k: KernelConstants,
    partials: Buffer<GrassPartial>,
    stats: Buffer<StatsRecord>,
}

impl Kernel for ReduceGrass2 {
    fn name(&self) -> &'static str {
        "reduce_grass2"
    }

    fn run(&self, _gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let groups = self.k.reduce_grass_num_workgroups as usize;
        let partials = self.partials.map()?;
        if groups > partials.len() {
            return Err(Error::Library(format!(
                "{}: {} work-groups, {} partials",
                self.name(),
                groups,
                partials.len()
            )));
        }
        let mut stats = self.stats.map_mut()?;
        let mut grass = 0u64;
        let mut timer = 0u64;
        for partial in &partials[..groups] {
            grass += partial.grass;
            timer += partial.timer;
        }
        stats[0].grass = grass as u32;
        stats[0].grass_timer = timer;
        Ok(())
    }
}

struct ReduceAgent1<W> {
    threaded: bool,
    agents: Buffer<W>,
    partials: Buffer<AgentPartial>,
}

impl<W: AgentWord> Kernel for ReduceAgent1<W> {
    fn name(&self) -> &'static str {
        "reduce_agent1"
    }

    /// Scalars: `[max_agents_iter]`.
    fn run(&self, gws: usize, lws: usize, scalars: &[u64]) -> Result<()> {
        let n = *scalars.first().ok_or_else(|| {
            Error::Library("reduce_agent1: missing agent count argument".into())
        })? as usize;
        let agents = self.agents.map()?;
        let n = n.min(agents.len());
        let mut partials = self.partials.map_mut()?;
        let groups = group_count(gws, lws, partials.len(), self.name())?;
        let body = |(group, partial): (usize, &mut AgentPartial)| {
            let mut sum = AgentPartial::default();
            for item in (group * lws)..(group + 1) * lws {
                let mut i = item;
                while i < n {
                    let agent = agents[i];
                    if !agent.is_dead() {
                        if agent.kind() == SHEEP_ID {
                            sum.sheep += 1;
                            sum.sheep_energy += agent.energy() as u64;
                        } else {
                            sum.wolves += 1;
                            sum.wolves_energy += agent.energy() as u64;
                        }
                    }
                    i += gws;
                }
            }
            *partial = sum;
        };
        if self.threaded {
            partials[..groups].par_iter_mut().enumerate().for_each(body);
        } else {
            partials[..groups].iter_mut().enumerate().for_each(body);
        }
        Ok(())
    }
}

struct ReduceAgent2 {
    partials: Buffer<AgentPartial>,
    stats: Buffer<StatsRecord>,
}

impl Kernel for ReduceAgent2 {
    fn name(&self) -> &'static str {
        "reduce_agent2"
    }

    /// Scalars: `[num_workgroups]` of the first pass.
    fn run(&self, _gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let groups = *scalars.first().ok_or_else(|| {
            Error::Library("reduce_agent2: missing work-group count argument".into())
        })? as usize;
        let partials = self.partials.map()?;
        if groups > partials.len() {
            return Err(Error::Library(format!(
                "{}: {} work-groups, {} partials",
                self.name(),
                groups,
                partials.len()
            )));
        }
        let mut stats = self.stats.map_mut()?;
        let mut sum = AgentPartial::default();
        for partial in &partials[..groups] {
            sum.sheep += partial.sheep;
            sum.sheep_energy += partial.sheep_energy;
            sum.wolves += partial.wolves;
            sum.wolves_energy += partial.wolves_energy;
        }
        stats[0].sheep = sum.sheep as u32;
        stats[0].wolves = sum.wolves as u32;
        stats[0].sheep_energy = sum.sheep_energy;
        stats[0].wolves_energy = sum.wolves_energy;
        Ok(())
    }
}

struct MoveAgent<W> {
    k: KernelConstants,
    threaded: bool,
    agents: Buffer<W>,
    seeds: Buffer<u64>,
}

impl<W: AgentWord> Kernel for MoveAgent<W> {
    fn name(&self) -> &'static str {
        "move_agent"
    }

    fn run(&self, gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let k = self.k;
        let mut agents = self.agents.map_mut()?;
        let mut seeds = self.seeds.map_mut()?;
        let n = gws.min(agents.len()).min(seeds.len());
        let body = |(agent, seed): (&mut W, &mut u64)| {
            if agent.is_dead() {
                return;
            }
            let (mut x, mut y) = (agent.x(), agent.y());
            match k.rng.range(seed, 5) {
                1 => x = (x + 1) % k.grid_x,
                2 => x = (x + k.grid_x - 1) % k.grid_x,
                3 => y = (y + 1) % k.grid_y,
                4 => y = (y + k.grid_y - 1) % k.grid_y,
                _ => {}
            }
            let energy = agent.energy() - 1;
            *agent = if energy == 0 {
                W::SENTINEL
            } else {
                W::pack(x, y, agent.kind(), energy)
            };
        };
        if self.threaded {
            agents[..n]
                .par_iter_mut()
                .zip(seeds[..n].par_iter_mut())
                .for_each(body);
        } else {
            agents[..n].iter_mut().zip(seeds[..n].iter_mut()).for_each(body);
        }
        Ok(())
    }
}

struct FindCellIdx<W> {
    k: KernelConstants,
    agents: Buffer<W>,
    cells_index: Buffer<CellSpan>,
}

impl<W: AgentWord> Kernel for FindCellIdx<W> {
    fn name(&self) -> &'static str {
        "find_cell_idx"
    }

    /// Scalars: `[max_agents_iter]`. Agents must be sorted by cell key.
    fn run(&self, _gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let n = *scalars.first().ok_or_else(|| {
            Error::Library("find_cell_idx: missing agent count argument".into())
        })? as usize;
        let k = self.k;
        let agents = self.agents.map()?;
        let n = n.min(agents.len());
        let mut index = self.cells_index.map_mut()?;
        for span in index.iter_mut() {
            *span = CellSpan {
                first: k.max_agents,
                last: 0,
            };
        }
        for i in 0..n {
            let agent = agents[i];
            if agent.is_dead() {
                break; // dead records sort to the high end
            }
            let cell = agent.cell(k.grid_x) as usize;
            if cell >= index.len() {
                return Err(Error::Library(format!(
                    "find_cell_idx: agent {} outside the grid",
                    i
                )));
            }
            if i == 0 || agents[i - 1].cell(k.grid_x) != cell as u32 {
                index[cell].first = i as u32;
            }
            if i + 1 == n || agents[i + 1].cell(k.grid_x) != cell as u32 {
                index[cell].last = i as u32;
            }
        }
        Ok(())
    }
}

struct ActionAgent<W> {
    k: KernelConstants,
    agents: Buffer<W>,
    cells_grass: Buffer<u32>,
    cells_index: Buffer<CellSpan>,
    seeds: Buffer<u64>,
}

impl<W: AgentWord> Kernel for ActionAgent<W> {
    fn name(&self) -> &'static str {
        "action_agent"
    }

    /// Work-item `i` acts for agent `i`; a newborn goes to slot
    /// `gws + i`, which the caller guarantees to be inside the arena.
    fn run(&self, gws: usize, _lws: usize, _scalars: &[u64]) -> Result<()> {
        let k = self.k;
        let mut agents = self.agents.map_mut()?;
        let mut grass = self.cells_grass.map_mut()?;
        let index = self.cells_index.map()?;
        let mut seeds = self.seeds.map_mut()?;
        let n = gws.min(agents.len()).min(seeds.len());
        for i in 0..n {
            let agent = agents[i];
            if agent.is_dead() {
                continue;
            }
            let cell = agent.cell(k.grid_x) as usize;
            if cell >= grass.len() || cell >= index.len() {
                return Err(Error::Library(format!(
                    "action_agent: agent {} outside the grid",
                    i
                )));
            }
            let (gain, threshold, prob) = if agent.kind() == SHEEP_ID {
                (
                    k.sheep_gain_from_food,
                    k.sheep_reproduce_threshold,
                    k.sheep_reproduce_prob,
                )
            } else {
                (
                    k.wolves_gain_from_food,
                    k.wolves_reproduce_threshold,
                    k.wolves_reproduce_prob,
                )
            };

            if agent.kind() == SHEEP_ID {
                if grass[cell] == 0 {
                    grass[cell] = k.grass_restart;
                    agents[i] = agent.with_energy(agent.energy() + gain);
                }
            } else {
                let span = index[cell];
                if span.first != k.max_agents {
                    let prey = (span.first as usize..=span.last as usize).find(|j| {
                        *j < agents.len()
                            && !agents[*j].is_dead()
                            && agents[*j].kind() == SHEEP_ID
                    });
                    if let Some(prey) = prey {
                        agents[prey] = W::SENTINEL;
                        agents[i] = agent.with_energy(agent.energy() + gain);
                    }
                }
            }

            let acted = agents[i];
            let seed = &mut seeds[i];
            if acted.energy() > threshold && k.rng.range(seed, 100) < prob {
                let child_energy = acted.energy() / 2;
                let slot = gws + i;
                if child_energy > 0 && slot < agents.len() {
                    agents[i] = acted.with_energy(acted.energy() - child_energy);
                    agents[slot] =
                        W::pack(acted.x(), acted.y(), acted.kind(), child_energy);
                }
            }
        }
        Ok(())
    }
}

fn group_count(gws: usize, lws: usize, partials: usize, kernel: &str) -> Result<usize> {
    if lws == 0 || gws % lws != 0 {
        return Err(Error::Library(format!(
            "{}: global work size {} is not a multiple of local work size {}",
            kernel, gws, lws
        )));
    }
    let groups = gws / lws;
    if groups > partials {
        return Err(Error::Library(format!(
            "{}: {} work-groups, {} partial slots",
            kernel, groups, partials
        )));
    }
    Ok(groups)
}
