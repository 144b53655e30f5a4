//! Device program for the row-striped CPU simulator.
//!
//! Two kernels advance the simulation: `step1` moves agents and grows
//! grass, `step2` performs agent actions and gathers statistics. Both are
//! dispatched once per turn; a work-item only touches rows of the current
//! turn inside its own stripe, which together with the 3-row stripe
//! minimum keeps radius-1 neighbourhood writes conflict-free.
//!
//! Agents live in an arena of stable indices. Each cell heads a singly
//! linked chain through the `next` field, terminated by the
//! [`NULL_AGENT`](crate::NULL_AGENT) sentinel; a dead agent has zero
//! energy and is unlinked when a walk runs into it.

use crate::NULL_AGENT;
use crate::SHEEP_ID;
use crate::device::buffer::Buffer;
use crate::device::program::Kernel;
use crate::device::program::Program;
use crate::error::Error;
use crate::error::Result;
use crate::kernels::KernelConstants;
use crate::stats::StatsRecord;
use std::sync::Arc;

/// One grid cell: grass regrowth countdown (zero means grown) and the
/// head of the agent chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cell {
    pub grass: u32,
    pub head: u32,
}

/// One agent arena slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Agent {
    pub energy: u32,
    pub action: u32,
    pub kind: u32,
    pub next: u32,
}

/// Device buffers of the CPU simulator, in allocation order.
pub struct CpuBuffers {
    pub stats: Buffer<StatsRecord>,
    pub cells: Buffer<Cell>,
    pub agents: Buffer<Agent>,
    pub seeds: Buffer<u64>,
}

pub struct CpuKernels {
    pub step1: Arc<dyn Kernel>,
    pub step2: Arc<dyn Kernel>,
}

/// Build the two simulation kernels against the program's constant set.
pub fn create(program: &Program, buffers: &CpuBuffers) -> CpuKernels {
    let common = Common {
        constants: *program.constants(),
        cells: buffers.cells.clone(),
        agents: buffers.agents.clone(),
        seeds: buffers.seeds.clone(),
    };
    CpuKernels {
        step1: Arc::new(Step1 {
            common: common.clone(),
        }),
        step2: Arc::new(Step2 {
            common,
            stats: buffers.stats.clone(),
        }),
    }
}

#[derive(Clone)]
struct Common {
    constants: KernelConstants,
    cells: Buffer<Cell>,
    agents: Buffer<Agent>,
    seeds: Buffer<u64>,
}

impl Common {
    /// Rows a work-item covers on the given turn: `start + turn` and then
    /// every `rows_per_workitem` rows while still inside the stripe. The
    /// last work-item's stripe extends to the grid bottom, so it may
    /// cover several rows per turn.
    fn rows(&self, item: usize, gws: usize, turn: u32) -> impl Iterator<Item = usize> {
        let rpw = self.constants.rows_per_workitem as usize;
        let grid_y = self.constants.grid_y as usize;
        let start = item * rpw;
        let stop = if item + 1 == gws {
            grid_y
        } else {
            ((item + 1) * rpw).min(grid_y)
        };
        (start + turn as usize..stop).step_by(rpw.max(1))
    }

    fn scalar(scalars: &[u64], idx: usize, kernel: &str) -> Result<u32> {
        scalars
            .get(idx)
            .map(|v| *v as u32)
            .ok_or_else(|| Error::Library(format!("{}: missing scalar argument {}", kernel, idx)))
    }
}

/// Unlink `idx` from its cell chain, given its predecessor (or the
/// sentinel when `idx` heads the chain).
fn unlink(cells: &mut [Cell], agents: &mut [Agent], cell: usize, prev: u32, idx: u32) {
    if prev == NULL_AGENT {
        cells[cell].head = agents[idx as usize].next;
    } else {
        agents[prev as usize].next = agents[idx as usize].next;
    }
}

struct Step1 {
    common: Common,
}

impl Kernel for Step1 {
    fn name(&self) -> &'static str {
        "step1"
    }

    /// Scalars: `[turn]`.
    fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let turn = Common::scalar(scalars, 0, self.name())?;
        let k = &self.common.constants;
        let mut cells = self.common.cells.map_mut()?;
        let mut agents = self.common.agents.map_mut()?;
        let mut seeds = self.common.seeds.map_mut()?;
        if seeds.len() < gws {
            return Err(Error::Library(format!(
                "step1: {} seed slots for {} work-items",
                seeds.len(),
                gws
            )));
        }
        for item in 0..gws {
            for row in self.common.rows(item, gws, turn) {
                for x in 0..k.grid_x as usize {
                    let cell = row * k.grid_x as usize + x;
                    move_and_grow(k, &mut cells, &mut agents, &mut seeds[item], cell);
                }
            }
        }
        Ok(())
    }
}

fn move_and_grow(
    k: &KernelConstants,
    cells: &mut [Cell],
    agents: &mut [Agent],
    seed: &mut u64,
    cell: usize,
) {
    // Grass regrowth countdown.
    if cells[cell].grass > 0 {
        cells[cell].grass -= 1;
    }

    let x = (cell % k.grid_x as usize) as u32;
    let y = (cell / k.grid_x as usize) as u32;
    let mut prev = NULL_AGENT;
    let mut idx = cells[cell].head;
    while idx != NULL_AGENT {
        let agent = agents[idx as usize];
        let next = agent.next;
        if agent.energy == 0 {
            // Stale corpse from a previous tick's predation.
            unlink(cells, agents, cell, prev, idx);
        } else if agent.action == 0 {
            agents[idx as usize].action = 1;
            agents[idx as usize].energy -= 1;
            if agents[idx as usize].energy == 0 {
                unlink(cells, agents, cell, prev, idx);
            } else {
                // Random walk: stay or step to a von Neumann neighbour on
                // the torus.
                let destination = match k.rng.range(seed, 5) {
                    1 => (x + 1) % k.grid_x + y * k.grid_x,
                    2 => (x + k.grid_x - 1) % k.grid_x + y * k.grid_x,
                    3 => x + (y + 1) % k.grid_y * k.grid_x,
                    4 => x + (y + k.grid_y - 1) % k.grid_y * k.grid_x,
                    _ => cell as u32,
                } as usize;
                if destination == cell {
                    prev = idx;
                } else {
                    unlink(cells, agents, cell, prev, idx);
                    agents[idx as usize].next = cells[destination].head;
                    cells[destination].head = idx;
                }
            }
        } else {
            // Already moved into this neighbourhood earlier in the tick.
            prev = idx;
        }
        idx = next;
    }
}

struct Step2 {
    common: Common,
    stats: Buffer<StatsRecord>,
}

impl Kernel for Step2 {
    fn name(&self) -> &'static str {
        "step2"
    }

    /// Scalars: `[iter, turn]`.
    fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let iter = Common::scalar(scalars, 0, self.name())?;
        let turn = Common::scalar(scalars, 1, self.name())?;
        let k = &self.common.constants;
        let mut cells = self.common.cells.map_mut()?;
        let mut agents = self.common.agents.map_mut()?;
        let mut seeds = self.common.seeds.map_mut()?;
        let mut stats = self.stats.map_mut()?;
        if iter as usize >= stats.len() || seeds.len() < gws {
            return Err(Error::Library(format!(
                "step2: iteration {} or work size {} out of range",
                iter, gws
            )));
        }
        let tally = &mut stats[iter as usize];
        for item in 0..gws {
            for row in self.common.rows(item, gws, turn) {
                for x in 0..k.grid_x as usize {
                    let cell = row * k.grid_x as usize + x;
                    act_and_count(k, &mut cells, &mut agents, &mut seeds[item], cell, tally);
                }
            }
        }
        Ok(())
    }
}

fn act_and_count(
    k: &KernelConstants,
    cells: &mut [Cell],
    agents: &mut [Agent],
    seed: &mut u64,
    cell: usize,
    tally: &mut StatsRecord,
) {
    let mut prev = NULL_AGENT;
    let mut idx = cells[cell].head;
    while idx != NULL_AGENT {
        let next = agents[idx as usize].next;
        if agents[idx as usize].energy == 0 {
            unlink(cells, agents, cell, prev, idx);
        } else {
            if agents[idx as usize].action == 1 {
                agents[idx as usize].action = 0;
                act(k, cells, agents, seed, cell, idx);
            }
            prev = idx;
        }
        idx = next;
    }

    // The cell's contribution to this tick's statistics, with every
    // action in the cell applied.
    if cells[cell].grass == 0 {
        tally.grass += 1;
    }
    tally.grass_timer += cells[cell].grass as u64;
    let mut idx = cells[cell].head;
    while idx != NULL_AGENT {
        let agent = agents[idx as usize];
        if agent.energy > 0 {
            if agent.kind == SHEEP_ID {
                tally.sheep += 1;
                tally.sheep_energy += agent.energy as u64;
            } else {
                tally.wolves += 1;
                tally.wolves_energy += agent.energy as u64;
            }
        }
        idx = agent.next;
    }
}

fn act(
    k: &KernelConstants,
    cells: &mut [Cell],
    agents: &mut [Agent],
    seed: &mut u64,
    cell: usize,
    idx: u32,
) {
    let kind = agents[idx as usize].kind;
    let (gain, threshold, prob) = if kind == SHEEP_ID {
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

    if kind == SHEEP_ID {
        if cells[cell].grass == 0 {
            agents[idx as usize].energy += gain;
            cells[cell].grass = k.grass_restart;
        }
    } else if let Some((sheep_prev, sheep)) = find_live_sheep(cells, agents, cell) {
        agents[sheep as usize].energy = 0;
        unlink(cells, agents, cell, sheep_prev, sheep);
        agents[idx as usize].energy += gain;
    }

    if agents[idx as usize].energy > threshold && k.rng.range(seed, 100) < prob {
        let child_energy = agents[idx as usize].energy / 2;
        if child_energy > 0 {
            if let Some(slot) = allocate(k, agents, seed) {
                agents[idx as usize].energy -= child_energy;
                agents[slot as usize] = Agent {
                    energy: child_energy,
                    action: 0,
                    kind,
                    next: cells[cell].head,
                };
                cells[cell].head = slot;
            }
        }
    }
}

fn find_live_sheep(cells: &[Cell], agents: &[Agent], cell: usize) -> Option<(u32, u32)> {
    let mut prev = NULL_AGENT;
    let mut idx = cells[cell].head;
    while idx != NULL_AGENT {
        let agent = agents[idx as usize];
        if agent.kind == SHEEP_ID && agent.energy > 0 {
            return Some((prev, idx));
        }
        prev = idx;
        idx = agent.next;
    }
    None
}

/// Claim a free arena slot for a newborn: probe from a random position
/// for up to `MAX_AGENT_SHUF` slots, then fall back to a linear scan.
/// Returns nothing when the arena is full (the birth silently fails).
fn allocate(k: &KernelConstants, agents: &[Agent], seed: &mut u64) -> Option<u32> {
    let max = k.max_agents as usize;
    let start = k.rng.range(seed, k.max_agents) as usize;
    for probe in 0..(k.max_agent_shuf as usize).min(max) {
        let slot = (start + probe) % max;
        if agents[slot].energy == 0 {
            return Some(slot as u32);
        }
    }
    (0..max).find(|s| agents[*s].energy == 0).map(|s| s as u32)
}
