//! Worksize plan for the pipelined GPU simulator.
//!
//! Ten kernels are sized here. Statically-sized kernels get their
//! global/local pair up front; agent-dependent kernels (move, sort, find
//! cell index, actions, agent reduction) get a local size now and a global
//! size every tick, from the current live-agent bound.

use super::WorkSize;
use super::next_multiple;
use crate::device::Device;
use crate::error::Error;
use crate::error::Result;
use crate::params::Parameters;

/// Per-kernel local worksize requests; zero picks the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct LwsRequest {
    pub deflt: usize,
    pub init_cell: usize,
    pub init_agent: usize,
    pub grass: usize,
    pub reduce_grass: usize,
    pub reduce_agent: usize,
    pub move_agent: usize,
    pub sort_agent: usize,
    pub find_cell_idx: usize,
    pub action_agent: usize,
}

/// Per-kernel vector width requests; zero auto-detects from the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct VwRequest {
    pub grass: u32,
    pub reduce_grass: u32,
    pub reduce_agent: u32,
}

/// Worksizes for the agent reduction pair of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceAgentSizes {
    pub gws1: usize,
    pub num_workgroups: usize,
    /// Local and global size of the second pass (a single work-group).
    pub ws2: usize,
}

#[derive(Debug, Clone)]
pub struct GpuPlan {
    pub max_lws: usize,
    pub deflt: usize,
    pub vw_grass: u32,
    pub vw_reduce_grass: u32,
    pub vw_reduce_agent: u32,
    pub init_cell: WorkSize,
    pub init_agent: WorkSize,
    pub grass: WorkSize,
    pub reduce_grass1: WorkSize,
    pub reduce_grass2: WorkSize,
    pub lws_reduce_agent1: usize,
    pub lws_move_agent: usize,
    pub lws_sort_agent: usize,
    pub lws_find_cell_idx: usize,
    pub lws_action_agent: usize,
    pub max_agents: u32,
}

fn validate_vw(name: &str, vw: u32) -> Result<()> {
    if vw == 0 || (vw.is_power_of_two() && vw <= 16) {
        Ok(())
    } else {
        Err(Error::InvalidArgs(format!(
            "the {} vector width must be 0 (auto-detect), 1, 2, 4, 8 or 16",
            name
        )))
    }
}

/// Local size for a reduction kernel: the request (or default), forced up
/// to a power of two and clamped to the device maximum.
fn reduce_lws(name: &str, request: usize, deflt: usize, max_lws: usize) -> usize {
    let lws = if request > 0 { request } else { deflt };
    if lws.is_power_of_two() {
        lws
    } else {
        let rounded = lws.next_power_of_two().min(max_lws);
        log::warn!(
            "the workgroup size of the {} reduction kernel must be a power of 2, assuming {}",
            name,
            rounded
        );
        rounded
    }
}

/// First-pass reduction global size over `n` elements at vector width
/// `vw`: enough work-items to cover the input, but never more work-groups
/// than the second pass's single work-group can finalise.
fn reduce1_gws(n: usize, vw: u32, lws: usize) -> usize {
    (lws * lws).min(next_multiple(n.div_ceil(vw as usize), lws))
}

impl GpuPlan {
    pub fn compute(
        device: &Device,
        params: &Parameters,
        lws_req: &LwsRequest,
        vw_req: &VwRequest,
        max_agents: u32,
        agent_bits: u32,
    ) -> Result<GpuPlan> {
        if agent_bits != 32 && agent_bits != 64 {
            return Err(Error::InvalidArgs(
                "the agent size must be either 32 or 64".into(),
            ));
        }
        validate_vw("grass", vw_req.grass)?;
        validate_vw("grass-reduction", vw_req.reduce_grass)?;
        validate_vw("agent-reduction", vw_req.reduce_agent)?;
        if params.init_sheep + params.init_wolves > max_agents {
            return Err(Error::OutOfResources(
                "not enough space for the initial agents".into(),
            ));
        }

        let max_lws = device.max_work_group_size;
        let deflt = if lws_req.deflt > 0 {
            if lws_req.deflt > max_lws {
                log::warn!(
                    "the specified default workgroup size, {}, is higher than the device maximum, \
                     {}; using the device maximum",
                    lws_req.deflt,
                    max_lws
                );
                max_lws
            } else {
                lws_req.deflt
            }
        } else {
            max_lws
        };

        let pick = |request: usize| if request > 0 { request } else { deflt };

        let vw_grass = if vw_req.grass > 0 {
            vw_req.grass
        } else {
            device.preferred_vw_int
        };
        let vw_reduce_grass = if vw_req.reduce_grass > 0 {
            vw_req.reduce_grass
        } else {
            device.preferred_vw_int
        };
        let vw_reduce_agent = if vw_req.reduce_agent > 0 {
            vw_req.reduce_agent
        } else if agent_bits == 64 {
            device.preferred_vw_long
        } else {
            device.preferred_vw_int
        };

        let grid_xy = params.grid_xy() as usize;

        let lws_init_cell = pick(lws_req.init_cell);
        let lws_init_agent = pick(lws_req.init_agent);
        let lws_grass = pick(lws_req.grass);
        let lws_reduce_grass1 = reduce_lws("grass", lws_req.reduce_grass, deflt, max_lws);
        let lws_reduce_agent1 = reduce_lws("agent", lws_req.reduce_agent, deflt, max_lws);

        let gws_reduce_grass1 = reduce1_gws(grid_xy, vw_reduce_grass, lws_reduce_grass1);
        // A single work-group sized to finalise whatever the first pass
        // produced; power of two so the in-group reduction tree works.
        let ws_reduce_grass2 = (gws_reduce_grass1 / lws_reduce_grass1).next_power_of_two();

        Ok(GpuPlan {
            max_lws,
            deflt,
            vw_grass,
            vw_reduce_grass,
            vw_reduce_agent,
            init_cell: WorkSize {
                gws: next_multiple(grid_xy, lws_init_cell),
                lws: lws_init_cell,
            },
            init_agent: WorkSize {
                gws: next_multiple(max_agents as usize, lws_init_agent),
                lws: lws_init_agent,
            },
            grass: WorkSize {
                gws: next_multiple(grid_xy.div_ceil(vw_grass as usize), lws_grass),
                lws: lws_grass,
            },
            reduce_grass1: WorkSize {
                gws: gws_reduce_grass1,
                lws: lws_reduce_grass1,
            },
            reduce_grass2: WorkSize {
                gws: ws_reduce_grass2,
                lws: ws_reduce_grass2,
            },
            lws_reduce_agent1,
            lws_move_agent: pick(lws_req.move_agent),
            lws_sort_agent: pick(lws_req.sort_agent),
            lws_find_cell_idx: pick(lws_req.find_cell_idx),
            lws_action_agent: pick(lws_req.action_agent),
            max_agents,
        })
    }

    /// Work-groups the first grass reduction pass runs with (a kernel
    /// compile constant).
    pub fn reduce_grass_num_workgroups(&self) -> usize {
        self.reduce_grass1.gws / self.reduce_grass1.lws
    }

    /// Sizes for the agent reduction pair, recomputed every tick from the
    /// live-agent bound.
    pub fn reduce_agent_sizes(&self, max_agents_iter: u32) -> ReduceAgentSizes {
        let gws1 = reduce1_gws(
            max_agents_iter as usize,
            self.vw_reduce_agent,
            self.lws_reduce_agent1,
        );
        let num_workgroups = gws1 / self.lws_reduce_agent1;
        ReduceAgentSizes {
            gws1,
            num_workgroups,
            ws2: num_workgroups.next_power_of_two(),
        }
    }

    /// Global size of an agent-dependent kernel for the given agent bound.
    pub fn agent_gws(lws: usize, max_agents_iter: u32) -> usize {
        next_multiple(max_agents_iter as usize, lws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Parameters {
        Parameters {
            init_sheep: 40,
            sheep_gain_from_food: 4,
            sheep_reproduce_threshold: 2,
            sheep_reproduce_prob: 4,
            init_wolves: 20,
            wolves_gain_from_food: 20,
            wolves_reproduce_threshold: 2,
            wolves_reproduce_prob: 5,
            grass_restart: 10,
            grid_x: 100,
            grid_y: 100,
            iters: 10,
        }
    }

    fn device() -> Device {
        Device::all().remove(0)
    }

    #[test]
    fn reduction_pair_invariants() {
        // For any element count, requested local size and vector width the
        // second pass is a single power-of-two work-group able to finalise
        // every work-group of the first pass.
        for n in [1usize, 2, 63, 64, 100, 4096, 10_000, 1 << 20] {
            for lws in [1usize, 2, 4, 16, 64, 256] {
                for vw in [1u32, 2, 4, 8, 16] {
                    let gws1 = reduce1_gws(n, vw, lws);
                    assert_eq!(gws1 % lws, 0);
                    assert!(gws1 * vw as usize >= n.min(lws * lws));
                    let ws2 = (gws1 / lws).next_power_of_two();
                    assert!(ws2.is_power_of_two());
                    assert!(gws1 / lws <= ws2);
                }
            }
        }
    }

    #[test]
    fn plan_covers_static_kernels() {
        let plan = GpuPlan::compute(
            &device(),
            &params(),
            &LwsRequest::default(),
            &VwRequest::default(),
            1024,
            64,
        )
        .unwrap();
        assert!(plan.init_cell.gws >= 10_000);
        assert_eq!(plan.init_cell.gws % plan.init_cell.lws, 0);
        assert_eq!(plan.init_agent.gws % plan.init_agent.lws, 0);
        assert!(plan.grass.gws * plan.vw_grass as usize >= 10_000);
        assert_eq!(plan.reduce_grass2.gws, plan.reduce_grass2.lws);
        assert!(plan.reduce_grass2.lws.is_power_of_two());
        assert!(plan.reduce_grass_num_workgroups() <= plan.reduce_grass2.lws);
    }

    #[test]
    fn non_power_of_two_reduction_lws_is_rounded_up() {
        let lws = LwsRequest {
            reduce_grass: 48,
            ..Default::default()
        };
        let plan = GpuPlan::compute(
            &device(),
            &params(),
            &lws,
            &VwRequest::default(),
            1024,
            64,
        )
        .unwrap();
        assert_eq!(plan.reduce_grass1.lws, 64);
    }

    #[test]
    fn oversized_default_lws_is_clamped() {
        let lws = LwsRequest {
            deflt: 4096,
            ..Default::default()
        };
        let plan = GpuPlan::compute(
            &device(),
            &params(),
            &lws,
            &VwRequest::default(),
            1024,
            64,
        )
        .unwrap();
        assert_eq!(plan.deflt, device().max_work_group_size);
    }

    #[test]
    fn invalid_vector_width_is_rejected() {
        let vw = VwRequest {
            grass: 3,
            ..Default::default()
        };
        assert!(matches!(
            GpuPlan::compute(&device(), &params(), &LwsRequest::default(), &vw, 1024, 64),
            Err(Error::InvalidArgs(_))
        ));
        let vw = VwRequest {
            reduce_agent: 32,
            ..Default::default()
        };
        assert!(matches!(
            GpuPlan::compute(&device(), &params(), &LwsRequest::default(), &vw, 1024, 64),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn invalid_agent_size_is_rejected() {
        assert!(matches!(
            GpuPlan::compute(
                &device(),
                &params(),
                &LwsRequest::default(),
                &VwRequest::default(),
                1024,
                48,
            ),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn initial_population_above_capacity_is_out_of_resources() {
        let mut p = params();
        p.init_sheep = 6;
        p.init_wolves = 5;
        assert!(matches!(
            GpuPlan::compute(
                &device(),
                &p,
                &LwsRequest::default(),
                &VwRequest::default(),
                10,
                64,
            ),
            Err(Error::OutOfResources(_))
        ));
    }

    #[test]
    fn agent_sizes_track_population() {
        let plan = GpuPlan::compute(
            &device(),
            &params(),
            &LwsRequest {
                deflt: 64,
                ..Default::default()
            },
            &VwRequest::default(),
            1 << 20,
            64,
        )
        .unwrap();
        for n in [2u32, 60, 64, 1000, 1 << 20] {
            let sizes = plan.reduce_agent_sizes(n);
            assert_eq!(sizes.ws2, sizes.num_workgroups.next_power_of_two());
            assert!(sizes.gws1 % plan.lws_reduce_agent1 == 0);
            let gws = GpuPlan::agent_gws(plan.lws_move_agent, n);
            assert!(gws >= n as usize);
            assert_eq!(gws % plan.lws_move_agent, 0);
        }
    }
}
