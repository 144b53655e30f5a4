//! Worksize plan for the row-striped CPU simulator.
//!
//! The CPU simulator parallelises over grid rows. Neighbourhood access has
//! radius 1, so two work-items may only run concurrently when their rows
//! are separated by at least two unprocessed rows; the scheduler therefore
//! requires a minimum stripe of [`D_MIN`] rows per work-item.

use crate::error::Error;
use crate::error::Result;

/// Minimum row separation between concurrently processed rows.
pub const D_MIN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuPlan {
    /// Maximum number of work-items the grid height admits.
    pub max_gws: usize,
    /// Effective global worksize.
    pub gws: usize,
    /// Local worksize; zero lets the scheduler decide.
    pub lws: usize,
    /// Rows in each work-item's stripe (the last stripe absorbs the
    /// remainder).
    pub rows_per_workitem: usize,
    /// Maximum number of agents the arena holds.
    pub max_agents: u32,
}

impl CpuPlan {
    /// Derive the plan from the grid height and the user's worksize hints
    /// (zero meaning unconstrained).
    pub fn compute(
        gws_req: usize,
        lws_req: usize,
        max_agents: u32,
        grid_y: u32,
    ) -> Result<CpuPlan> {
        let num_rows = grid_y as usize;
        let max_gws = num_rows / D_MIN;
        if max_gws == 0 {
            return Err(Error::InvalidArgs(format!(
                "grid height {} is too small, at least {} rows are required",
                num_rows, D_MIN
            )));
        }

        let lws = lws_req;
        let gws = if gws_req > 0 {
            if lws > 0 && gws_req % lws != 0 {
                return Err(Error::InvalidArgs(format!(
                    "global work size ({}) is not multiple of local work size ({})",
                    gws_req, lws
                )));
            }
            gws_req
        } else if lws > 0 {
            // Largest multiple of the local work size not above the
            // maximum.
            if max_gws % lws == 0 {
                max_gws
            } else {
                let mut gws = lws;
                while gws + lws <= max_gws {
                    gws += lws;
                }
                gws
            }
        } else {
            max_gws
        };

        if gws > max_gws {
            return Err(Error::InvalidArgs(format!(
                "global work size ({}) is too large for model parameters, maximum size is {}",
                gws, max_gws
            )));
        }

        // Initial estimate of rows per work-item; incremented only when
        // the rows do not divide evenly and the last work-item still has
        // at least D_MIN rows to process after the increment.
        let mut rows_per_workitem = num_rows / gws;
        if num_rows % gws > 0 && (gws - 1) * (rows_per_workitem + 1) <= num_rows - D_MIN {
            rows_per_workitem += 1;
        }

        Ok(CpuPlan {
            max_gws,
            gws,
            lws,
            rows_per_workitem,
            max_agents,
        })
    }

    /// The half-open row stripe owned by one work-item. The last
    /// work-item's stripe extends to the bottom of the grid.
    pub fn stripe(&self, item: usize, grid_y: u32) -> (usize, usize) {
        let start = item * self.rows_per_workitem;
        let stop = if item + 1 == self.gws {
            grid_y as usize
        } else {
            ((item + 1) * self.rows_per_workitem).min(grid_y as usize)
        };
        (start, stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_respects_d_min_and_covers_grid() {
        for grid_y in 3..200u32 {
            let plan = CpuPlan::compute(0, 0, 1024, grid_y).unwrap();
            assert!(plan.gws <= grid_y as usize / D_MIN);
            assert!(plan.gws >= 1);
            assert!(plan.rows_per_workitem >= D_MIN);
            // Stripes partition all rows and the last stripe never
            // starves below the separation minimum.
            let mut covered = 0;
            for item in 0..plan.gws {
                let (start, stop) = plan.stripe(item, grid_y);
                assert_eq!(start, covered);
                assert!(stop > start);
                covered = stop;
            }
            assert_eq!(covered, grid_y as usize);
            let (start, stop) = plan.stripe(plan.gws - 1, grid_y);
            assert!(stop - start >= D_MIN);
        }
    }

    #[test]
    fn minimum_grid_gives_single_worker() {
        let plan = CpuPlan::compute(0, 0, 16, 3).unwrap();
        assert_eq!(plan.max_gws, 1);
        assert_eq!(plan.gws, 1);
        assert_eq!(plan.rows_per_workitem, 3);
    }

    #[test]
    fn grid_below_minimum_is_invalid() {
        assert!(matches!(
            CpuPlan::compute(0, 0, 16, 2),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn twelve_rows_scenario() {
        // grid_y = 12 gives max_gws = 4; gws = 5 must fail; gws = 4 with
        // lws = 2 must succeed with 3 rows per work-item.
        assert!(matches!(
            CpuPlan::compute(5, 0, 16, 12),
            Err(Error::InvalidArgs(_))
        ));
        let plan = CpuPlan::compute(4, 2, 16, 12).unwrap();
        assert_eq!(plan.max_gws, 4);
        assert_eq!(plan.gws, 4);
        assert_eq!(plan.rows_per_workitem, 3);
    }

    #[test]
    fn incompatible_lws_is_invalid() {
        assert!(matches!(
            CpuPlan::compute(4, 3, 16, 12),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn lws_only_request_picks_largest_fitting_multiple() {
        // grid_y = 31 -> max_gws = 10; lws = 4 -> gws = 8.
        let plan = CpuPlan::compute(0, 4, 16, 31).unwrap();
        assert_eq!(plan.gws, 8);
        assert_eq!(plan.gws % plan.lws, 0);
        // lws larger than max_gws cannot be satisfied.
        assert!(matches!(
            CpuPlan::compute(0, 16, 16, 31),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn remainder_rows_go_to_last_worker_when_increment_would_starve_it() {
        // 13 rows over 4 workers: incrementing to 4 rows each would leave
        // the last worker a single row, so the stripe stays at 3 and the
        // last worker takes the 4-row remainder.
        let plan = CpuPlan::compute(4, 0, 16, 13).unwrap();
        assert_eq!(plan.rows_per_workitem, 3);
        assert_eq!(plan.stripe(3, 13), (9, 13));
    }

    #[test]
    fn increment_applies_at_the_exact_separation_boundary() {
        // 15 rows over 4 workers: incrementing to 4 rows leaves the last
        // worker exactly the 3-row minimum, so the increment happens and
        // the stripes cover the whole grid.
        let plan = CpuPlan::compute(4, 0, 16, 15).unwrap();
        assert_eq!(plan.rows_per_workitem, 4);
        assert!(plan.gws * plan.rows_per_workitem >= 15);
        for item in 0..3 {
            assert_eq!(plan.stripe(item, 15), (item * 4, item * 4 + 4));
        }
        assert_eq!(plan.stripe(3, 15), (12, 15));
    }
}
