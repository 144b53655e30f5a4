//! Stage-optimised bitonic sort.
//!
//! High steps of each stage run as single global passes, exactly as the
//! simple variant; once the compare distance fits inside one work-group's
//! block, the remaining steps of the stage fuse into a single dispatch,
//! cutting the pass count roughly in half for large networks.

use super::AgentSorter;
use super::exchange;
use super::network_size;
use crate::device::buffer::Buffer;
use crate::device::event::Event;
use crate::device::program::Kernel;
use crate::device::program::Program;
use crate::device::queue::Queue;
use crate::error::Error;
use crate::error::Result;
use crate::kernels::gpu::AgentWord;
use crate::profile::Profiler;
use std::sync::Arc;

struct AnyKernel<W> {
    agents: Buffer<W>,
}

impl<W: AgentWord> Kernel for AnyKernel<W> {
    fn name(&self) -> &'static str {
        "oia_any"
    }

    /// Scalars: `[stage, step]`.
    fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let (stage, step) = two_scalars(scalars, self.name())?;
        let mut agents = self.agents.map_mut()?;
        check_bounds(gws, agents.len(), self.name())?;
        for gid in 0..gws {
            exchange(&mut agents, gid, stage, step);
        }
        Ok(())
    }
}

struct LocalKernel<W> {
    agents: Buffer<W>,
}

impl<W: AgentWord> Kernel for LocalKernel<W> {
    fn name(&self) -> &'static str {
        "oia_local"
    }

    /// Scalars: `[stage, start_step]`; performs steps
    /// `start_step, start_step - 1, .., 1`, all inside work-group blocks.
    fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let (stage, start_step) = two_scalars(scalars, self.name())?;
        let mut agents = self.agents.map_mut()?;
        check_bounds(gws, agents.len(), self.name())?;
        for step in (1..=start_step).rev() {
            for gid in 0..gws {
                exchange(&mut agents, gid, stage, step);
            }
        }
        Ok(())
    }
}

fn two_scalars(scalars: &[u64], kernel: &str) -> Result<(u32, u32)> {
    match scalars {
        [a, b, ..] => Ok((*a as u32, *b as u32)),
        _ => Err(Error::Library(format!(
            "{}: missing stage/step arguments",
            kernel
        ))),
    }
}

fn check_bounds(gws: usize, capacity: usize, kernel: &str) -> Result<()> {
    if gws * 2 > capacity {
        return Err(Error::Library(format!(
            "{}: network of {} over {} agent slots",
            kernel,
            gws * 2,
            capacity
        )));
    }
    Ok(())
}

pub struct OiaBitonic {
    any: Arc<dyn Kernel>,
    local: Arc<dyn Kernel>,
    capacity: usize,
    /// Cap on how many trailing steps fuse into one dispatch.
    max_fused: u32,
}

impl OiaBitonic {
    pub fn new<W: AgentWord>(
        _program: &Program,
        agents: &Buffer<W>,
        options: Option<&str>,
    ) -> Result<Self> {
        let mut max_fused = u32::MAX;
        if let Some(options) = options {
            for opt in options.split(',').filter(|o| !o.trim().is_empty()) {
                match opt.trim().split_once('=') {
                    Some(("steps", value)) => {
                        max_fused = value.parse::<u32>().ok().filter(|v| *v >= 1).ok_or_else(
                            || {
                                Error::InvalidArgs(format!(
                                    "oiabitonic: steps option must be a positive integer, \
                                     got '{}'",
                                    value
                                ))
                            },
                        )?;
                    }
                    _ => {
                        return Err(Error::InvalidArgs(format!(
                            "oiabitonic: unknown option '{}'",
                            opt.trim()
                        )));
                    }
                }
            }
        }
        Ok(Self {
            any: Arc::new(AnyKernel {
                agents: agents.clone(),
            }),
            local: Arc::new(LocalKernel {
                agents: agents.clone(),
            }),
            capacity: agents.len(),
            max_fused,
        })
    }
}

impl AgentSorter for OiaBitonic {
    fn kernel_names(&self) -> Vec<&'static str> {
        vec!["oia_any", "oia_local"]
    }

    fn sort(
        &mut self,
        queue: &Queue,
        n: u32,
        lws: usize,
        profiler: &mut Profiler,
    ) -> Result<Event> {
        let size = network_size(n, self.capacity)?;
        let gws = size / 2;
        let mut lws = lws.max(1);
        while gws % lws != 0 {
            lws /= 2;
        }
        // Steps whose compare distance stays inside a block of 2*lws
        // elements can fuse.
        let fusable = ((2 * lws).trailing_zeros()).min(self.max_fused).max(1);
        let total_stages = size.trailing_zeros();
        let mut last = None;
        for stage in 1..=total_stages {
            let mut step = stage;
            while step > fusable {
                let evt = queue.enqueue_kernel(
                    &self.any,
                    gws,
                    lws,
                    &[stage as u64, step as u64],
                    &[],
                )?;
                profiler.track(&evt);
                last = Some(evt);
                step -= 1;
            }
            let evt = queue.enqueue_kernel(
                &self.local,
                gws,
                lws,
                &[stage as u64, step as u64],
                &[],
            )?;
            profiler.track(&evt);
            last = Some(evt);
        }
        last.ok_or_else(|| Error::Library("oiabitonic: empty sort network".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::buffer::BufferRegistry;
    use crate::kernels::KernelConstants;
    use crate::sort::tests::check_names;
    use crate::sort::tests::check_sorts;

    #[test]
    fn sorts_and_preserves_records() {
        check_sorts(|program, agents| {
            Box::new(OiaBitonic::new(program, agents, None).unwrap())
        });
    }

    #[test]
    fn sorts_with_capped_fusing() {
        check_sorts(|program, agents| {
            Box::new(OiaBitonic::new(program, agents, Some("steps=1")).unwrap())
        });
    }

    #[test]
    fn rejects_unknown_options() {
        let mut registry = BufferRegistry::new();
        let agents: Buffer<u64> = registry.create("agents", 8);
        let program = Program::build_for_tests(KernelConstants::default());
        assert!(OiaBitonic::new(&program, &agents, Some("bubble=3")).is_err());
        assert!(OiaBitonic::new(&program, &agents, Some("steps=0")).is_err());
        let sorter = OiaBitonic::new(&program, &agents, Some("steps=2")).unwrap();
        check_names(&sorter);
    }
}
