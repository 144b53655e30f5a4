//! Simple bitonic sort: one kernel, one dispatch per network step.

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

struct StepKernel<W> {
    agents: Buffer<W>,
}

impl<W: AgentWord> Kernel for StepKernel<W> {
    fn name(&self) -> &'static str {
        "sbitonic_step"
    }

    /// Scalars: `[stage, step]`.
    fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
        let (stage, step) = match scalars {
            [stage, step, ..] => (*stage as u32, *step as u32),
            _ => {
                return Err(Error::Library(
                    "sbitonic_step: missing stage/step arguments".into(),
                ));
            }
        };
        let mut agents = self.agents.map_mut()?;
        if gws * 2 > agents.len() {
            return Err(Error::Library(format!(
                "sbitonic_step: network of {} over {} agent slots",
                gws * 2,
                agents.len()
            )));
        }
        for gid in 0..gws {
            exchange(&mut agents, gid, stage, step);
        }
        Ok(())
    }
}

pub struct SBitonic {
    kernel: Arc<dyn Kernel>,
    capacity: usize,
}

impl SBitonic {
    pub fn new<W: AgentWord>(_program: &Program, agents: &Buffer<W>) -> Self {
        Self {
            kernel: Arc::new(StepKernel {
                agents: agents.clone(),
            }),
            capacity: agents.len(),
        }
    }
}

impl AgentSorter for SBitonic {
    fn kernel_names(&self) -> Vec<&'static str> {
        vec!["sbitonic_step"]
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
        // Shrink the local size until it divides the pass size.
        let mut lws = lws.max(1);
        while gws % lws != 0 {
            lws /= 2;
        }
        let total_stages = size.trailing_zeros();
        let mut last = None;
        for stage in 1..=total_stages {
            for step in (1..=stage).rev() {
                let evt = queue.enqueue_kernel(
                    &self.kernel,
                    gws,
                    lws,
                    &[stage as u64, step as u64],
                    &[],
                )?;
                profiler.track(&evt);
                last = Some(evt);
            }
        }
        last.ok_or_else(|| Error::Library("sbitonic: empty sort network".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::tests::check_names;
    use crate::sort::tests::check_sorts;

    #[test]
    fn sorts_and_preserves_records() {
        check_sorts(|program, agents| Box::new(SBitonic::new(program, agents)));
    }

    #[test]
    fn names_its_kernel() {
        let mut registry = crate::device::buffer::BufferRegistry::new();
        let agents: Buffer<u64> = registry.create("agents", 8);
        let program = Program::build_for_tests(crate::kernels::KernelConstants::default());
        check_names(&SBitonic::new(&program, &agents));
    }
}
