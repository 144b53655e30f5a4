//! Agent compaction.
//!
//! A sort sub-driver reorders the packed agent array so dead-sentinel
//! records collect at the high end and live agents group by cell key.
//! Sub-drivers are pluggable behind [`AgentSorter`]; the available
//! algorithms are registered in [`SORT_INFOS`], keyed by tag.

pub mod oiabitonic;
pub mod sbitonic;

use crate::device::buffer::Buffer;
use crate::device::event::Event;
use crate::device::program::Program;
use crate::device::queue::Queue;
use crate::error::Error;
use crate::error::Result;
use crate::kernels::gpu::AgentWord;
use crate::profile::Profiler;

/// One pluggable sorting algorithm driving device kernels over a command
/// queue. Kernel creation happens at construction, argument binding is
/// baked into the kernels, teardown happens on drop.
pub trait AgentSorter: Send {
    /// Kernel names this sorter dispatches, for the information table.
    fn kernel_names(&self) -> Vec<&'static str>;

    /// Enqueue every pass needed to sort `n` agents and return the event
    /// of the final pass. Tracked events land in the profiler.
    fn sort(
        &mut self,
        queue: &Queue,
        n: u32,
        lws: usize,
        profiler: &mut Profiler,
    ) -> Result<Event>;
}

/// Information about one agent sorting algorithm.
pub struct SortInfo {
    pub tag: &'static str,
    pub compiler_const: &'static str,
}

/// Available sorting algorithms, keyed by tag.
pub static SORT_INFOS: &[SortInfo] = &[
    SortInfo {
        tag: "sbitonic",
        compiler_const: "PPG_SORT_SBITONIC",
    },
    SortInfo {
        tag: "oiabitonic",
        compiler_const: "PPG_SORT_OIABITONIC",
    },
];

pub fn sort_by_tag(tag: &str) -> Result<&'static SortInfo> {
    SORT_INFOS
        .iter()
        .find(|info| info.tag == tag)
        .ok_or_else(|| Error::InvalidArgs(format!("unknown sorting algorithm '{}'", tag)))
}

/// Build the sorter selected by tag, with its algorithm options.
pub fn create_sorter<W: AgentWord>(
    tag: &str,
    options: Option<&str>,
    program: &Program,
    agents: &Buffer<W>,
) -> Result<Box<dyn AgentSorter>> {
    match sort_by_tag(tag)?.tag {
        "sbitonic" => {
            if options.is_some_and(|o| !o.trim().is_empty()) {
                return Err(Error::InvalidArgs(
                    "the sbitonic sorter takes no options".into(),
                ));
            }
            Ok(Box::new(sbitonic::SBitonic::new(program, agents)))
        }
        _ => Ok(Box::new(oiabitonic::OiaBitonic::new(
            program, agents, options,
        )?)),
    }
}

/// The bitonic network size for `n` elements, and the arena capacity
/// check: every padding slot up to the network size must physically exist
/// (and hold the sentinel) for the merge directions to work out.
pub(crate) fn network_size(n: u32, capacity: usize) -> Result<usize> {
    let size = (n.max(2) as usize).next_power_of_two();
    if size > capacity {
        return Err(Error::OutOfResources(format!(
            "sorting {} agents needs a network of {}, above the agent buffer capacity {}",
            n, size, capacity
        )));
    }
    Ok(size)
}

/// One global compare-exchange of the bitonic network.
pub(crate) fn exchange<W: AgentWord>(agents: &mut [W], gid: usize, stage: u32, step: u32) {
    let dist = 1usize << (step - 1);
    let base = (gid / dist) * dist * 2 + (gid % dist);
    let partner = base + dist;
    let ascending = base & (1usize << stage) == 0;
    if (agents[base] > agents[partner]) == ascending {
        agents.swap(base, partner);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::buffer::BufferRegistry;
    use crate::device::program::Kernel;
    use crate::kernels::KernelConstants;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    /// Run a sorter's kernel passes synchronously and check the sorting
    /// contract: keys non-decreasing, no record lost or duplicated.
    pub(crate) fn check_sorts<F>(build: F)
    where
        F: Fn(&Program, &Buffer<u64>) -> Box<dyn AgentSorter>,
    {
        for n in [2u32, 3, 7, 16, 33, 100, 255] {
            let mut registry = BufferRegistry::new();
            let agents: Buffer<u64> = registry.create("agents", 256);
            let mut reference = {
                let mut map = agents.map_mut().unwrap();
                let mut rng = SmallRng::seed_from_u64(n as u64);
                for slot in map.iter_mut() {
                    *slot = u64::MAX;
                }
                for i in 0..n as usize {
                    map[i] = rng.random::<u32>() as u64 | ((i as u64 % 7) << 32);
                }
                map[..n as usize].to_vec()
            };
            let program = Program::build_for_tests(KernelConstants::default());
            let mut sorter = build(&program, &agents);
            let queue = Queue::new("q-sort-test");
            let mut profiler = Profiler::new(true);
            let evt = sorter.sort(&queue, n, 16, &mut profiler).unwrap();
            evt.wait().unwrap();
            queue.finish().unwrap();

            let map = agents.map().unwrap();
            let sorted = &map[..n as usize];
            assert!(
                sorted.windows(2).all(|w| w[0] <= w[1]),
                "keys non-decreasing for n={}",
                n
            );
            reference.sort();
            assert_eq!(sorted, &reference[..], "no loss or duplication for n={}", n);
            assert!(map[n as usize..].iter().all(|w| *w == u64::MAX));
            assert!(!profiler.analyze().unwrap().aggregates.is_empty());
        }
    }

    /// A sorter must run its passes through kernels it names.
    pub(crate) fn check_names(sorter: &dyn AgentSorter) {
        assert!(!sorter.kernel_names().is_empty());
    }

    #[test]
    fn registry_knows_both_algorithms() {
        assert!(sort_by_tag("sbitonic").is_ok());
        assert!(sort_by_tag("oiabitonic").is_ok());
        assert!(matches!(
            sort_by_tag("quick"),
            Err(Error::InvalidArgs(_))
        ));
    }

    #[test]
    fn network_size_is_power_of_two_within_capacity() {
        assert_eq!(network_size(2, 256).unwrap(), 2);
        assert_eq!(network_size(3, 256).unwrap(), 4);
        assert_eq!(network_size(100, 256).unwrap(), 128);
        assert!(matches!(
            network_size(200, 200),
            Err(Error::OutOfResources(_))
        ));
    }

    #[test]
    fn sbitonic_rejects_options() {
        let mut registry = BufferRegistry::new();
        let agents: Buffer<u64> = registry.create("agents", 16);
        let program = Program::build_for_tests(KernelConstants::default());
        assert!(create_sorter("sbitonic", Some("steps=2"), &program, &agents).is_err());
        assert!(create_sorter("sbitonic", None, &program, &agents).is_ok());
    }

    /// The registry builds working sorters for both tags.
    #[test]
    fn created_sorters_sort() {
        for info in SORT_INFOS {
            check_sorts(|program, agents| {
                create_sorter(info.tag, None, program, agents).unwrap()
            });
        }
    }

    // Kernel trait object sanity for the shared exchange step.
    struct OneStep {
        agents: Buffer<u64>,
    }

    impl Kernel for OneStep {
        fn name(&self) -> &'static str {
            "one_step"
        }

        fn run(&self, gws: usize, _lws: usize, scalars: &[u64]) -> Result<()> {
            let mut agents = self.agents.map_mut()?;
            for gid in 0..gws {
                exchange(&mut agents, gid, scalars[0] as u32, scalars[1] as u32);
            }
            Ok(())
        }
    }

    #[test]
    fn exchange_step_swaps_into_direction() {
        let mut registry = BufferRegistry::new();
        let agents: Buffer<u64> = registry.create("agents", 4);
        {
            let mut map = agents.map_mut().unwrap();
            map.copy_from_slice(&[3, 1, 0, 2]);
        }
        let kernel = OneStep {
            agents: agents.clone(),
        };
        // Stage 1, step 1 over 4 elements: pairs (0,1) ascending, (2,3)
        // descending.
        kernel.run(2, 1, &[1, 1]).unwrap();
        assert_eq!(&*agents.map().unwrap(), &[1, 3, 2, 0]);
    }
}
