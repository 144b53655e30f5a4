//! The emulated data-parallel compute platform.
//!
//! The simulators drive their work through the same control surface the
//! production device would expose: enumerate devices, pick one, build a
//! program with a compiler-option string, dispatch kernels onto in-order
//! command queues, synchronise with events, move data through registered
//! buffers. Two in-process devices exist: a serial reference device and a
//! threaded device that fans order-independent kernels over a thread pool.

pub mod buffer;
pub mod event;
pub mod program;
pub mod queue;

use crate::error::Error;
use crate::error::Result;
use program::Program;
use queue::Queue;
use std::io::IsTerminal;

#[derive(Debug, Clone)]
pub struct Device {
    pub index: usize,
    pub name: &'static str,
    pub compute_units: u32,
    pub max_work_group_size: usize,
    pub preferred_vw_int: u32,
    pub preferred_vw_long: u32,
    /// Whether kernels may execute order-independent work concurrently.
    pub threaded: bool,
}

impl Device {
    /// Enumerate the available devices.
    pub fn all() -> Vec<Device> {
        vec![
            Device {
                index: 0,
                name: "serial reference device",
                compute_units: 1,
                max_work_group_size: 256,
                preferred_vw_int: 4,
                preferred_vw_long: 2,
                threaded: false,
            },
            Device {
                index: 1,
                name: "threaded device",
                compute_units: num_cpus::get() as u32,
                max_work_group_size: 256,
                preferred_vw_int: 4,
                preferred_vw_long: 2,
                threaded: true,
            },
        ]
    }

    /// Select a device by explicit index, or interactively when none is
    /// given and more than one is available. Non-interactive runs fall
    /// back to the first device.
    pub fn select(requested: Option<usize>) -> Result<Device> {
        let devices = Self::all();
        match requested {
            Some(idx) => devices.get(idx).cloned().ok_or_else(|| {
                Error::InvalidArgs(format!(
                    "device index {} out of range (found {} devices)",
                    idx,
                    devices.len()
                ))
            }),
            None if devices.len() == 1 => Ok(devices[0].clone()),
            None if std::io::stdin().is_terminal() => {
                let items = devices
                    .iter()
                    .map(|d| format!("{} ({} compute units)", d.name, d.compute_units))
                    .collect::<Vec<_>>();
                let choice = dialoguer::Select::new()
                    .with_prompt("Select device")
                    .items(&items)
                    .default(0)
                    .interact()
                    .map_err(|e| Error::Library(format!("device menu: {}", e)))?;
                Ok(devices[choice].clone())
            }
            None => {
                log::info!("no device given, using device 0 ({})", devices[0].name);
                Ok(devices[0].clone())
            }
        }
    }

    /// One-line-per-device listing for `--list-devices`.
    pub fn listing() -> String {
        Self::all()
            .iter()
            .map(|d| {
                format!(
                    "{}. {} | compute units: {} | max workgroup: {}\n",
                    d.index, d.name, d.compute_units, d.max_work_group_size
                )
            })
            .collect()
    }

    /// Build the device program with the given compiler options.
    pub fn build_program(&self, options: &str) -> Result<Program> {
        Program::build(options, self.threaded)
    }

    /// Create an in-order command queue on this device.
    pub fn queue(&self, label: &str) -> Queue {
        Queue::new(label)
    }
}
