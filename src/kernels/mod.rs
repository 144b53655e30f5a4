//! Device programs and the constant set they are compiled against.
//!
//! The simulators parameterise their kernels through the program
//! compile-option string: the binder renders every simulation constant as
//! a `-D KEY=VALUE` definition, and the program build parses the string
//! back into a [`KernelConstants`] record the kernels read as literals.

pub mod cpu;
pub mod gpu;

use crate::error::Error;
use crate::error::Result;

/// Device-side random number generator variants. Each work-item owns one
/// u64 seed slot which the generator advances in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RngKind {
    #[default]
    Xorshift,
    Lcg,
}

impl RngKind {
    pub fn next(self, seed: &mut u64) -> u32 {
        match self {
            RngKind::Xorshift => {
                if *seed == 0 {
                    *seed = 0x9e37_79b9_7f4a_7c15;
                }
                let mut x = *seed;
                x ^= x >> 12;
                x ^= x << 25;
                x ^= x >> 27;
                *seed = x;
                (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32
            }
            RngKind::Lcg => {
                *seed = seed
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                (*seed >> 32) as u32
            }
        }
    }

    /// Uniform-ish draw in [0, n). Kernels tolerate the modulo bias.
    pub fn range(self, seed: &mut u64, n: u32) -> u32 {
        if n == 0 { 0 } else { self.next(seed) % n }
    }
}

/// Information about one random number generation algorithm.
pub struct RngInfo {
    pub tag: &'static str,
    pub compiler_const: &'static str,
    pub kind: RngKind,
}

/// Available device RNG algorithms, keyed by tag.
pub static RNG_INFOS: &[RngInfo] = &[
    RngInfo {
        tag: "xorshift",
        compiler_const: "PP_RNG_XORSHIFT",
        kind: RngKind::Xorshift,
    },
    RngInfo {
        tag: "lcg",
        compiler_const: "PP_RNG_LCG",
        kind: RngKind::Lcg,
    },
];

pub fn rng_by_tag(tag: &str) -> Result<&'static RngInfo> {
    RNG_INFOS
        .iter()
        .find(|info| info.tag == tag)
        .ok_or_else(|| Error::InvalidArgs(format!("unknown random number generator '{}'", tag)))
}

/// The constant set a program is compiled with. Unset constants are zero;
/// the kernels that read them are never built without them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConstants {
    pub max_agents: u32,
    pub max_agent_shuf: u32,
    pub rows_per_workitem: u32,
    pub vw_grass: u32,
    pub vw_grassreduce: u32,
    pub vw_agentreduce: u32,
    pub reduce_grass_num_workgroups: u32,
    pub max_lws: u32,
    pub cell_num: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub iters: u32,
    pub init_sheep: u32,
    pub sheep_gain_from_food: u32,
    pub sheep_reproduce_threshold: u32,
    pub sheep_reproduce_prob: u32,
    pub init_wolves: u32,
    pub wolves_gain_from_food: u32,
    pub wolves_reproduce_threshold: u32,
    pub wolves_reproduce_prob: u32,
    pub grass_restart: u32,
    /// Packed agent width in bits, 64 or 32 (wide simulator only).
    pub agent_bits: u32,
    pub rng: RngKind,
}

impl Default for KernelConstants {
    fn default() -> Self {
        Self {
            max_agents: 0,
            max_agent_shuf: 0,
            rows_per_workitem: 0,
            vw_grass: 0,
            vw_grassreduce: 0,
            vw_agentreduce: 0,
            reduce_grass_num_workgroups: 0,
            max_lws: 0,
            cell_num: 0,
            grid_x: 0,
            grid_y: 0,
            iters: 0,
            init_sheep: 0,
            sheep_gain_from_food: 0,
            sheep_reproduce_threshold: 0,
            sheep_reproduce_prob: 0,
            init_wolves: 0,
            wolves_gain_from_food: 0,
            wolves_reproduce_threshold: 0,
            wolves_reproduce_prob: 0,
            grass_restart: 0,
            agent_bits: 64,
            rng: RngKind::default(),
        }
    }
}

impl KernelConstants {
    /// Parse a compiler-option string back into the constant set. Unknown
    /// definitions are passed through untouched (they belong to the device
    /// compiler, not to us); malformed values fail the build.
    pub fn parse(opts: &str) -> Result<Self> {
        let mut constants = Self::default();
        let mut tokens = opts.split_whitespace();
        while let Some(token) = tokens.next() {
            let def = if token == "-D" {
                match tokens.next() {
                    Some(def) => def,
                    None => {
                        return Err(Error::Library(
                            "program build: dangling -D in compiler options".into(),
                        ));
                    }
                }
            } else if let Some(def) = token.strip_prefix("-D") {
                def
            } else {
                continue;
            };
            match def.split_once('=') {
                Some((key, value)) => {
                    let slot = match key {
                        "MAX_AGENTS" => &mut constants.max_agents,
                        "MAX_AGENT_SHUF" => &mut constants.max_agent_shuf,
                        "ROWS_PER_WORKITEM" => &mut constants.rows_per_workitem,
                        "VW_GRASS" => &mut constants.vw_grass,
                        "VW_GRASSREDUCE" => &mut constants.vw_grassreduce,
                        "VW_AGENTREDUCE" => &mut constants.vw_agentreduce,
                        "REDUCE_GRASS_NUM_WORKGROUPS" => {
                            &mut constants.reduce_grass_num_workgroups
                        }
                        "MAX_LWS" => &mut constants.max_lws,
                        "CELL_NUM" => &mut constants.cell_num,
                        "GRID_X" => &mut constants.grid_x,
                        "GRID_Y" => &mut constants.grid_y,
                        "ITERS" => &mut constants.iters,
                        "INIT_SHEEP" => &mut constants.init_sheep,
                        "SHEEP_GAIN_FROM_FOOD" => &mut constants.sheep_gain_from_food,
                        "SHEEP_REPRODUCE_THRESHOLD" => {
                            &mut constants.sheep_reproduce_threshold
                        }
                        "SHEEP_REPRODUCE_PROB" => &mut constants.sheep_reproduce_prob,
                        "INIT_WOLVES" => &mut constants.init_wolves,
                        "WOLVES_GAIN_FROM_FOOD" => &mut constants.wolves_gain_from_food,
                        "WOLVES_REPRODUCE_THRESHOLD" => {
                            &mut constants.wolves_reproduce_threshold
                        }
                        "WOLVES_REPRODUCE_PROB" => &mut constants.wolves_reproduce_prob,
                        "GRASS_RESTART" => &mut constants.grass_restart,
                        _ => continue,
                    };
                    *slot = value.parse::<u32>().map_err(|_| {
                        Error::Library(format!("program build: invalid value '{}'", def))
                    })?;
                }
                None => match def {
                    "PPG_AG_64" => constants.agent_bits = 64,
                    "PPG_AG_32" => constants.agent_bits = 32,
                    flag => {
                        if let Some(info) =
                            RNG_INFOS.iter().find(|info| info.compiler_const == flag)
                        {
                            constants.rng = info.kind;
                        }
                    }
                },
            }
        }
        Ok(constants)
    }
}

/// Append every parameter-derived definition shared by both simulators.
pub(crate) fn push_param_defs(opts: &mut String, params: &crate::params::Parameters) {
    use std::fmt::Write;
    let _ = write!(
        opts,
        "-D INIT_SHEEP={} -D SHEEP_GAIN_FROM_FOOD={} -D SHEEP_REPRODUCE_THRESHOLD={} \
         -D SHEEP_REPRODUCE_PROB={} -D INIT_WOLVES={} -D WOLVES_GAIN_FROM_FOOD={} \
         -D WOLVES_REPRODUCE_THRESHOLD={} -D WOLVES_REPRODUCE_PROB={} -D GRASS_RESTART={} \
         -D GRID_X={} -D GRID_Y={} -D ITERS={} ",
        params.init_sheep,
        params.sheep_gain_from_food,
        params.sheep_reproduce_threshold,
        params.sheep_reproduce_prob,
        params.init_wolves,
        params.wolves_gain_from_food,
        params.wolves_reproduce_threshold,
        params.wolves_reproduce_prob,
        params.grass_restart,
        params.grid_x,
        params.grid_y,
        params.iters,
    );
}
