use crate::error::Error;
use crate::error::Result;
use std::io::Write;

/// Statistics of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsRecord {
    /// Live sheep.
    pub sheep: u32,
    /// Live wolves.
    pub wolves: u32,
    /// Cells with grown grass.
    pub grass: u32,
    /// Total energy over live sheep.
    pub sheep_energy: u64,
    /// Total energy over live wolves.
    pub wolves_energy: u64,
    /// Total grass regrowth countdown over all cells.
    pub grass_timer: u64,
}

/// Owns the per-tick statistics of a run and writes the result table:
/// one row per tick, `sheep wolves grass mean_sheep_energy
/// mean_wolf_energy mean_grass_timer`, tab-separated.
pub struct StatsSink {
    records: Vec<StatsRecord>,
    grid_xy: u32,
}

impl StatsSink {
    pub fn new(iters: u32, grid_xy: u32) -> Self {
        Self {
            records: vec![StatsRecord::default(); iters as usize + 1],
            grid_xy,
        }
    }

    pub fn set(&mut self, tick: usize, record: StatsRecord) {
        self.records[tick] = record;
    }

    pub fn get(&self, tick: usize) -> StatsRecord {
        self.records[tick]
    }

    pub fn records(&self) -> &[StatsRecord] {
        &self.records
    }

    fn render_row(&self, r: &StatsRecord) -> String {
        let mean = |total: u64, count: u32| {
            if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            }
        };
        format!(
            "{}\t{}\t{}\t{:.6}\t{:.6}\t{:.6}\n",
            r.sheep,
            r.wolves,
            r.grass,
            mean(r.sheep_energy, r.sheep),
            mean(r.wolves_energy, r.wolves),
            r.grass_timer as f64 / self.grid_xy as f64,
        )
    }

    pub fn render(&self) -> String {
        self.records.iter().map(|r| self.render_row(r)).collect()
    }

    /// Write the table to `path`.
    pub fn save(&self, path: &str) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .map_err(|e| Error::StatsSave(format!("unable to open file \"{}\": {}", path, e)))?;
        file.write_all(self.render().as_bytes())
            .map_err(|e| Error::StatsSave(format!("writing \"{}\": {}", path, e)))?;
        Ok(())
    }
}
