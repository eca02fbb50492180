use crate::error::CellError;
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};

/// Static configuration for one simulation process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CellAppConfig {
    /// Ticks per second; converts tick budgets into wall-clock intent.
    pub update_hertz: u32,
    /// Processes whose cell lies within this distance of a real entity hold a ghost of it.
    pub ghost_distance: f32,
    /// Extra distance beyond `ghost_distance` before an existing ghost is deleted.
    pub ghost_hysteresis: f32,
    /// A ghost is never deleted for distance reasons before it is this old.
    pub min_ghost_lifespan_ticks: u64,
    /// Smoothed cell load above which the cell reports that it should shed entities.
    pub offload_high_water: f32,
    /// Exponential smoothing factor applied to per-entity and per-cell load.
    pub load_smoothing: f32,
    /// Ticks a source waits for the destination to acknowledge an onload.
    pub offload_ack_timeout_ticks: u64,
    /// Consecutive failed hand-offs to one destination before the longer backoff applies.
    pub offload_max_attempts: u32,
    /// Ticks to wait before retrying a failed hand-off.
    pub offload_retry_backoff_ticks: u64,
    /// Every real entity is backed up to its peer once per this many ticks.
    pub backup_period_ticks: u64,
    /// Every persisted real entity is archived once per this many ticks.
    pub archive_period_ticks: u64,
    /// Ticks between flips of the secondary store's double-buffered tables.
    pub secondary_flip_period_ticks: u64,
    /// How long a dead peer stays recognised after its death was reported.
    pub dead_peer_grace_ticks: u64,
    /// Maximum number of dead-peer restores or discards performed per tick.
    pub max_repairs_per_tick: usize,
    /// Ceiling on simultaneously outstanding database writes during controlled shutdown.
    pub max_outstanding_shutdown_writes: usize,
    /// Vision is re-evaluated once per this many ticks.
    pub vision_update_period_ticks: u64,
    /// Cell size of the grid used for coarse vision range queries.
    pub vision_grid_cell_size: f32,
    /// Number of history events retained per real entity.
    pub history_capacity: usize,
    /// Ticks a condemned entity channel lingers to absorb late acknowledgements.
    pub condemned_channel_ticks: u64,
    /// Optional RNG seed for reproducible archive ordering.
    pub rng_seed: Option<u64>,
}

impl Default for CellAppConfig {
    fn default() -> Self {
        Self {
            update_hertz: 10,
            ghost_distance: 50.0,
            ghost_hysteresis: 10.0,
            min_ghost_lifespan_ticks: 20,
            offload_high_water: 0.8,
            load_smoothing: 0.1,
            offload_ack_timeout_ticks: 30,
            offload_max_attempts: 3,
            offload_retry_backoff_ticks: 10,
            backup_period_ticks: 10,
            archive_period_ticks: 600,
            secondary_flip_period_ticks: 3000,
            dead_peer_grace_ticks: 100,
            max_repairs_per_tick: 32,
            max_outstanding_shutdown_writes: 5,
            vision_update_period_ticks: 1,
            vision_grid_cell_size: 25.0,
            history_capacity: 256,
            condemned_channel_ticks: 50,
            rng_seed: None,
        }
    }
}

impl CellAppConfig {
    /// Parse a JSON document; missing knobs keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, CellError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|_| CellError::InvalidConfig("config is not valid JSON for CellAppConfig"))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every knob, reporting the first one that cannot be used.
    pub fn validate(&self) -> Result<(), CellError> {
        if self.update_hertz == 0 {
            return Err(CellError::InvalidConfig("update_hertz must be positive"));
        }
        if !(self.ghost_distance.is_finite() && self.ghost_distance >= 0.0) {
            return Err(CellError::InvalidConfig(
                "ghost_distance must be finite and non-negative",
            ));
        }
        if !(self.ghost_hysteresis.is_finite() && self.ghost_hysteresis >= 0.0) {
            return Err(CellError::InvalidConfig(
                "ghost_hysteresis must be finite and non-negative",
            ));
        }
        if !(self.load_smoothing > 0.0 && self.load_smoothing <= 1.0) {
            return Err(CellError::InvalidConfig("load_smoothing must be in (0, 1]"));
        }
        if !self.offload_high_water.is_finite() || self.offload_high_water <= 0.0 {
            return Err(CellError::InvalidConfig("offload_high_water must be positive"));
        }
        if self.offload_ack_timeout_ticks == 0 {
            return Err(CellError::InvalidConfig(
                "offload_ack_timeout_ticks must be positive",
            ));
        }
        if self.offload_max_attempts == 0 {
            return Err(CellError::InvalidConfig("offload_max_attempts must be positive"));
        }
        if self.backup_period_ticks == 0 {
            return Err(CellError::InvalidConfig("backup_period_ticks must be positive"));
        }
        if self.archive_period_ticks == 0 {
            return Err(CellError::InvalidConfig("archive_period_ticks must be positive"));
        }
        if self.secondary_flip_period_ticks == 0 {
            return Err(CellError::InvalidConfig(
                "secondary_flip_period_ticks must be positive",
            ));
        }
        if self.max_repairs_per_tick == 0 {
            return Err(CellError::InvalidConfig("max_repairs_per_tick must be positive"));
        }
        if self.max_outstanding_shutdown_writes == 0 {
            return Err(CellError::InvalidConfig(
                "max_outstanding_shutdown_writes must be positive",
            ));
        }
        if self.vision_update_period_ticks == 0 {
            return Err(CellError::InvalidConfig(
                "vision_update_period_ticks must be positive",
            ));
        }
        if !(self.vision_grid_cell_size.is_finite() && self.vision_grid_cell_size > 0.0) {
            return Err(CellError::InvalidConfig(
                "vision_grid_cell_size must be positive",
            ));
        }
        if self.history_capacity == 0 {
            return Err(CellError::InvalidConfig("history_capacity must be positive"));
        }
        Ok(())
    }

    /// Ticks corresponding to the given number of seconds at `update_hertz`.
    #[must_use]
    pub fn ticks_for_secs(&self, secs: f32) -> u64 {
        (secs * self.update_hertz as f32).ceil().max(0.0) as u64
    }

    pub(crate) fn seeded_rng(&self, salt: u64) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed ^ salt),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CellAppConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn grace_period_is_about_ten_seconds() {
        let config = CellAppConfig::default();
        assert_eq!(config.dead_peer_grace_ticks, config.ticks_for_secs(10.0));
    }

    #[test]
    fn rejects_zero_shutdown_ceiling() {
        let config = CellAppConfig {
            max_outstanding_shutdown_writes: 0,
            ..CellAppConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(CellError::InvalidConfig(
                "max_outstanding_shutdown_writes must be positive"
            ))
        );
    }

    #[test]
    fn json_overrides_selected_knobs() {
        let config =
            CellAppConfig::from_json_str(r#"{ "ghost_distance": 80.0, "rng_seed": 7 }"#)
                .expect("parse");
        assert_eq!(config.ghost_distance, 80.0);
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.backup_period_ticks, 10);
    }

    #[test]
    fn json_with_bad_knob_is_rejected() {
        let result = CellAppConfig::from_json_str(r#"{ "load_smoothing": 0.0 }"#);
        assert_eq!(
            result,
            Err(CellError::InvalidConfig("load_smoothing must be in (0, 1]"))
        );
    }
}
