use std::collections::BTreeSet;

use thiserror::Error;

use crate::Mm;

/// Region labels modulated by default. These are the walls, where stair-stepping shows.
pub const DEFAULT_REGION_TYPES: &[&str] = &["External perimeter", "Perimeter", "Overhang perimeter"];

/// Added on top of the defaults when infill modulation is requested.
pub const INFILL_REGION_TYPES: &[&str] = &["Top solid infill", "Solid infill", "Internal infill"];

pub const DEFAULT_MAX_DZ_FRACTION: Mm = 0.5;

// A typical 0.4mm nozzle. The step is normally the detected nozzle diameter, since there's no
// visible benefit to sampling the surface much finer than the extrusion width.
pub const DEFAULT_STEP: Mm = 0.4;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max dz fraction must be within [0, 1], got {0}")]
    FractionOutOfRange(Mm),

    #[error("resampling step must be a positive length, got {0}")]
    InvalidStep(Mm),

    #[error("fallback layer height must be a positive length, got {0}")]
    InvalidLayerHeight(Mm),

    #[error("no region types are eligible, nothing would be modulated")]
    NoEligibleRegions,
}

/// Which moves get modulated, and by how much. Fully resolved before a run starts and never
/// changed during it.
#[derive(Debug, Clone, PartialEq)]
pub struct InclusionPolicy {
    /// Verbatim `;TYPE:` labels.
    pub eligible_regions: BTreeSet<String>,
    pub modulate_first_layer: bool,
    /// Max |dz| as a fraction of the layer height.
    pub max_dz_fraction: Mm,
    /// Target sub-segment length when splitting a move.
    pub step: Mm,
    /// Layer thickness used for the clamp when a layer has no `;HEIGHT:` marker.
    pub fallback_layer_height: Option<Mm>,
    /// Put the nozzle back at the nominal layer Z before the next unmodulated move.
    pub restore_z: bool,
}

impl Default for InclusionPolicy {
    fn default() -> Self {
        InclusionPolicy {
            eligible_regions: DEFAULT_REGION_TYPES.iter().map(|s| s.to_string()).collect(),
            modulate_first_layer: false,
            max_dz_fraction: DEFAULT_MAX_DZ_FRACTION,
            step: DEFAULT_STEP,
            fallback_layer_height: None,
            restore_z: true,
        }
    }
}

impl InclusionPolicy {
    pub fn with_infill(mut self) -> Self {
        self.eligible_regions.extend(INFILL_REGION_TYPES.iter().map(|s| s.to_string()));
        self
    }

    pub fn is_eligible(&self, region: &str) -> bool {
        self.eligible_regions.contains(region)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.max_dz_fraction) {
            // also catches NaN
            return Err(ConfigError::FractionOutOfRange(self.max_dz_fraction));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(ConfigError::InvalidStep(self.step));
        }
        if let Some(h) = self.fallback_layer_height {
            if !(h.is_finite() && h > 0.0) {
                return Err(ConfigError::InvalidLayerHeight(h));
            }
        }
        if self.eligible_regions.is_empty() {
            return Err(ConfigError::NoEligibleRegions);
        }
        Ok(())
    }
}
