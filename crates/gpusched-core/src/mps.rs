//! GPU and MPS unit accounting
//!
//! A whole dedicated GPU is worth [`MPS_UNITS_PER_GPU`] fractional MPS units.
//! Converting units back to GPUs rounds up so a fractional request is never
//! backed by less physical capacity than it asked for.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{SchedError, SchedResult};

/// MPS units that make up one dedicated GPU
pub const MPS_UNITS_PER_GPU: u32 = 10;
/// Default MPS active thread percentage
pub const DEFAULT_MPS_LIMIT: i32 = 100;
/// Upper bound for the MPS active thread percentage
pub const MAX_MPS_LIMIT: i32 = 100;
/// Lower bound for the MPS active thread percentage
pub const MIN_MPS_LIMIT: i32 = 0;

/// Convert a dedicated GPU count to MPS units
pub fn convert_gpu_to_mps(gpu_count: u32) -> u32 {
    gpu_count * MPS_UNITS_PER_GPU
}

/// Convert MPS units to whole GPUs, rounding any remainder up
pub fn convert_mps_to_gpu(mps_units: u32) -> u32 {
    mps_units.div_ceil(MPS_UNITS_PER_GPU)
}

/// A GPU quota is valid when it is positive
pub fn validate_gpu_quota(quota: i64) -> bool {
    quota > 0
}

/// Check an MPS thread percentage against the allowed range
pub fn validate_mps_limit(limit: i32) -> bool {
    (MIN_MPS_LIMIT..=MAX_MPS_LIMIT).contains(&limit)
}

/// Sum a list of MPS requests
pub fn calculate_mps_usage(requests: &[u32]) -> u32 {
    requests.iter().sum()
}

/// Check whether a request fits in what is available
pub fn is_within_quota(requested: u32, available: u32) -> bool {
    requested <= available
}

/// Per-container MPS settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpsConfig {
    /// Active thread percentage (0-100)
    pub thread_percentage: i32,
    /// Pinned device memory limit in MB (0 = no limit)
    pub memory_limit_mb: i64,
}

impl Default for MpsConfig {
    fn default() -> Self {
        Self {
            thread_percentage: DEFAULT_MPS_LIMIT,
            memory_limit_mb: 0,
        }
    }
}

impl MpsConfig {
    pub fn validate(&self) -> SchedResult<()> {
        if !validate_mps_limit(self.thread_percentage) {
            return Err(SchedError::Config(format!(
                "MPS thread percentage {} outside {}..={}",
                self.thread_percentage, MIN_MPS_LIMIT, MAX_MPS_LIMIT
            )));
        }
        if self.memory_limit_mb < 0 {
            return Err(SchedError::Config(format!(
                "MPS memory limit must not be negative, got {}",
                self.memory_limit_mb
            )));
        }
        Ok(())
    }

    /// Environment variables understood by the CUDA MPS client
    pub fn to_env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if self.thread_percentage > 0 {
            env.insert(
                "CUDA_MPS_ACTIVE_THREAD_PERCENTAGE".to_string(),
                self.thread_percentage.to_string(),
            );
        }
        if self.memory_limit_mb > 0 {
            env.insert(
                "CUDA_MPS_PINNED_DEVICE_MEM_LIMIT".to_string(),
                format!("{}M", self.memory_limit_mb),
            );
        }
        env
    }
}

/// MPS quota of one project
///
/// Invariant: `used_mps_units <= total_mps_units`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMpsQuota {
    pub project_id: String,
    pub total_mps_units: u32,
    pub used_mps_units: u32,
}

impl ProjectMpsQuota {
    pub fn new(project_id: impl Into<String>, total_mps_units: u32) -> Self {
        Self {
            project_id: project_id.into(),
            total_mps_units,
            used_mps_units: 0,
        }
    }

    /// Units still free
    pub fn available_mps(&self) -> u32 {
        self.total_mps_units.saturating_sub(self.used_mps_units)
    }

    pub fn can_allocate(&self, units: u32) -> bool {
        is_within_quota(units, self.available_mps())
    }

    /// Reserve units, refusing the request when it does not fit
    pub fn allocate(&mut self, units: u32) -> SchedResult<()> {
        if !self.can_allocate(units) {
            return Err(SchedError::QuotaExceeded(format!(
                "project {}: requested {} MPS units, available {}",
                self.project_id,
                units,
                self.available_mps()
            )));
        }
        self.used_mps_units += units;
        Ok(())
    }

    /// Return units; floors at zero so a double release cannot go negative
    pub fn release(&mut self, units: u32) {
        self.used_mps_units = self.used_mps_units.saturating_sub(units);
    }

    /// Percentage of the quota in use
    pub fn usage_percent(&self) -> f64 {
        if self.total_mps_units == 0 {
            return 0.0;
        }
        f64::from(self.used_mps_units) / f64::from(self.total_mps_units) * 100.0
    }
}
