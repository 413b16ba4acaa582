//! Glucose unit handling.
//!
//! The cache and alarm engine work in mg/dL throughout; hosts presenting
//! mmol/L convert at the display boundary.

use serde::{Deserialize, Serialize};

/// One mmol/L of glucose expressed in mg/dL.
pub const MGDL_PER_MMOLL: f64 = 18.0182;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GlucoseUnit {
    MgDl,
    MmolL,
}

impl Default for GlucoseUnit {
    fn default() -> Self {
        GlucoseUnit::MgDl
    }
}

impl GlucoseUnit {
    pub fn label(&self) -> &'static str {
        match self {
            GlucoseUnit::MgDl => "mg/dL",
            GlucoseUnit::MmolL => "mmol/L",
        }
    }

    /// Format an mg/dL value in this unit, with the unit suffix.
    pub fn format(&self, mgdl: f64) -> String {
        match self {
            GlucoseUnit::MgDl => format!("{} {}", mgdl.round() as i64, self.label()),
            GlucoseUnit::MmolL => format!("{:.1} {}", mgdl_to_mmol(mgdl), self.label()),
        }
    }
}

pub fn mgdl_to_mmol(mgdl: f64) -> f64 {
    mgdl / MGDL_PER_MMOLL
}

pub fn mmol_to_mgdl(mmol: f64) -> f64 {
    mmol * MGDL_PER_MMOLL
}
