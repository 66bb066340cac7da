//! Friction id catalog (spec §6.2) and the gate-specific id groups MSWIM
//! matches against (spec §4.7.4).

use std::collections::HashMap;

pub trait FrictionCatalog: Send + Sync {
    /// Severity in [0,100]; unknown ids default to 50 per spec.
    fn severity(&self, id: &str) -> f64;
}

/// Default in-process catalog. Real deployments would back this with a
/// config table; the severities below are the ones the gate rules in
/// spec §4.7.4 are written against.
#[derive(Debug, Default)]
pub struct StaticFrictionCatalog;

impl FrictionCatalog for StaticFrictionCatalog {
    fn severity(&self, id: &str) -> f64 {
        match id {
            "F096" | "F097" => 95.0, // payment failure
            "F112" => 92.0,          // checkout timeout
            "F036" => 85.0,          // help search
            "F053" => 60.0,          // out of stock
            _ if is_technical(id) => 70.0,
            _ if is_shipping(id) => 55.0,
            _ => 50.0,
        }
    }
}

/// Deterministic test double: explicit overrides, default 50 otherwise.
#[derive(Debug, Default)]
pub struct MapFrictionCatalog {
    overrides: HashMap<String, f64>,
}

impl MapFrictionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, severity: f64) -> Self {
        self.overrides.insert(id.into(), severity);
        self
    }
}

impl FrictionCatalog for MapFrictionCatalog {
    fn severity(&self, id: &str) -> f64 {
        self.overrides.get(id).copied().unwrap_or(50.0)
    }
}

fn numeric_suffix(id: &str) -> Option<u32> {
    id.strip_prefix('F').and_then(|rest| rest.parse::<u32>().ok())
}

/// F161..F177 inclusive.
pub fn is_technical(id: &str) -> bool {
    numeric_suffix(id).is_some_and(|n| (161..=177).contains(&n))
}

/// F236..F247 inclusive.
pub fn is_shipping(id: &str) -> bool {
    numeric_suffix(id).is_some_and(|n| (236..=247).contains(&n))
}

pub fn is_payment_failure(id: &str) -> bool {
    id == "F096" || id == "F097"
}

pub fn is_checkout_timeout(id: &str) -> bool {
    id == "F112"
}

pub fn is_help_search(id: &str) -> bool {
    id == "F036"
}

pub fn is_out_of_stock(id: &str) -> bool {
    id == "F053"
}
