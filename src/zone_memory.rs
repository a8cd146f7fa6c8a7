// =============================================================================
// Zone Memory — persistent OB/FVG storage across sessions
// =============================================================================
//
// Remembers every order block and fair value gap ever detected, keyed by
// (symbol, timeframe, kind, direction, price level). Upserts keep the
// maximum strength seen. Tracks hit/win tallies so the sizer and analyst
// can weigh zones by historical performance, and predicts revisit targets
// near the current price.
//
// Backing store is a flat JSON map written atomically (tmp + rename).
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::structure::engine::{PatternKind, SmcPattern};
use crate::types::Bias;

/// Zone category stored in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    Ob,
    Fvg,
}

impl std::fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ob => write!(f, "OB"),
            Self::Fvg => write!(f, "FVG"),
        }
    }
}

/// A stored zone with its lifetime statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub symbol: String,
    pub timeframe: String,
    pub kind: ZoneKind,
    pub bias: Bias,
    pub price_level: f64,
    pub top: f64,
    pub bottom: f64,
    pub strength: f64,
    pub volume_zscore: f64,
    /// Epoch seconds of first detection.
    pub detected_at: i64,
    pub mitigated: bool,
    #[serde(default)]
    pub mitigated_at: i64,
    #[serde(default)]
    pub hit_count: u32,
    #[serde(default)]
    pub win_count: u32,
    #[serde(default)]
    pub loss_count: u32,
}

impl ZoneRecord {
    /// Map key: kind and direction distinguish entries at the same level.
    pub fn key(&self) -> String {
        zone_key(&self.symbol, &self.timeframe, self.kind, self.bias, self.price_level)
    }

    /// Win percentage over recorded hits, 0.0 when never hit.
    pub fn hit_rate(&self) -> f64 {
        if self.hit_count == 0 {
            return 0.0;
        }
        self.win_count as f64 / self.hit_count as f64 * 100.0
    }
}

pub fn zone_key(symbol: &str, timeframe: &str, kind: ZoneKind, bias: Bias, level: f64) -> String {
    format!("{symbol}|{timeframe}|{kind}|{bias}|{level:.6}")
}

/// A ranked revisit candidate near the current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisitPrediction {
    pub key: String,
    pub kind: ZoneKind,
    pub bias: Bias,
    pub price_level: f64,
    pub top: f64,
    pub bottom: f64,
    pub strength: f64,
    pub distance_pct: f64,
    pub hit_rate: f64,
    /// 0-100 revisit probability estimate.
    pub probability: f64,
}

/// Aggregate statistics for the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneMemoryStats {
    pub total_zones: usize,
    pub active_zones: usize,
    pub total_hits: u32,
    pub overall_hit_rate: f64,
}

// =============================================================================
// ZoneMemory
// =============================================================================

/// Thread-safe persistent zone store.
pub struct ZoneMemory {
    zones: RwLock<HashMap<String, ZoneRecord>>,
    path: Option<PathBuf>,
}

impl ZoneMemory {
    /// Open (or create) a zone memory backed by `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let zones = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, ZoneRecord>>(&content) {
                Ok(map) => {
                    info!(path = %path.display(), zones = map.len(), "zone memory loaded");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt zone memory — starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            zones: RwLock::new(zones),
            path: Some(path),
        }
    }

    /// Volatile store for tests.
    pub fn in_memory() -> Self {
        Self {
            zones: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Persist the full map atomically.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let content = {
            let zones = self.zones.read();
            serde_json::to_string(&*zones).context("failed to serialise zone memory")?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write tmp zone memory to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename tmp zone memory to {}", path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Upserts
    // -------------------------------------------------------------------------

    /// Store detected OB/FVG patterns for a (symbol, timeframe). Returns the
    /// number of records touched. Upserts keep the maximum strength seen and
    /// never resurrect a mitigated zone.
    pub fn store_patterns(&self, symbol: &str, timeframe: &str, patterns: &[SmcPattern]) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut stored = 0;

        {
            let mut zones = self.zones.write();
            for pattern in patterns {
                let kind = match pattern.kind {
                    PatternKind::OrderBlock => ZoneKind::Ob,
                    PatternKind::Fvg => ZoneKind::Fvg,
                    _ => continue,
                };
                let key = zone_key(symbol, timeframe, kind, pattern.bias, pattern.price_level);

                match zones.entry(key) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let existing = entry.get_mut();
                        existing.strength = existing.strength.max(pattern.strength);
                        if pattern.mitigated && !existing.mitigated {
                            existing.mitigated = true;
                            existing.mitigated_at = now;
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(ZoneRecord {
                            symbol: symbol.to_string(),
                            timeframe: timeframe.to_string(),
                            kind,
                            bias: pattern.bias,
                            price_level: pattern.price_level,
                            top: pattern.top,
                            bottom: pattern.bottom,
                            strength: pattern.strength,
                            volume_zscore: pattern.volume_zscore,
                            detected_at: now,
                            mitigated: pattern.mitigated,
                            mitigated_at: if pattern.mitigated { now } else { 0 },
                            hit_count: 0,
                            win_count: 0,
                            loss_count: 0,
                        });
                    }
                }
                stored += 1;
            }
        }

        if stored > 0 {
            debug!(symbol, timeframe, stored, "zones upserted");
            if let Err(e) = self.save() {
                warn!(error = %e, "zone memory save failed");
            }
        }
        stored
    }

    /// Mark a zone as mitigated (price fully traversed the interval). The
    /// record persists for statistics.
    pub fn mark_mitigated(&self, key: &str) {
        let mut changed = false;
        {
            let mut zones = self.zones.write();
            if let Some(zone) = zones.get_mut(key) {
                if !zone.mitigated {
                    zone.mitigated = true;
                    zone.mitigated_at = chrono::Utc::now().timestamp();
                    changed = true;
                }
            }
        }
        if changed {
            if let Err(e) = self.save() {
                warn!(error = %e, "zone memory save failed");
            }
        }
    }

    /// Record a trade anchored on `key`: bumps the hit count and the win or
    /// loss tally.
    pub fn record_hit(&self, key: &str, is_win: bool) {
        let mut found = false;
        {
            let mut zones = self.zones.write();
            if let Some(zone) = zones.get_mut(key) {
                zone.hit_count += 1;
                if is_win {
                    zone.win_count += 1;
                } else {
                    zone.loss_count += 1;
                }
                found = true;
            }
        }
        if found {
            if let Err(e) = self.save() {
                warn!(error = %e, "zone memory save failed");
            }
        } else {
            debug!(key, "hit recorded for unknown zone — ignored");
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Unmitigated zones for a symbol, optionally overlapping a price range,
    /// sorted by strength descending.
    pub fn active_zones(&self, symbol: &str, price_range: Option<(f64, f64)>) -> Vec<ZoneRecord> {
        let zones = self.zones.read();
        let mut result: Vec<ZoneRecord> = zones
            .values()
            .filter(|z| z.symbol == symbol && !z.mitigated)
            .filter(|z| match price_range {
                Some((lo, hi)) => z.bottom <= hi && z.top >= lo,
                None => true,
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal)
        });
        result
    }

    /// All zones (including mitigated) for a symbol, newest first.
    pub fn historical_zones(&self, symbol: &str, limit: usize) -> Vec<ZoneRecord> {
        let zones = self.zones.read();
        let mut result: Vec<ZoneRecord> =
            zones.values().filter(|z| z.symbol == symbol).cloned().collect();
        result.sort_by_key(|z| std::cmp::Reverse(z.detected_at));
        result.truncate(limit);
        result
    }

    /// Zones price is likely to revisit inside a +/- `radius_pct` band,
    /// ranked by probability:
    ///   0.4 * strength + 0.35 * proximity + 0.25 * historical hit rate.
    pub fn predict_revisits(
        &self,
        symbol: &str,
        current_price: f64,
        radius_pct: f64,
    ) -> Vec<RevisitPrediction> {
        if current_price <= 0.0 || radius_pct <= 0.0 {
            return Vec::new();
        }
        let lo = current_price * (1.0 - radius_pct / 100.0);
        let hi = current_price * (1.0 + radius_pct / 100.0);

        let mut predictions: Vec<RevisitPrediction> = self
            .active_zones(symbol, Some((lo, hi)))
            .into_iter()
            .map(|z| {
                let distance_pct =
                    (z.price_level - current_price).abs() / current_price * 100.0;
                let proximity = (1.0 - distance_pct / radius_pct).max(0.0);
                let history = if z.hit_count >= 3 { z.hit_rate() / 100.0 } else { 0.5 };
                let probability =
                    (z.strength / 100.0 * 0.4 + proximity * 0.35 + history * 0.25) * 100.0;
                RevisitPrediction {
                    key: z.key(),
                    kind: z.kind,
                    bias: z.bias,
                    price_level: z.price_level,
                    top: z.top,
                    bottom: z.bottom,
                    strength: z.strength,
                    distance_pct: (distance_pct * 100.0).round() / 100.0,
                    hit_rate: (z.hit_rate() * 10.0).round() / 10.0,
                    probability: (probability * 10.0).round() / 10.0,
                }
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.probability.partial_cmp(&a.probability).unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions.truncate(10);
        predictions
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> ZoneMemoryStats {
        let zones = self.zones.read();
        let total = zones.len();
        let active = zones.values().filter(|z| !z.mitigated).count();
        let hits: u32 = zones.values().map(|z| z.hit_count).sum();
        let wins: u32 = zones.values().map(|z| z.win_count).sum();
        ZoneMemoryStats {
            total_zones: total,
            active_zones: active,
            total_hits: hits,
            overall_hit_rate: if hits > 0 {
                (wins as f64 / hits as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            },
        }
    }
}

impl std::fmt::Debug for ZoneMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneMemory")
            .field("zones", &self.zones.read().len())
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
