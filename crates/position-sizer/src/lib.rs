use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Kelly Criterion position sizing from ensemble score magnitude
///
/// Formula: f* = p - (1 - p) / b
/// where:
///   p = implied win probability, 0.5 + |score| * edge_scale
///   b = assumed win/loss payoff ratio
/// The result is scaled by a fractional-Kelly multiplier and capped at
/// `max_position_fraction`. Sizing is monotonic in |score| by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellySizer {
    /// How much of the score magnitude converts into win-probability edge.
    /// 0.25 maps a full-conviction score (|score| = 1) to p = 0.75.
    pub edge_scale: f64,

    /// Assumed payoff ratio (average win / average loss).
    pub win_loss_ratio: f64,

    /// Fractional Kelly multiplier (0.5 = half-Kelly).
    pub kelly_multiplier: f64,

    /// Hard cap on the suggested fraction of portfolio equity.
    pub max_position_fraction: f64,
}

impl Default for KellySizer {
    fn default() -> Self {
        Self {
            edge_scale: 0.25,
            win_loss_ratio: 1.5,
            kelly_multiplier: 0.5, // Half-Kelly for safety
            max_position_fraction: 0.10,
        }
    }
}

impl KellySizer {
    pub fn new(
        edge_scale: f64,
        win_loss_ratio: f64,
        kelly_multiplier: f64,
        max_position_fraction: f64,
    ) -> Result<Self> {
        if !(0.0..=0.5).contains(&edge_scale) {
            bail!("edge_scale must be between 0 and 0.5");
        }
        if win_loss_ratio <= 0.0 {
            bail!("win_loss_ratio must be positive");
        }
        if kelly_multiplier <= 0.0 || kelly_multiplier > 1.0 {
            bail!("kelly_multiplier must be between 0 and 1");
        }
        if max_position_fraction <= 0.0 || max_position_fraction > 1.0 {
            bail!("max_position_fraction must be between 0 and 1");
        }

        Ok(Self {
            edge_scale,
            win_loss_ratio,
            kelly_multiplier,
            max_position_fraction,
        })
    }

    /// Suggested fraction of portfolio equity for an ensemble score in
    /// [-1, 1]. Only the magnitude matters; direction is decided upstream.
    pub fn size_fraction(&self, ensemble_score: f64) -> f64 {
        let magnitude = ensemble_score.abs().min(1.0);

        let p = 0.5 + magnitude * self.edge_scale;
        let q = 1.0 - p;
        let raw_kelly = p - q / self.win_loss_ratio;

        (raw_kelly * self.kelly_multiplier)
            .max(0.0)
            .min(self.max_position_fraction)
    }
}
