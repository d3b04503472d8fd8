use std::collections::HashMap;

use trading_core::{Direction, Signal};

/// Weight used for a responding strategy the operator did not configure.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Weight-normalized average of signed confidences over the strategies
/// that actually responded. Absent strategies are excluded from both
/// numerator and denominator, so configuring a strategy that never
/// answers cannot move the score. Order-independent.
pub fn ensemble_score(signals: &[Signal], weights: &HashMap<String, f64>) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for signal in signals {
        let weight = weights
            .get(&signal.strategy_id)
            .copied()
            .unwrap_or(DEFAULT_WEIGHT);
        weighted_sum += weight * signal.signed_confidence();
        total_weight += weight;
    }

    if total_weight > 0.0 {
        weighted_sum / total_weight
    } else {
        0.0
    }
}

/// Map a score onto a direction through the dead zone. The boundary itself
/// resolves to HOLD (conservative default).
pub fn direction_for(score: f64, dead_zone_threshold: f64) -> Direction {
    if score > dead_zone_threshold {
        Direction::Buy
    } else if score < -dead_zone_threshold {
        Direction::Sell
    } else {
        Direction::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn signal(strategy_id: &str, direction: Direction, confidence: f64) -> Signal {
        Signal {
            strategy_id: strategy_id.to_string(),
            symbol: "SOLUSD".to_string(),
            direction,
            confidence,
            generated_at: Utc::now(),
        }
    }

    fn unit_weights(ids: &[&str]) -> HashMap<String, f64> {
        ids.iter().map(|id| (id.to_string(), 1.0)).collect()
    }

    #[test]
    fn four_agreeing_responders_out_of_six() {
        // 6 configured at weight 1.0, 4 respond BUY 0.8, 2 absent
        let weights = unit_weights(&["ma", "rsi", "bollinger", "momentum", "volume", "lstm"]);
        let signals = vec![
            signal("ma", Direction::Buy, 0.8),
            signal("rsi", Direction::Buy, 0.8),
            signal("bollinger", Direction::Buy, 0.8),
            signal("momentum", Direction::Buy, 0.8),
        ];

        let score = ensemble_score(&signals, &weights);
        assert!((score - 0.8).abs() < 1e-12);
        assert_eq!(direction_for(score, 0.15), Direction::Buy);
    }

    #[test]
    fn absent_strategies_never_move_the_score() {
        let signals = vec![
            signal("ma", Direction::Buy, 0.6),
            signal("rsi", Direction::Sell, 0.2),
        ];

        let configured = unit_weights(&["ma", "rsi"]);
        let mut with_extra = configured.clone();
        with_extra.insert("lstm".to_string(), 1.5);

        assert_eq!(
            ensemble_score(&signals, &configured),
            ensemble_score(&signals, &with_extra)
        );
    }

    #[test]
    fn weights_are_normalized_over_responders() {
        let mut weights = HashMap::new();
        weights.insert("ma".to_string(), 0.2);
        weights.insert("lstm".to_string(), 0.6);
        let signals = vec![
            signal("ma", Direction::Buy, 1.0),
            signal("lstm", Direction::Sell, 0.5),
        ];

        // (0.2 * 1.0 + 0.6 * -0.5) / 0.8 = -0.125
        let score = ensemble_score(&signals, &weights);
        assert!((score + 0.125).abs() < 1e-12);
    }

    #[test]
    fn unconfigured_responder_defaults_to_unit_weight() {
        let weights = HashMap::new();
        let signals = vec![
            signal("ma", Direction::Buy, 0.9),
            signal("mystery", Direction::Sell, 0.3),
        ];

        let score = ensemble_score(&signals, &weights);
        assert!((score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn hold_signals_dilute_conviction() {
        let weights = unit_weights(&["ma", "rsi"]);
        let signals = vec![
            signal("ma", Direction::Buy, 0.8),
            signal("rsi", Direction::Hold, 0.9),
        ];

        // HOLD contributes zero signed confidence but keeps its weight
        let score = ensemble_score(&signals, &weights);
        assert!((score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn score_is_order_independent() {
        let weights = unit_weights(&["ma", "rsi", "lstm"]);
        let mut signals = vec![
            signal("ma", Direction::Buy, 0.7),
            signal("rsi", Direction::Sell, 0.4),
            signal("lstm", Direction::Buy, 0.2),
        ];

        let forward = ensemble_score(&signals, &weights);
        signals.reverse();
        let reversed = ensemble_score(&signals, &weights);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn dead_zone_boundary_resolves_to_hold() {
        assert_eq!(direction_for(0.15, 0.15), Direction::Hold);
        assert_eq!(direction_for(-0.15, 0.15), Direction::Hold);
        assert_eq!(direction_for(0.1500001, 0.15), Direction::Buy);
        assert_eq!(direction_for(-0.1500001, 0.15), Direction::Sell);
        assert_eq!(direction_for(0.0, 0.15), Direction::Hold);
    }
}
