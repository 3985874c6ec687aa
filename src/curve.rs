/*
 * This file is part of Vortec.
 *
 * Copyright (C) 2026 Vortec contributors
 *
 * Vortec is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Vortec is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Vortec. If not, see <https://www.gnu.org/licenses/>.
 */

//! Fan-curve evaluation with per-level hysteresis.
//!
//! A curve is an ascending sequence of threshold levels. Rising temperature
//! reacts immediately at a level's `up_threshold`; falling temperature only
//! demotes once it drops below the *active* level's `down_threshold`, and
//! then by exactly one level per evaluation. Inside the band
//! `[down_threshold, up_threshold)` of the active level the speed holds.

use crate::config::Threshold;

/// Integer speed a threshold level emits. Levels are matched against the
/// last emitted integer speed, so the curve's real-valued `fan_speed` is
/// rounded once here.
fn level_speed(threshold: &Threshold) -> i32 {
    threshold.fan_speed.round() as i32
}

/// Compute the new target speed for `effective_temp`, given the speed the
/// curve last emitted. `thresholds` must be sorted ascending by
/// `up_threshold` (enforced at config load).
pub fn evaluate(effective_temp: f64, last_speed: i32, thresholds: &[Threshold]) -> i32 {
    // Highest level whose up_threshold has been crossed.
    let rise_target = thresholds
        .iter()
        .take_while(|t| f64::from(t.up_threshold) <= effective_temp)
        .last()
        .map(level_speed)
        .unwrap_or(0);

    if rise_target > last_speed {
        return rise_target;
    }

    // Index of the level currently holding the output, if any.
    let active = thresholds.iter().position(|t| level_speed(t) == last_speed);
    if let Some(level) = active {
        if effective_temp < f64::from(thresholds[level].down_threshold) {
            // Step down exactly one level.
            return if level > 0 {
                level_speed(&thresholds[level - 1])
            } else {
                0
            };
        }
    }

    last_speed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(up: i32, down: i32, speed: f64) -> Threshold {
        Threshold {
            up_threshold: up,
            down_threshold: down,
            fan_speed: speed,
        }
    }

    fn test_curve() -> Vec<Threshold> {
        vec![
            threshold(25, 20, 0.0),
            threshold(50, 40, 30.0),
            threshold(70, 60, 80.0),
        ]
    }

    #[test]
    fn rises_to_crossed_level() {
        let curve = test_curve();
        assert_eq!(evaluate(30.0, 0, &curve), 0);
        assert_eq!(evaluate(55.0, 0, &curve), 30);
        assert_eq!(evaluate(75.0, 30, &curve), 80);
    }

    #[test]
    fn rise_skips_intermediate_levels() {
        let curve = test_curve();
        // A jump straight past two up-thresholds lands on the highest.
        assert_eq!(evaluate(90.0, 0, &curve), 80);
    }

    #[test]
    fn rise_reacts_exactly_at_up_threshold() {
        let curve = test_curve();
        assert_eq!(evaluate(50.0, 0, &curve), 30);
        assert_eq!(evaluate(49.9, 0, &curve), 0);
    }

    #[test]
    fn holds_inside_hysteresis_band() {
        let curve = test_curve();
        // 45°C is below the 50°C up-threshold of the next level but at or
        // above the active level's 40°C down-threshold.
        assert_eq!(evaluate(45.0, 30, &curve), 30);
        assert_eq!(evaluate(40.0, 30, &curve), 30);
    }

    #[test]
    fn demotes_one_level_below_down_threshold() {
        let curve = test_curve();
        assert_eq!(evaluate(39.0, 30, &curve), 0);
        assert_eq!(evaluate(59.0, 80, &curve), 30);
    }

    #[test]
    fn demotes_to_zero_from_lowest_level() {
        let curve = vec![threshold(30, 25, 40.0), threshold(60, 50, 90.0)];
        assert_eq!(evaluate(20.0, 40, &curve), 0);
    }

    #[test]
    fn unknown_last_speed_holds_unless_rising() {
        let curve = test_curve();
        // 55 matches no level; nothing above it has been crossed at 45°C.
        assert_eq!(evaluate(45.0, 55, &curve), 55);
        // A crossed level above the orphan value still wins.
        assert_eq!(evaluate(75.0, 55, &curve), 80);
    }

    #[test]
    fn output_is_always_a_level_speed_or_zero() {
        let curve = test_curve();
        let levels: Vec<i32> = curve.iter().map(level_speed).collect();
        let mut speed = 0;
        for temp in [10, 26, 45, 51, 69, 71, 65, 58, 41, 39, 22, 19] {
            speed = evaluate(f64::from(temp), speed, &curve);
            assert!(
                speed == 0 || levels.contains(&speed),
                "speed {} not a curve level",
                speed
            );
        }
    }

    #[test]
    fn monotone_temperature_gives_monotone_speed() {
        let curve = test_curve();
        let mut speed = 0;
        let mut last = 0;
        for temp in [10, 20, 25, 30, 45, 50, 55, 65, 70, 90] {
            speed = evaluate(f64::from(temp), speed, &curve);
            assert!(speed >= last, "speed dropped on rising temperature");
            last = speed;
        }
    }

    #[test]
    fn idempotent_inside_band() {
        let curve = test_curve();
        // Active level 1: holds for any temp in [40, 50).
        for temp in [40.0, 44.5, 49.9] {
            assert_eq!(evaluate(temp, 30, &curve), 30);
        }
    }

    #[test]
    fn empty_curve_emits_zero() {
        assert_eq!(evaluate(80.0, 0, &[]), 0);
    }
}
