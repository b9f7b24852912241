//! Pair selection: choose the early and late scene to compare.
//!
//! All strategies share one pipeline: drop scenes whose cloud cover exceeds
//! the ceiling (absent cloud cover counts as 100%), require at least two
//! survivors, sort them by capture time, then dispatch on [`SelectionMode`].
//!
//! | Mode | Early | Late |
//! |------|-------|------|
//! | `exact` | closest to `start_date` | closest to `end_date` (independent) |
//! | `quality` | lowest cloud cover overall | lowest cloud cover among the last capture |
//! | `smart` | first in start-month window | last in window, later year |
//!
//! `smart` only tries seasonal matching when the requested span exceeds
//! [`SEASONAL_SPAN_DAYS`]; otherwise, or when either seasonal subset is
//! empty, it takes the first and last filtered scenes.
//!
//! The returned pair is always ordered `early.captured_at <= late.captured_at`.

use chrono::{Datelike, NaiveDate};

use crate::error::{AnalysisError, Result};
use crate::models::{SceneRecord, SelectionBranch, SelectionMode, SelectionRationale};

/// Spans longer than this (in days) trigger seasonal matching in smart mode.
pub const SEASONAL_SPAN_DAYS: i64 = 300;

/// Maximum month distance from the start month for a seasonal candidate.
pub const SEASONAL_MONTH_WINDOW: u32 = 1;

/// Two chosen scenes plus the reason they were chosen.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    pub early: SceneRecord,
    pub late: SceneRecord,
    pub rationale: SelectionRationale,
}

/// Selection parameters other than the scene list.
#[derive(Debug, Clone, Copy)]
pub struct SelectionCriteria {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_cloud_cover: f64,
    pub mode: SelectionMode,
    pub max_deviation_days: i64,
}

struct Pick<'a> {
    early: &'a SceneRecord,
    late: &'a SceneRecord,
    branch: SelectionBranch,
    reason: String,
    deviations: Option<[i64; 2]>,
}

/// Choose the scene pair for an analysis.
///
/// # Errors
///
/// - [`AnalysisError::InsufficientData`] when fewer than two scenes pass the
///   cloud-cover filter.
/// - [`AnalysisError::NoMatchWithinTolerance`] in exact mode when either
///   closest scene is further than `max_deviation_days` from its target date.
pub fn select(scenes: &[SceneRecord], criteria: &SelectionCriteria) -> Result<SelectionResult> {
    let total = scenes.len();

    let mut good: Vec<&SceneRecord> = scenes
        .iter()
        .filter(|s| s.effective_cloud_cover() <= criteria.max_cloud_cover)
        .collect();

    log::info!(
        "{} of {} scenes have cloud cover <= {}%",
        good.len(),
        total,
        criteria.max_cloud_cover
    );

    if good.len() < 2 {
        return Err(AnalysisError::InsufficientData {
            total,
            filtered: good.len(),
            max_cloud_cover: criteria.max_cloud_cover,
        });
    }

    // Stable: scenes captured at the same instant keep catalog order.
    good.sort_by_key(|s| s.captured_at);

    let pick = match criteria.mode {
        SelectionMode::Exact => pick_exact(&good, criteria)?,
        SelectionMode::Quality => pick_quality(&good),
        SelectionMode::Smart => pick_smart(&good, criteria),
    };

    let (early, late, deviations, swapped) = if pick.early.captured_at > pick.late.captured_at {
        log::warn!(
            "selected scenes out of order ({} after {}); swapping",
            pick.early.id,
            pick.late.id
        );
        let devs = pick.deviations.map(|[e, l]| [l, e]);
        (pick.late, pick.early, devs, true)
    } else {
        (pick.early, pick.late, pick.deviations, false)
    };

    log::info!(
        "selected {} ({}) and {} ({}): {}",
        early.id,
        early.capture_date(),
        late.id,
        late.capture_date(),
        pick.reason
    );

    Ok(SelectionResult {
        early: early.clone(),
        late: late.clone(),
        rationale: SelectionRationale {
            mode: criteria.mode,
            branch: pick.branch,
            reason: pick.reason,
            date_deviations: deviations,
            total_candidates: total,
            filtered_candidates: good.len(),
            swapped,
        },
    })
}

fn day_distance(scene: &SceneRecord, target: NaiveDate) -> i64 {
    (scene.capture_date() - target).num_days().abs()
}

/// Early and late are independent minimisations; the same scene may win both.
fn pick_exact<'a>(good: &[&'a SceneRecord], criteria: &SelectionCriteria) -> Result<Pick<'a>> {
    let early = closest_to(good, criteria.start_date);
    let late = closest_to(good, criteria.end_date);

    let early_dev = day_distance(early, criteria.start_date);
    let late_dev = day_distance(late, criteria.end_date);

    if early_dev > criteria.max_deviation_days || late_dev > criteria.max_deviation_days {
        return Err(AnalysisError::NoMatchWithinTolerance {
            early_deviation: early_dev,
            late_deviation: late_dev,
            max_deviation_days: criteria.max_deviation_days,
        });
    }

    Ok(Pick {
        early,
        late,
        branch: SelectionBranch::ExactMatch,
        reason: format!(
            "Closest images to requested dates (±{}/{} days)",
            early_dev, late_dev
        ),
        deviations: Some([early_dev, late_dev]),
    })
}

// First minimum wins, so ties resolve to the earlier capture.
fn closest_to<'a>(good: &[&'a SceneRecord], target: NaiveDate) -> &'a SceneRecord {
    let mut best = good[0];
    let mut best_dist = day_distance(best, target);
    for &scene in &good[1..] {
        let dist = day_distance(scene, target);
        if dist < best_dist {
            best = scene;
            best_dist = dist;
        }
    }
    best
}

/// Early optimises cloud cover globally; late optimises recency, then cloud cover.
fn pick_quality<'a>(good: &[&'a SceneRecord]) -> Pick<'a> {
    let early = lowest_cloud(good);

    let last_capture = good[good.len() - 1].captured_at;
    let latest: Vec<&SceneRecord> = good
        .iter()
        .copied()
        .filter(|s| s.captured_at == last_capture)
        .collect();
    let late = lowest_cloud(&latest);

    Pick {
        early,
        late,
        branch: SelectionBranch::QualityRanked,
        reason: "Best quality images selected (lowest cloud cover)".to_string(),
        deviations: None,
    }
}

fn lowest_cloud<'a>(scenes: &[&'a SceneRecord]) -> &'a SceneRecord {
    let mut best = scenes[0];
    for &scene in &scenes[1..] {
        if scene.effective_cloud_cover() < best.effective_cloud_cover() {
            best = scene;
        }
    }
    best
}

fn pick_smart<'a>(good: &[&'a SceneRecord], criteria: &SelectionCriteria) -> Pick<'a> {
    let first = good[0];
    let last = good[good.len() - 1];
    let span = (criteria.end_date - criteria.start_date).num_days();

    if span <= SEASONAL_SPAN_DAYS {
        return Pick {
            early: first,
            late: last,
            branch: SelectionBranch::ShortSpan,
            reason: "Short time period - using first and last good quality images".to_string(),
            deviations: None,
        };
    }

    let target_month = criteria.start_date.month();
    let start_year = criteria.start_date.year();
    let in_season =
        |s: &&SceneRecord| s.captured_at.month().abs_diff(target_month) <= SEASONAL_MONTH_WINDOW;

    let early = good.iter().copied().find(in_season);
    let late = good
        .iter()
        .copied()
        .filter(in_season)
        .filter(|s| s.captured_at.year() > start_year)
        .last();

    match (early, late) {
        (Some(early), Some(late)) => Pick {
            early,
            late,
            branch: SelectionBranch::SeasonalMatch,
            reason: format!("Seasonal matching applied (target month: {})", target_month),
            deviations: None,
        },
        _ => {
            log::info!(
                "no seasonal match around month {}; falling back to first and last",
                target_month
            );
            Pick {
                early: first,
                late: last,
                branch: SelectionBranch::SeasonalFallback,
                reason: "Fallback to first and last good quality images".to_string(),
                deviations: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn scene(id: &str, y: i32, m: u32, d: u32, cloud: Option<f64>) -> SceneRecord {
        SceneRecord {
            id: id.to_string(),
            captured_at: Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).unwrap(),
            cloud_cover_pct: cloud,
            platform: Some("Sentinel-2A".to_string()),
            instruments: vec!["msi".to_string()],
            band_assets: HashMap::new(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn criteria(start: NaiveDate, end: NaiveDate, mode: SelectionMode) -> SelectionCriteria {
        SelectionCriteria {
            start_date: start,
            end_date: end,
            max_cloud_cover: 20.0,
            mode,
            max_deviation_days: 30,
        }
    }

    #[test]
    fn test_insufficient_data_after_filter() {
        let scenes = vec![
            scene("a", 2023, 1, 1, Some(5.0)),
            scene("b", 2023, 1, 11, Some(50.0)),
            scene("c", 2023, 1, 21, None),
        ];
        let err = select(
            &scenes,
            &criteria(date(2023, 1, 1), date(2023, 2, 1), SelectionMode::Smart),
        )
        .unwrap_err();
        match err {
            AnalysisError::InsufficientData {
                total, filtered, ..
            } => {
                assert_eq!(total, 3);
                assert_eq!(filtered, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_catalog_is_insufficient() {
        let err = select(
            &[],
            &criteria(date(2023, 1, 1), date(2023, 2, 1), SelectionMode::Exact),
        )
        .unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { .. }));
    }

    #[test]
    fn test_exact_picks_closest_within_tolerance() {
        // day 0, day 10, day 40; start = day 5, end = day 35
        let scenes = vec![
            scene("d0", 2023, 3, 1, Some(1.0)),
            scene("d10", 2023, 3, 11, Some(1.0)),
            scene("d40", 2023, 4, 10, Some(1.0)),
        ];
        let mut c = criteria(date(2023, 3, 6), date(2023, 4, 5), SelectionMode::Exact);
        c.max_deviation_days = 20;

        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "d0");
        assert_eq!(result.late.id, "d40");
        assert_eq!(result.rationale.date_deviations, Some([5, 5]));
        assert_eq!(result.rationale.branch, SelectionBranch::ExactMatch);

        c.max_deviation_days = 3;
        match select(&scenes, &c).unwrap_err() {
            AnalysisError::NoMatchWithinTolerance {
                early_deviation,
                late_deviation,
                max_deviation_days,
            } => {
                assert_eq!(early_deviation, 5);
                assert_eq!(late_deviation, 5);
                assert_eq!(max_deviation_days, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_reversed_targets_swap_pair_and_deviations() {
        // start lands near d40 (2 days), end lands near d0 (3 days)
        let scenes = vec![
            scene("d0", 2023, 3, 1, Some(1.0)),
            scene("d10", 2023, 3, 11, Some(1.0)),
            scene("d40", 2023, 4, 10, Some(1.0)),
        ];
        let c = criteria(date(2023, 4, 8), date(2023, 3, 4), SelectionMode::Exact);

        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "d0");
        assert_eq!(result.late.id, "d40");
        assert!(result.rationale.swapped);
        assert_eq!(result.rationale.date_deviations, Some([3, 2]));
        assert!(result.early.captured_at < result.late.captured_at);
    }

    #[test]
    fn test_exact_may_pick_same_scene_for_both() {
        let scenes = vec![
            scene("only-good", 2023, 6, 15, Some(1.0)),
            scene("far-away", 2022, 1, 1, Some(1.0)),
        ];
        let c = criteria(date(2023, 6, 10), date(2023, 6, 20), SelectionMode::Exact);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "only-good");
        assert_eq!(result.late.id, "only-good");
    }

    #[test]
    fn test_quality_asymmetry() {
        let scenes = vec![
            scene("jan", 2023, 1, 5, Some(12.0)),
            scene("feb-clear", 2023, 2, 5, Some(0.5)),
            scene("mar", 2023, 3, 5, Some(8.0)),
            scene("apr-last", 2023, 4, 5, Some(15.0)),
        ];
        let c = criteria(date(2023, 1, 1), date(2023, 5, 1), SelectionMode::Quality);
        let result = select(&scenes, &c).unwrap();
        // Early is the clearest overall, late is simply the most recent.
        assert_eq!(result.early.id, "feb-clear");
        assert_eq!(result.late.id, "apr-last");
        assert_eq!(result.rationale.branch, SelectionBranch::QualityRanked);
        assert_eq!(result.rationale.date_deviations, None);
    }

    #[test]
    fn test_quality_late_prefers_clearer_among_last_capture() {
        // Two tiles of the same acquisition share a timestamp.
        let a = scene("tile-a", 2023, 4, 5, Some(18.0));
        let b = scene("tile-b", 2023, 4, 5, Some(3.0));
        let scenes = vec![scene("early", 2023, 1, 1, Some(1.0)), a, b];
        let c = criteria(date(2023, 1, 1), date(2023, 5, 1), SelectionMode::Quality);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "early");
        assert_eq!(result.late.id, "tile-b");
    }

    #[test]
    fn test_smart_short_span_uses_first_and_last() {
        let scenes = vec![
            scene("c", 2023, 3, 1, Some(2.0)),
            scene("a", 2023, 1, 1, Some(2.0)),
            scene("b", 2023, 2, 1, Some(2.0)),
        ];
        let c = criteria(date(2023, 1, 1), date(2023, 6, 1), SelectionMode::Smart);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "a");
        assert_eq!(result.late.id, "c");
        assert_eq!(result.rationale.branch, SelectionBranch::ShortSpan);
        assert!(result.rationale.reason.contains("Short time period"));
    }

    #[test]
    fn test_smart_seasonal_match() {
        let scenes = vec![
            scene("2022-05", 2022, 5, 20, Some(2.0)),
            scene("2022-06", 2022, 6, 10, Some(2.0)),
            scene("2022-12", 2022, 12, 1, Some(2.0)),
            scene("2023-06", 2023, 6, 12, Some(2.0)),
            scene("2024-07", 2024, 7, 2, Some(2.0)),
            scene("2024-10", 2024, 10, 2, Some(2.0)),
        ];
        let c = criteria(date(2022, 6, 1), date(2024, 6, 30), SelectionMode::Smart);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "2022-05");
        assert_eq!(result.late.id, "2024-07");
        assert_eq!(result.rationale.branch, SelectionBranch::SeasonalMatch);
        assert!(result.rationale.reason.contains("target month: 6"));
    }

    #[test]
    fn test_smart_seasonal_fallback() {
        // No scene within a month of June in any later year.
        let scenes = vec![
            scene("2022-06", 2022, 6, 10, Some(2.0)),
            scene("2022-11", 2022, 11, 10, Some(2.0)),
            scene("2023-01", 2023, 1, 10, Some(2.0)),
            scene("2023-10", 2023, 10, 10, Some(2.0)),
        ];
        let c = criteria(date(2022, 6, 1), date(2023, 12, 1), SelectionMode::Smart);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.early.id, "2022-06");
        assert_eq!(result.late.id, "2023-10");
        assert_eq!(result.rationale.branch, SelectionBranch::SeasonalFallback);
        assert!(result.rationale.reason.to_lowercase().contains("fallback"));
    }

    #[test]
    fn test_smart_month_window_does_not_wrap_year_end() {
        // January is not adjacent to December for seasonal purposes.
        let scenes = vec![
            scene("2022-12", 2022, 12, 5, Some(2.0)),
            scene("2023-06", 2023, 6, 5, Some(2.0)),
            scene("2024-01", 2024, 1, 5, Some(2.0)),
        ];
        let c = criteria(date(2022, 12, 1), date(2024, 2, 1), SelectionMode::Smart);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.rationale.branch, SelectionBranch::SeasonalFallback);
    }

    #[test]
    fn test_rationale_counts() {
        let scenes = vec![
            scene("a", 2023, 1, 1, Some(2.0)),
            scene("b", 2023, 1, 2, Some(90.0)),
            scene("c", 2023, 1, 3, Some(2.0)),
        ];
        let c = criteria(date(2023, 1, 1), date(2023, 1, 31), SelectionMode::Smart);
        let result = select(&scenes, &c).unwrap();
        assert_eq!(result.rationale.total_candidates, 3);
        assert_eq!(result.rationale.filtered_candidates, 2);
        assert!(!result.rationale.swapped);
        assert!(result.early.captured_at <= result.late.captured_at);
    }
}
