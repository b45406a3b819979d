//! Shadow Fading
//!
//! Two independent fades multiply into a shadow's per-view alpha:
//!
//! - **Resolution fade**: small shadows fade out as their projected size
//!   drops toward the minimum resolution, instead of popping.
//! - **Hysteresis fade**: for lights with a fade-out time, a shadow fades in
//!   while its subject stays visible and fades out once it is hidden. A
//!   transition that interrupts a running fade resumes from the current
//!   alpha.

/// Alphas at or below this are treated as fully faded.
pub const MIN_FADE_ALPHA: f32 = 1.0 / 256.0;

/// Fade alpha for a shadow that wants `unclamped_resolution` texels.
///
/// `0` at or below `min_resolution`, `1` above `fade_resolution`. In between
/// the curve `ratio^exponent` is rescaled so that it starts at exactly `0`
/// one texel above the minimum, removing the step a small exponent would
/// otherwise leave there.
#[must_use]
pub fn resolution_fade_alpha(
    unclamped_resolution: u32,
    fade_resolution: u32,
    min_resolution: u32,
    exponent: f32,
) -> f32 {
    if unclamped_resolution > fade_resolution {
        return 1.0;
    }
    if unclamped_resolution <= min_resolution {
        return 0.0;
    }
    let inverse_range = 1.0 / (fade_resolution - min_resolution) as f32;
    let first_fade_value = inverse_range.powf(exponent);
    let size_ratio = (unclamped_resolution - min_resolution) as f32 * inverse_range;
    if first_fade_value >= 1.0 {
        return 1.0;
    }
    ((size_ratio.powf(exponent) - first_fade_value) / (1.0 - first_fade_value)).clamp(0.0, 1.0)
}

/// Resumable fade state of one light/primitive pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisState {
    pub start_fade_in: f32,
    pub start_fade_out: f32,
}

/// Fade parameters of the light.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HysteresisParams {
    /// Seconds a full fade takes; `0` disables hysteresis.
    pub fade_time: f32,
    pub exponent: f32,
}

/// Advances the hysteresis fade and returns the current alpha.
///
/// `since_change` is the time since the subject's visibility last flipped,
/// `since_visible` the time since it was last visible. Both are clamped to
/// the fade time. The opposite start value is updated so that the next
/// transition starts from where this one is now.
#[must_use]
pub fn hysteresis_fade_alpha(
    state: &mut HysteresisState,
    params: HysteresisParams,
    subject_visible: bool,
    since_change: f32,
    since_visible: f32,
) -> f32 {
    if params.fade_time <= f32::EPSILON {
        return 1.0;
    }
    let exponent = params.exponent.max(0.01);
    if subject_visible {
        let t = (since_change.min(params.fade_time) / params.fade_time).max(0.0);
        let percent = t.powf(1.0 / exponent);
        let alpha = (percent * (1.0 - state.start_fade_in) + state.start_fade_in).clamp(0.0, 1.0);
        state.start_fade_out = alpha;
        alpha
    } else {
        let t = (since_visible.min(params.fade_time) / params.fade_time).max(0.0);
        let percent = t.powf(exponent);
        let alpha = (state.start_fade_out - state.start_fade_out * percent).clamp(0.0, 1.0);
        state.start_fade_in = alpha;
        alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fade_is_zero_at_minimum_and_one_above_fade() {
        assert_eq!(resolution_fade_alpha(32, 64, 32, 0.25), 0.0);
        assert_eq!(resolution_fade_alpha(33, 64, 32, 0.25), 0.0);
        assert_eq!(resolution_fade_alpha(65, 64, 32, 0.25), 1.0);
        assert!((resolution_fade_alpha(64, 64, 32, 0.25) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fade_is_monotonic_in_between() {
        let mut last = 0.0;
        for r in 32..=70 {
            let a = resolution_fade_alpha(r, 64, 32, 0.25);
            assert!(a >= last, "fade dropped at {r}: {a} < {last}");
            last = a;
        }
    }

    #[test]
    fn degenerate_range_is_a_step() {
        assert_eq!(resolution_fade_alpha(40, 40, 40, 0.25), 0.0);
        assert_eq!(resolution_fade_alpha(41, 40, 40, 0.25), 1.0);
    }

    #[test]
    fn interrupted_fade_resumes_from_current_alpha() {
        let params = HysteresisParams {
            fade_time: 1.0,
            exponent: 1.0,
        };
        let mut state = HysteresisState {
            start_fade_in: 0.0,
            start_fade_out: 1.0,
        };
        // Half faded in.
        let a = hysteresis_fade_alpha(&mut state, params, true, 0.5, 0.0);
        assert!((a - 0.5).abs() < 1e-6);
        // Hidden right away: fading out starts at 0.5, not 1.
        let b = hysteresis_fade_alpha(&mut state, params, false, 0.0, 0.0);
        assert!((b - 0.5).abs() < 1e-6);
        let c = hysteresis_fade_alpha(&mut state, params, false, 0.5, 0.5);
        assert!((c - 0.25).abs() < 1e-6);
        assert!((state.start_fade_in - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_fade_time_disables_hysteresis() {
        let mut state = HysteresisState {
            start_fade_in: 0.0,
            start_fade_out: 0.0,
        };
        let params = HysteresisParams {
            fade_time: 0.0,
            exponent: 3.0,
        };
        assert_eq!(hysteresis_fade_alpha(&mut state, params, false, 5.0, 5.0), 1.0);
    }
}
