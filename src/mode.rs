use crate::model::{Head, Mode};

/// Refresh deviation, in mHz, at which a mode stops counting as the
/// requested rate.
const MAX_REFRESH_DELTA: i32 = 50;

/// Picks the mode of `head` with exactly `width`x`height`.
///
/// Without a refresh target (`None` or `0`) the highest refresh wins, the
/// first one seen on ties. With a target, the closest mode strictly within
/// [`MAX_REFRESH_DELTA`] wins, the first one seen on ties.
pub fn select_mode(head: &Head, width: i32, height: i32, refresh: Option<i32>) -> Option<&Mode> {
    let candidates = head
        .modes()
        .iter()
        .filter(|mode| mode.width == width && mode.height == height);

    match refresh.filter(|target| *target != 0) {
        None => {
            let mut best: Option<&Mode> = None;
            for mode in candidates {
                if best.is_none_or(|best| mode.refresh > best.refresh) {
                    best = Some(mode);
                }
            }
            best
        }
        Some(target) => {
            let mut best: Option<(&Mode, i32)> = None;
            for mode in candidates {
                let delta = (i64::from(target) - i64::from(mode.refresh)).unsigned_abs();
                let Ok(delta) = i32::try_from(delta) else {
                    continue;
                };
                if delta >= MAX_REFRESH_DELTA {
                    continue;
                }
                if best.is_none_or(|(_, best_delta)| delta < best_delta) {
                    best = Some((mode, delta));
                }
            }
            best.map(|(mode, _)| mode)
        }
    }
}
