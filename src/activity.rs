//! rolling activity series shown next to the transcript.
//!
//! one sample per generation step, purely cosmetic: nothing here feeds back
//! into inference.

use std::collections::{HashMap, VecDeque};

/// retained samples.
pub const WINDOW_LEN: usize = 60;
/// upper bound of the value domain (lower bound is 0).
pub const MAX_SAMPLE: f32 = 2.5;
/// samples above this flip the series into alert colours.
pub const ALERT_THRESHOLD: f32 = 1.2;

/// rgba colours for the series stroke and fill.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeriesColors {
    pub stroke: [f32; 4],
    pub fill: [f32; 4],
}

impl SeriesColors {
    pub const NORMAL: Self = Self {
        stroke: [0.0, 240.0 / 255.0, 1.0, 1.0],
        fill: [0.0, 240.0 / 255.0, 1.0, 0.1],
    };
    pub const ALERT: Self = Self {
        stroke: [1.0, 0.2, 0.2, 1.0],
        fill: [1.0, 50.0 / 255.0, 50.0 / 255.0, 0.2],
    };
}

/// snapshot handed to whatever draws the chart.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityFrame {
    /// oldest first.
    pub samples: Vec<f32>,
    pub alert: bool,
    pub colors: SeriesColors,
}

/// fixed-length FIFO of activity samples with redraw bookkeeping.
///
/// redraws are skipped (not queued) while the surface is hidden. samples keep
/// landing regardless, and the dirty flag survives until the surface comes
/// back, so the first frame after a resume carries the full window.
#[derive(Clone, Debug)]
pub struct ActivityWindow {
    samples: VecDeque<f32>,
    alert: bool,
    visible: bool,
    dirty: bool,
}

impl Default for ActivityWindow {
    fn default() -> Self {
        Self {
            samples: std::iter::repeat_n(0.0, WINDOW_LEN).collect(),
            alert: false,
            visible: true,
            dirty: true,
        }
    }
}

impl ActivityWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: f32) {
        let sample = if sample.is_finite() { sample.clamp(0.0, MAX_SAMPLE) } else { 0.0 };
        if self.samples.len() == WINDOW_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        self.set_alert_mode(sample > ALERT_THRESHOLD);
        self.dirty = true;
    }

    pub fn set_alert_mode(&mut self, alert: bool) {
        if self.alert != alert {
            self.alert = alert;
            self.dirty = true;
        }
    }

    pub fn alert(&self) -> bool {
        self.alert
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn samples(&self) -> impl ExactSizeIterator<Item = f32> + '_ {
        self.samples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn colors(&self) -> SeriesColors {
        if self.alert { SeriesColors::ALERT } else { SeriesColors::NORMAL }
    }

    /// a frame to draw, if the window changed since the last one and the
    /// surface is visible.
    pub fn take_redraw(&mut self) -> Option<ActivityFrame> {
        if !self.visible || !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(ActivityFrame {
            samples: self.samples.iter().copied().collect(),
            alert: self.alert,
            colors: self.colors(),
        })
    }
}

/// activity value for the `step`-th token (1-based) carrying `text`.
///
/// a sawtooth over ten steps plus up to 0.5 of jitter taken from the
/// character entropy of the chunk, capped at [`MAX_SAMPLE`].
pub fn activity_sample(step: usize, text: &str) -> f32 {
    let ramp = (step % 10) as f32 / 10.0;
    (char_entropy(text) * 0.5 + ramp).min(MAX_SAMPLE)
}

/// shannon entropy of the chunk's chars, normalized into [0, 1).
fn char_entropy(text: &str) -> f32 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_default() += 1;
        total += 1;
    }
    if counts.len() < 2 {
        return 0.0;
    }
    let total = total as f32;
    let h: f32 = counts
        .values()
        .map(|&n| {
            let p = n as f32 / total;
            -p * p.log2()
        })
        .sum();
    // log2(k + 1) keeps the result strictly below 1 even for uniform chunks
    (h / ((counts.len() + 1) as f32).log2()).clamp(0.0, 0.999)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn starts_full_of_zeros() {
        let w = ActivityWindow::new();
        assert_eq!(w.len(), WINDOW_LEN);
        assert!(w.samples().all(|s| s == 0.0));
    }

    #[test]
    fn sixty_one_pushes_keep_the_last_sixty_in_order() {
        let mut w = ActivityWindow::new();
        for i in 0..=WINDOW_LEN {
            w.push(i as f32 / 100.0);
        }
        let got: Vec<f32> = w.samples().collect();
        let expected: Vec<f32> = (1..=WINDOW_LEN).map(|i| i as f32 / 100.0).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn push_evicts_exactly_the_oldest() {
        let mut w = ActivityWindow::new();
        for i in 0..WINDOW_LEN {
            w.push(0.5 + i as f32 / 1000.0);
        }
        let before: Vec<f32> = w.samples().collect();
        w.push(1.0);
        let after: Vec<f32> = w.samples().collect();
        assert_eq!(after.len(), WINDOW_LEN);
        assert_eq!(&after[..WINDOW_LEN - 1], &before[1..]);
        assert_eq!(after[WINDOW_LEN - 1], 1.0);
    }

    #[test]
    fn samples_are_clamped_into_domain() {
        let mut w = ActivityWindow::new();
        w.push(9.0);
        w.push(-1.0);
        w.push(f32::NAN);
        let tail: Vec<f32> = w.samples().skip(WINDOW_LEN - 3).collect();
        assert_eq!(tail, vec![MAX_SAMPLE, 0.0, 0.0]);
    }

    #[test]
    fn alert_follows_the_latest_sample() {
        let mut w = ActivityWindow::new();
        w.push(1.3);
        assert!(w.alert());
        assert_eq!(w.colors(), SeriesColors::ALERT);
        w.push(1.2);
        assert!(!w.alert());
        assert_eq!(w.colors(), SeriesColors::NORMAL);
    }

    #[test]
    fn hidden_surface_skips_redraw_and_resumes_with_everything() {
        let mut w = ActivityWindow::new();
        assert!(w.take_redraw().is_some());
        assert!(w.take_redraw().is_none(), "clean window must not redraw");

        w.set_visible(false);
        for i in 0..5 {
            w.push(i as f32 * 0.1);
        }
        assert!(w.take_redraw().is_none());

        w.set_visible(true);
        let frame = w.take_redraw().expect("redraw after resume");
        assert_eq!(frame.samples.len(), WINDOW_LEN);
        assert_eq!(&frame.samples[WINDOW_LEN - 5..], &[0.0, 0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn activity_sample_stays_in_domain() {
        for step in 1..200 {
            let v = activity_sample(step, "the quick brown fox");
            assert!((0.0..=MAX_SAMPLE).contains(&v), "step {step} -> {v}");
        }
    }

    #[test]
    fn activity_sample_ramps_over_ten_steps() {
        // single repeated char carries no entropy, leaving only the ramp
        assert_eq!(activity_sample(1, "a"), 0.1);
        assert_eq!(activity_sample(9, "aaaa"), 0.9);
        assert_eq!(activity_sample(10, ""), 0.0);
    }

    #[test]
    fn entropy_jitter_is_bounded() {
        let j = activity_sample(10, "abcdefghijklmnopqrstuvwxyz");
        assert!(j > 0.0 && j < 0.5, "{j}");
    }
}
