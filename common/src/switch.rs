use crate::clock::{elapsed_ms, Millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEdge {
    Pressed,
    Released,
}

/// Last level recorded by the sampler. Debouncing comes from the control loop
/// sampling cadence (one sample per tick), which is slower than contact bounce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchState {
    pub pressed: bool,
}

impl SwitchState {
    /// Records one raw sample and returns the edge when the level differs from
    /// the previously recorded one.
    pub fn sample(&mut self, raw_pressed: bool) -> Option<SwitchEdge> {
        if raw_pressed == self.pressed {
            return None;
        }

        self.pressed = raw_pressed;
        Some(if raw_pressed {
            SwitchEdge::Pressed
        } else {
            SwitchEdge::Released
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GestureWindow {
    pub count: u8,
    /// Time of the previous qualifying edge; `None` until the first one.
    pub last_edge_at: Option<Millis>,
}

/// Detects a burst of rapid switch edges ("N edges, each within the gap of
/// the previous one").
#[derive(Debug, Clone, Copy)]
pub struct GestureDetector {
    max_gap_ms: Millis,
    threshold: u8,
}

impl GestureDetector {
    pub fn new(max_gap_ms: Millis, threshold: u8) -> Self {
        Self {
            max_gap_ms,
            threshold: threshold.max(1),
        }
    }

    /// Feeds one qualifying edge. Returns true exactly once per completed
    /// burst, after which the count starts over.
    pub fn on_edge(&self, window: &mut GestureWindow, now: Millis) -> bool {
        let within_gap = window
            .last_edge_at
            .map(|last| elapsed_ms(now, last) < self.max_gap_ms)
            .unwrap_or(false);
        window.last_edge_at = Some(now);

        window.count = if within_gap {
            window.count.saturating_add(1)
        } else {
            1
        };

        if window.count >= self.threshold {
            window.count = 0;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_input_yields_a_single_edge() {
        let mut state = SwitchState::default();

        let edges: Vec<_> = [false, true, true, true, true]
            .into_iter()
            .filter_map(|raw| state.sample(raw))
            .collect();

        assert_eq!(edges, vec![SwitchEdge::Pressed]);
        assert!(state.pressed);
    }

    #[test]
    fn release_follows_press() {
        let mut state = SwitchState::default();

        assert_eq!(state.sample(true), Some(SwitchEdge::Pressed));
        assert_eq!(state.sample(false), Some(SwitchEdge::Released));
        assert_eq!(state.sample(false), None);
    }

    #[test]
    fn five_quick_edges_fire_once_on_the_fifth() {
        let detector = GestureDetector::new(500, 5);
        let mut window = GestureWindow::default();

        let fired: Vec<bool> = (0..5)
            .map(|i| detector.on_edge(&mut window, 1_000 + i * 499))
            .collect();

        assert_eq!(fired, vec![false, false, false, false, true]);
        assert_eq!(window.count, 0);
    }

    #[test]
    fn one_slow_gap_prevents_firing() {
        let detector = GestureDetector::new(500, 5);
        let mut window = GestureWindow::default();
        let times = [0, 100, 200, 700, 800];

        assert!(!times
            .into_iter()
            .any(|t| detector.on_edge(&mut window, t)));
        assert_eq!(window.count, 2);
    }

    #[test]
    fn first_edge_after_boot_only_opens_the_window() {
        let detector = GestureDetector::new(500, 2);
        let mut window = GestureWindow::default();

        assert!(!detector.on_edge(&mut window, 0));
        assert_eq!(window.count, 1);
        assert_eq!(window.last_edge_at, Some(0));

        assert!(detector.on_edge(&mut window, 10));
    }

    #[test]
    fn gesture_window_spans_counter_wraparound() {
        let detector = GestureDetector::new(500, 3);
        let mut window = GestureWindow::default();

        assert!(!detector.on_edge(&mut window, u32::MAX - 300));
        assert!(!detector.on_edge(&mut window, u32::MAX - 10));
        assert!(detector.on_edge(&mut window, 150));
    }
}
