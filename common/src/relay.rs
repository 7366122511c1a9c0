use crate::switch::SwitchEdge;

/// Authoritative relay output plus the "last change came from the switch" flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayState {
    pub on: bool,
    pub user_triggered: bool,
}

/// One state announcement for the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateReport {
    pub on: bool,
    pub manual: bool,
}

impl StateReport {
    /// `"1"`/`"0"`, with a trailing `"."` when a person at the switch caused it.
    pub fn payload(self) -> &'static str {
        match (self.on, self.manual) {
            (true, true) => "1.",
            (true, false) => "1",
            (false, true) => "0.",
            (false, false) => "0",
        }
    }
}

impl RelayState {
    pub fn enable(&mut self) -> StateReport {
        self.set(true)
    }

    pub fn disable(&mut self) -> StateReport {
        self.set(false)
    }

    pub fn toggle(&mut self) -> StateReport {
        if self.on {
            self.disable()
        } else {
            self.enable()
        }
    }

    /// Reports the current state without changing it. Consumes the flag like
    /// any other publish does.
    pub fn report(&mut self) -> StateReport {
        let report = StateReport {
            on: self.on,
            manual: self.user_triggered,
        };
        self.user_triggered = false;
        report
    }

    /// Applies the switch policy for one debounced edge and returns the
    /// reports to publish, in order.
    ///
    /// Toggle switches flip the relay on every edge and announce twice: once
    /// flagged as manual, once as a plain state report. Momentary buttons flip
    /// only on press; a release re-announces the current state as manual.
    pub fn apply_edge(&mut self, edge: SwitchEdge, momentary: bool) -> Vec<StateReport> {
        self.user_triggered = true;

        if momentary {
            return match edge {
                SwitchEdge::Pressed => vec![self.toggle()],
                SwitchEdge::Released => vec![self.report()],
            };
        }

        let flagged = self.toggle();
        let plain = self.report();
        vec![flagged, plain]
    }

    fn set(&mut self, on: bool) -> StateReport {
        self.on = on;
        self.report()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn payloads(reports: &[StateReport]) -> Vec<&'static str> {
        reports.iter().map(|report| report.payload()).collect()
    }

    #[test]
    fn enable_and_disable_report_plain_state() {
        let mut relay = RelayState::default();

        assert_eq!(relay.enable().payload(), "1");
        assert!(relay.on);
        assert_eq!(relay.enable().payload(), "1");
        assert_eq!(relay.disable().payload(), "0");
        assert!(!relay.on);
    }

    #[test]
    fn toggle_switch_publishes_flagged_then_plain_per_edge() {
        let mut relay = RelayState::default();

        let mut reports = relay.apply_edge(SwitchEdge::Pressed, false);
        assert!(relay.on);
        reports.extend(relay.apply_edge(SwitchEdge::Released, false));

        assert_eq!(payloads(&reports), vec!["1.", "1", "0.", "0"]);
        assert!(!relay.on);
        assert!(!relay.user_triggered);
    }

    #[test]
    fn momentary_press_toggles_and_release_only_reports() {
        let mut relay = RelayState::default();

        let pressed = relay.apply_edge(SwitchEdge::Pressed, true);
        assert_eq!(payloads(&pressed), vec!["1."]);
        assert!(relay.on);

        let released = relay.apply_edge(SwitchEdge::Released, true);
        assert_eq!(payloads(&released), vec!["1."]);
        assert!(relay.on);
        assert!(!relay.user_triggered);
    }

    #[test]
    fn remote_change_after_manual_change_is_not_flagged() {
        let mut relay = RelayState::default();

        let _ = relay.apply_edge(SwitchEdge::Pressed, true);
        assert_eq!(relay.disable(), StateReport { on: false, manual: false });
    }
}
