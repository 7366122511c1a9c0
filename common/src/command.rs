/// Commands accepted on the inbound command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TurnOn,
    TurnOff,
    EnterProvisioning,
    EnterUpdate,
    Reset,
    Unknown,
}

// Checked in order, first match wins.
const PREFIXES: [(&[u8], Command); 5] = [
    (b"set", Command::EnterProvisioning),
    (b"rst", Command::Reset),
    (b"ota", Command::EnterUpdate),
    (b"1", Command::TurnOn),
    (b"0", Command::TurnOff),
];

impl Command {
    /// Classifies a payload by case-sensitive prefix. Anything unrecognised is
    /// `Unknown`; the channel has no way to report a rejection.
    pub fn parse(payload: &[u8]) -> Self {
        PREFIXES
            .iter()
            .find(|(prefix, _)| payload.starts_with(prefix))
            .map(|(_, command)| *command)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnOn => "TURN_ON",
            Self::TurnOff => "TURN_OFF",
            Self::EnterProvisioning => "ENTER_PROVISIONING",
            Self::EnterUpdate => "ENTER_UPDATE",
            Self::Reset => "RESET",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_each_prefix() {
        assert_eq!(Command::parse(b"1"), Command::TurnOn);
        assert_eq!(Command::parse(b"0"), Command::TurnOff);
        assert_eq!(Command::parse(b"set"), Command::EnterProvisioning);
        assert_eq!(Command::parse(b"ota"), Command::EnterUpdate);
        assert_eq!(Command::parse(b"rst"), Command::Reset);
    }

    #[test]
    fn matches_by_prefix_only() {
        assert_eq!(Command::parse(b"1\n"), Command::TurnOn);
        assert_eq!(Command::parse(b"0ff"), Command::TurnOff);
        assert_eq!(Command::parse(b"setup"), Command::EnterProvisioning);
        assert_eq!(Command::parse(b"rst now"), Command::Reset);
    }

    #[test]
    fn provisioning_wins_over_later_prefixes() {
        assert_eq!(Command::parse(b"setota"), Command::EnterProvisioning);
        assert_eq!(Command::parse(b"rst1"), Command::Reset);
    }

    #[test]
    fn unrecognised_payloads_are_unknown() {
        assert_eq!(Command::parse(b""), Command::Unknown);
        assert_eq!(Command::parse(b"ON"), Command::Unknown);
        assert_eq!(Command::parse(b"SET"), Command::Unknown);
        assert_eq!(Command::parse(b" 1"), Command::Unknown);
        assert_eq!(Command::parse(&[0xff, 0x31]), Command::Unknown);
    }
}
