/// Milliseconds from the platform's monotonic counter. The counter is 32 bits
/// wide and wraps after about 49.7 days.
pub type Millis = u32;

/// Time elapsed from `since` to `now`, correct across one counter wraparound.
pub fn elapsed_ms(now: Millis, since: Millis) -> Millis {
    now.wrapping_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_plain_difference_without_wrap() {
        assert_eq!(elapsed_ms(1_500, 1_000), 500);
        assert_eq!(elapsed_ms(42, 42), 0);
    }

    #[test]
    fn elapsed_survives_counter_wraparound() {
        let since = u32::MAX - 99;
        assert_eq!(elapsed_ms(200, since), 300);
    }
}
