const BITS_PER_BYTE: f64 = 8.0;
const BITS_PER_MEGABIT: f64 = 1_000_000.0;
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Decimal megabits: 1 Mbit = 1,000,000 bits.
pub fn bytes_to_megabits(bytes: f64) -> f64 {
    bytes * BITS_PER_BYTE / BITS_PER_MEGABIT
}

pub fn minutes_to_seconds(minutes: f64) -> f64 {
    minutes * SECONDS_PER_MINUTE
}
