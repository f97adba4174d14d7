//! LED Matrix
//!
//! Immutable 9x9 bitmap shown on the controller's LED display, plus its GATT
//! wire encoding.

use std::fmt;

/// Number of LEDs on the controller (9 rows of 9)
pub const LED_COUNT: usize = 81;

/// Number of bytes needed to pack [`LED_COUNT`] bits
pub const MATRIX_BYTES: usize = 11;

/// Length of the payload written to the LED matrix characteristic
pub const GATT_PAYLOAD_LEN: usize = MATRIX_BYTES + 2;

/// Characters that switch an LED off, everything else switches it on
const LED_OFF_CHARACTERS: [char; 2] = [' ', '0'];

/// Brightness byte following the bitmap; the firmware treats it as the frame terminator
const FRAME_TERMINATOR: u8 = 0xFF;

/// Bit in the last bitmap byte requesting an onion-skinning fade-in
const FADE_IN_FLAG: u8 = 1 << 4;

/// A 9x9 LED bitmap.
///
/// Two matrices are equal when their bit patterns are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedMatrix {
    bits: [bool; LED_COUNT],
}

impl LedMatrix {
    /// Build a matrix from an ASCII pattern, one character per LED, row by row.
    ///
    /// Input longer than 81 characters is truncated, shorter input is padded
    /// with switched-off LEDs.
    pub fn new(pattern: &str) -> Self {
        let mut bits = [false; LED_COUNT];
        for (bit, c) in bits.iter_mut().zip(pattern.chars()) {
            *bit = !LED_OFF_CHARACTERS.contains(&c);
        }
        Self { bits }
    }

    /// Matrix with every LED switched on
    pub fn all_on() -> Self {
        Self {
            bits: [true; LED_COUNT],
        }
    }

    /// Matrix with every LED switched off
    pub fn all_off() -> Self {
        Self {
            bits: [false; LED_COUNT],
        }
    }

    /// Built-in "busy" indicator
    pub fn busy() -> Self {
        Self::from_code(1)
    }

    /// Matrix whose first LEDs spell `code` in binary, least significant bit first
    fn from_code(code: u8) -> Self {
        let mut bits = [false; LED_COUNT];
        for (i, bit) in bits.iter_mut().take(8).enumerate() {
            *bit = code & (1 << i) != 0;
        }
        Self { bits }
    }

    pub fn bits(&self) -> &[bool; LED_COUNT] {
        &self.bits
    }

    /// State of the LED at `row`/`column`, `None` when out of range
    pub fn led(&self, row: usize, column: usize) -> Option<bool> {
        if row >= 9 || column >= 9 {
            return None;
        }
        Some(self.bits[row * 9 + column])
    }

    /// Pack the bitmap LSB-first into 11 bytes.
    ///
    /// LED `n` ends up in bit `n % 8` of byte `n / 8`; the last byte only carries LED 80.
    pub fn encode(&self) -> [u8; MATRIX_BYTES] {
        let mut bytes = [0u8; MATRIX_BYTES];
        for (i, _) in self.bits.iter().enumerate().filter(|(_, on)| **on) {
            bytes[i / 8] |= 1 << (i % 8);
        }
        bytes
    }

    /// Full characteristic payload: bitmap, terminator and display duration.
    ///
    /// The duration byte is the interval in tenths of a second, clamped to `0..=255`.
    pub fn gatt_payload(&self, display_interval_secs: f64, fade_in: bool) -> [u8; GATT_PAYLOAD_LEN] {
        let mut payload = [0u8; GATT_PAYLOAD_LEN];
        payload[..MATRIX_BYTES].copy_from_slice(&self.encode());
        if fade_in {
            payload[MATRIX_BYTES - 1] |= FADE_IN_FLAG;
        }
        payload[MATRIX_BYTES] = FRAME_TERMINATOR;
        payload[MATRIX_BYTES + 1] = display_duration_byte(display_interval_secs);
        payload
    }
}

impl Default for LedMatrix {
    fn default() -> Self {
        Self::all_off()
    }
}

impl fmt::Debug for LedMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<String> = self
            .bits
            .chunks(9)
            .map(|row| row.iter().map(|on| if *on { '*' } else { '.' }).collect())
            .collect();
        f.debug_tuple("LedMatrix").field(&rows.join("/")).finish()
    }
}

fn display_duration_byte(display_interval_secs: f64) -> u8 {
    let tenths = display_interval_secs * 10.0;
    if tenths.is_nan() {
        return 0;
    }
    tenths.clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONES: &str = "111111111\
                        111111111\
                        111111111\
                        111111111\
                        111111111\
                        111111111\
                        111111111\
                        111111111\
                        111111111";

    #[test]
    fn test_blank_pattern_is_all_off() {
        assert_eq!(LedMatrix::new(&" ".repeat(LED_COUNT)), LedMatrix::all_off());
        assert_eq!(LedMatrix::new(""), LedMatrix::all_off());
    }

    #[test]
    fn test_full_pattern_is_all_on() {
        assert_eq!(LedMatrix::new(ONES), LedMatrix::all_on());
    }

    #[test]
    fn test_short_pattern_is_padded_with_off() {
        let matrix = LedMatrix::new("111111111000000000");
        assert!(matrix.bits()[..9].iter().all(|b| *b));
        assert!(matrix.bits()[9..].iter().all(|b| !*b));
    }

    #[test]
    fn test_long_pattern_is_truncated() {
        let pattern = format!("{}{}", ONES, "000000000");
        assert_eq!(LedMatrix::new(&pattern), LedMatrix::all_on());

        let pattern = format!("{}{}", " ".repeat(LED_COUNT), "*********");
        assert_eq!(LedMatrix::new(&pattern), LedMatrix::all_off());
    }

    #[test]
    fn test_any_other_character_is_on() {
        let matrix = LedMatrix::new("x.#0 ");
        assert_eq!(&matrix.bits()[..5], &[true, true, true, false, false]);
    }

    #[test]
    fn test_encode_packs_lsb_first() {
        let matrix = LedMatrix::new("********        * * * * ");
        assert_eq!(
            matrix.encode(),
            [0xFF, 0x00, 0x55, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_bit_positions_match_leds() {
        let pattern: String = (0..LED_COUNT)
            .map(|i| if i % 3 == 0 || i == 80 { '*' } else { ' ' })
            .collect();
        let matrix = LedMatrix::new(&pattern);
        let bytes = matrix.encode();
        assert_eq!(bytes.len(), MATRIX_BYTES);
        for n in 0..LED_COUNT {
            let bit = bytes[n / 8] & (1 << (n % 8)) != 0;
            assert_eq!(bit, matrix.bits()[n], "LED {}", n);
        }
        assert_eq!(bytes[10], 0x01);
    }

    #[test]
    fn test_gatt_payload_layout() {
        let payload = LedMatrix::all_on().gatt_payload(2.0, false);
        assert_eq!(payload.len(), GATT_PAYLOAD_LEN);
        assert_eq!(&payload[..10], &[0xFF; 10]);
        assert_eq!(payload[10], 0x01);
        assert_eq!(payload[11], 0xFF);
        assert_eq!(payload[12], 20);
    }

    #[test]
    fn test_gatt_payload_fade_in_and_duration_clamp() {
        let payload = LedMatrix::all_off().gatt_payload(100.0, true);
        assert_eq!(payload[10], FADE_IN_FLAG);
        assert_eq!(payload[12], 255);

        let payload = LedMatrix::all_off().gatt_payload(-1.0, false);
        assert_eq!(payload[12], 0);
    }

    #[test]
    fn test_busy_matrix_lights_first_led() {
        let busy = LedMatrix::busy();
        assert_eq!(busy.led(0, 0), Some(true));
        assert_eq!(busy.bits().iter().filter(|b| **b).count(), 1);
        assert_eq!(busy.led(9, 0), None);
    }
}
