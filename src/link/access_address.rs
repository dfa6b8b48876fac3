//! Validation and generation of data-channel access addresses.
//!
//! The Peripheral-role teacher never needs this: it receives an access address chosen by the
//! master inside `CONNECT_IND` and just stores it (see `link::connection::Connection`). A Central
//! has to generate one itself before transmitting `CONNECT_IND`, and validate any address a
//! higher layer hands it, so this module adds both sides.

use rand_core::RngCore;

/// The advertising-channel access address. No data-channel access address may equal or come
/// within one bit of this value, or a scanner could mistake a data PDU for an advertisement.
const ADV_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// Checks whether `aa` is a valid BLE data-channel access address.
///
/// Per the Bluetooth Core Spec, Vol 6, Part B, Section 2.1.2, a valid access address must:
///
/// 1. Differ from the advertising-channel access address (`0x8E89BED6`) by more than one bit.
/// 2. Not contain a run of 6 or more identical consecutive bits.
/// 3. Have at least 3 transitions between a `0` and a `1` (or vice versa) across all 32 bits.
/// 4. Have at least 2 such transitions within its most significant 6 bits.
pub fn is_valid(aa: u32) -> bool {
    if (aa ^ ADV_ACCESS_ADDRESS).count_ones() <= 1 {
        return false;
    }

    if longest_run(aa) >= 6 {
        return false;
    }

    if transitions(aa, 32) < 3 {
        return false;
    }

    if transitions(aa >> 26, 6) < 2 {
        return false;
    }

    true
}

/// Returns the length of the longest run of identical consecutive bits in the low `32` bits of
/// `value`.
fn longest_run(value: u32) -> u32 {
    let mut max_run = 1;
    let mut run = 1;
    for i in 1..32 {
        let prev = (value >> (i - 1)) & 1;
        let bit = (value >> i) & 1;
        if bit == prev {
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 1;
        }
    }
    max_run
}

/// Counts the number of bit transitions across the low `nbits` bits of `value`.
fn transitions(value: u32, nbits: u32) -> u32 {
    let mut count = 0;
    for i in 1..nbits {
        let prev = (value >> (i - 1)) & 1;
        let bit = (value >> i) & 1;
        if bit != prev {
            count += 1;
        }
    }
    count
}

/// An 8-bit linear-feedback shift register producing a free-running pseudorandom byte stream.
///
/// Galois form with taps at bits 0, 2, 3 and 5 feeding back into bit 7, matching the reference
/// firmware's `ble_ll_get_random()`. The all-zero state is a fixed point (it never advances), so
/// a zero seed is remapped to the firmware's own reset seed (`0x53`).
#[derive(Debug, Clone, Copy)]
struct Lfsr(u8);

impl Lfsr {
    fn new(seed: u8) -> Self {
        Self(if seed == 0 { 0x53 } else { seed })
    }

    /// Clocks the register 8 times, returning the resulting byte.
    fn next_byte(&mut self) -> u8 {
        let bit = (self.0 ^ (self.0 >> 2) ^ (self.0 >> 3) ^ (self.0 >> 5)) & 1;
        self.0 = (self.0 >> 1) | (bit << 7);
        self.0
    }

    fn next_u32(&mut self) -> u32 {
        (u32::from(self.next_byte()) << 24)
            | (u32::from(self.next_byte()) << 16)
            | (u32::from(self.next_byte()) << 8)
            | u32::from(self.next_byte())
    }
}

/// Generates random, valid access addresses from an LFSR stream, rejecting and retrying
/// candidates the validator above refuses.
///
/// The LFSR itself is deterministic, so it is reseeded from `Config::Rng` at construction time
/// (once per scan/initiate attempt) rather than carrying a fixed seed across the process
/// lifetime; this keeps the candidate sequence from retracing itself on every reconnect while
/// still matching the firmware's LFSR-based generator rather than a generic PRNG trait object.
pub struct AccessAddressGenerator {
    lfsr: Lfsr,
}

impl AccessAddressGenerator {
    /// Creates a new generator, seeding its LFSR from `rng`.
    pub fn new<R: RngCore>(rng: &mut R) -> Self {
        Self {
            lfsr: Lfsr::new((rng.next_u32() & 0xFF) as u8),
        }
    }

    /// Generates a new valid access address, retrying until the validator accepts one.
    pub fn generate(&mut self) -> u32 {
        loop {
            let candidate = self.lfsr.next_u32();
            if is_valid(candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_adv_access_address() {
        assert!(!is_valid(0x8E89_BED6));
    }

    #[test]
    fn rejects_all_zero() {
        assert!(!is_valid(0x0000_0000));
    }

    #[test]
    fn accepts_alternating_patterns() {
        assert!(is_valid(0xAAAA_AAAA));
        assert!(is_valid(0x5555_5555));
    }

    #[test]
    fn rejects_byte_aligned_runs() {
        // Long runs of identical bits within each byte, and no transitions in the top 6 bits.
        assert!(!is_valid(0xFF00_FF00));
    }

    #[test]
    fn rejects_long_run() {
        // 7 consecutive zero bits in the middle.
        assert!(!is_valid(0b1000_0000_0000_0000_1111_1111_1111_1111));
    }

    #[test]
    fn rejects_too_few_transitions_in_top_bits() {
        // Plenty of global transitions (0011 repeating), but the top 6 bits are constant zero.
        assert!(!is_valid(0x0333_3333));
    }

    #[test]
    fn accepts_reasonable_value() {
        assert!(is_valid(0x1234_5678));
    }

    struct StepRng(u32);
    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(0x9E37_79B9);
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            rand_core::impls::fill_bytes_via_next(self, dest)
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn generator_always_yields_valid_address() {
        let mut rng = StepRng(1);
        let mut gen = AccessAddressGenerator::new(&mut rng);
        for _ in 0..64 {
            assert!(is_valid(gen.generate()));
        }
    }

    #[test]
    fn lfsr_never_gets_stuck_at_zero() {
        let mut lfsr = Lfsr::new(0);
        for _ in 0..512 {
            assert_ne!(lfsr.next_byte(), 0);
        }
    }
}
