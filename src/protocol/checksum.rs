//! Checksum used by the hub protocol.
//!
//! The hub computes CRC-32 (the zlib polynomial) over data padded with zero
//! bytes up to a 4-byte boundary. The same function validates inbound frames
//! and produces the running/whole-file CRCs of a program upload.

/// Default padding alignment in bytes
pub const DEFAULT_ALIGN: usize = 4;

/// Compute the CRC-32 of `payload`, zero-padded to a multiple of `align`.
///
/// `seed` is the CRC to continue from (`0` for a fresh checksum), so
/// `checksum(b, checksum(a, 0, 4), 4)` equals `checksum(a ++ b, 0, 4)` for a
/// 4-aligned `a`. An `align` of 0 or 1 disables padding.
pub fn checksum(payload: &[u8], seed: u32, align: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(payload);

    if align > 1 {
        let remainder = payload.len() % align;
        if remainder != 0 {
            const ZEROS: [u8; 64] = [0; 64];
            let mut missing = align - remainder;
            while missing > 0 {
                let n = missing.min(ZEROS.len());
                hasher.update(&ZEROS[..n]);
                missing -= n;
            }
        }
    }

    hasher.finalize()
}

/// Checksum with the protocol defaults (seed 0, 4-byte alignment)
pub fn checksum_default(payload: &[u8]) -> u32 {
    checksum(payload, 0, DEFAULT_ALIGN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_vector() {
        // CRC-32 of [0x01, 0x02, 0x03, 0x00]
        assert_eq!(checksum(&[0x01, 0x02, 0x03], 0, 4), 0xB151_3FD4);
        assert_eq!(checksum(&[0x01, 0x02, 0x03, 0x00], 0, 4), 0xB151_3FD4);
    }

    #[test]
    fn test_padding_law() {
        let inputs: [&[u8]; 4] = [b"a", b"ab", b"abc", b"abcdefg"];
        for input in inputs {
            let mut padded = input.to_vec();
            while padded.len() % 4 != 0 {
                padded.push(0);
            }
            assert_eq!(checksum_default(input), checksum(&padded, 0, 1));
        }
    }

    #[test]
    fn test_aligned_input_not_padded() {
        assert_eq!(checksum(&[1, 2, 3, 4], 0, 4), 0xB63C_FBCD);
        assert_eq!(checksum(&[], 0, 4), 0);
    }

    #[test]
    fn test_deterministic_and_bit_sensitive() {
        let data: Vec<u8> = (0u8..=63).collect();
        let reference = checksum_default(&data);
        assert_eq!(reference, checksum_default(&data));

        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(checksum_default(&flipped), reference);
            }
        }
    }

    #[test]
    fn test_seed_continues_running_crc() {
        let first = [1u8, 2, 3, 4];
        let second = [5u8, 6];
        let running = checksum_default(&first);
        assert_eq!(checksum(&second, running, 4), 0x7E50_9630);
        assert_eq!(checksum_default(&[1, 2, 3, 4, 5, 6]), 0x7E50_9630);
    }

    #[test]
    fn test_wide_alignment() {
        let data = [0xAAu8; 3];
        let mut padded = data.to_vec();
        padded.resize(100, 0);
        assert_eq!(checksum(&data, 0, 100), checksum(&padded, 0, 1));
    }
}
