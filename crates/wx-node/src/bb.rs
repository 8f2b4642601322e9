//! Battery-backed variables.
//!
//! A small block of values survives a watchdog reset: the POST sequence
//! number, a record of the last POST failure (so the next successful
//! delivery can explain why the unit reset), and an operator scratch word.
//! The block is guarded by a 32-bit magic and the firmware version tag;
//! a magic mismatch clears everything, a version change clears only the
//! error record.
//!
//! The original kept a pointer to a static error string here, which goes
//! stale across a firmware update. This port stores a bounded copy of the
//! description instead.

use crate::hal::RetainedRam;
use crate::types::{VER_MAJOR, VER_MINOR};

/// Expected guard value at the head of the retained image.
pub const BB_MAGIC: u32 = 0xFACE_55AA;

/// Capacity of the stored error description.
pub const BB_ERR_STR_CAP: usize = 64;

/// Substitute description when the stored one is unusable.
pub const BB_BAD_POST_ERR_STR: &str = "Invalid POST error string";

/// Size of the serialized retained image.
pub const BB_IMAGE_LEN: usize = 82;

const OFF_MAGIC: usize = 0;
const OFF_SEQ: usize = 4;
const OFF_VER_MAJOR: usize = 8;
const OFF_VER_MINOR: usize = 9;
const OFF_ERR_FLAG: usize = 10;
const OFF_ERR_LEN: usize = 11;
const OFF_ERR_STR: usize = 12;
const OFF_ERR_STATE: usize = 76;
const OFF_TEST_WORD: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BbVars {
    seq_num: u32,
    ver_major: u8,
    ver_minor: u8,
    post_error_flag: bool,
    post_error_str: [u8; BB_ERR_STR_CAP],
    post_error_len: u8,
    post_error_state_num: i32,
    test_word: u16,
}

impl BbVars {
    fn decode(image: &[u8; BB_IMAGE_LEN]) -> Option<Self> {
        let magic = u32::from_le_bytes(image[OFF_MAGIC..OFF_SEQ].try_into().ok()?);
        if magic != BB_MAGIC {
            return None;
        }

        let mut post_error_str = [0u8; BB_ERR_STR_CAP];
        post_error_str.copy_from_slice(&image[OFF_ERR_STR..OFF_ERR_STATE]);

        Some(BbVars {
            seq_num: u32::from_le_bytes(image[OFF_SEQ..OFF_VER_MAJOR].try_into().ok()?),
            ver_major: image[OFF_VER_MAJOR],
            ver_minor: image[OFF_VER_MINOR],
            post_error_flag: image[OFF_ERR_FLAG] != 0,
            post_error_str,
            post_error_len: image[OFF_ERR_LEN].min(BB_ERR_STR_CAP as u8),
            post_error_state_num: i32::from_le_bytes(
                image[OFF_ERR_STATE..OFF_TEST_WORD].try_into().ok()?,
            ),
            test_word: u16::from_le_bytes(image[OFF_TEST_WORD..BB_IMAGE_LEN].try_into().ok()?),
        })
    }

    fn encode(&self) -> [u8; BB_IMAGE_LEN] {
        let mut image = [0u8; BB_IMAGE_LEN];
        image[OFF_MAGIC..OFF_SEQ].copy_from_slice(&BB_MAGIC.to_le_bytes());
        image[OFF_SEQ..OFF_VER_MAJOR].copy_from_slice(&self.seq_num.to_le_bytes());
        image[OFF_VER_MAJOR] = self.ver_major;
        image[OFF_VER_MINOR] = self.ver_minor;
        image[OFF_ERR_FLAG] = self.post_error_flag as u8;
        image[OFF_ERR_LEN] = self.post_error_len;
        image[OFF_ERR_STR..OFF_ERR_STATE].copy_from_slice(&self.post_error_str);
        image[OFF_ERR_STATE..OFF_TEST_WORD]
            .copy_from_slice(&self.post_error_state_num.to_le_bytes());
        image[OFF_TEST_WORD..BB_IMAGE_LEN].copy_from_slice(&self.test_word.to_le_bytes());
        image
    }

    fn cleared() -> Self {
        BbVars {
            seq_num: 0,
            // Zero version forces the error record to be cleared below.
            ver_major: 0,
            ver_minor: 0,
            post_error_flag: false,
            post_error_str: [0; BB_ERR_STR_CAP],
            post_error_len: 0,
            post_error_state_num: -1,
            test_word: 0,
        }
    }

    fn set_error_str(&mut self, desc: &str) {
        let bytes = desc.as_bytes();
        let len = bytes.len().min(BB_ERR_STR_CAP);
        self.post_error_str = [0; BB_ERR_STR_CAP];
        self.post_error_str[..len].copy_from_slice(&bytes[..len]);
        self.post_error_len = len as u8;
    }
}

/// The battery-backed variables bound to their backing store. Mutators
/// write the image back immediately so a reset at any point carries the
/// latest values.
pub struct Retained<R: RetainedRam> {
    ram: R,
    vars: BbVars,
}

impl<R: RetainedRam> Retained<R> {
    /// Loads and validates the retained image. Call once at start-up.
    pub fn open(mut ram: R) -> Self {
        let mut image = [0u8; BB_IMAGE_LEN];
        ram.load(&mut image);

        let mut vars = BbVars::decode(&image).unwrap_or_else(BbVars::cleared);

        if vars.ver_major != VER_MAJOR || vars.ver_minor != VER_MINOR {
            vars.ver_major = VER_MAJOR;
            vars.ver_minor = VER_MINOR;

            vars.post_error_flag = false;
            vars.set_error_str(BB_BAD_POST_ERR_STR);
            vars.post_error_state_num = -1;
        }

        let mut this = Retained { ram, vars };
        this.commit();
        this
    }

    fn commit(&mut self) {
        self.ram.store(&self.vars.encode());
    }

    pub fn seq_num(&self) -> u32 {
        self.vars.seq_num
    }

    /// Increments the sequence number and returns the new value.
    pub fn bump_seq(&mut self) -> u32 {
        self.vars.seq_num = self.vars.seq_num.wrapping_add(1);
        self.commit();
        self.vars.seq_num
    }

    pub fn post_error_pending(&self) -> bool {
        self.vars.post_error_flag
    }

    pub fn set_post_error_pending(&mut self, pending: bool) {
        self.vars.post_error_flag = pending;
        self.commit();
    }

    /// Description of the most recent POST outcome.
    pub fn post_error_str(&self) -> &str {
        let len = self.vars.post_error_len as usize;
        core::str::from_utf8(&self.vars.post_error_str[..len]).unwrap_or(BB_BAD_POST_ERR_STR)
    }

    pub fn post_error_state_num(&self) -> i32 {
        self.vars.post_error_state_num
    }

    /// Records the POST outcome description (truncated to fit).
    pub fn set_post_error_desc(&mut self, desc: &str) {
        self.vars.set_error_str(desc);
        self.commit();
    }

    /// Records the POST machine state number at the outcome.
    pub fn set_post_error_state(&mut self, state_num: i32) {
        self.vars.post_error_state_num = state_num;
        self.commit();
    }

    pub fn test_word(&self) -> u16 {
        self.vars.test_word
    }

    pub fn set_test_word(&mut self, value: u16) {
        self.vars.test_word = value;
        self.commit();
    }

    /// Releases the backing store (used by tests to simulate a reset).
    pub fn into_ram(self) -> R {
        self.ram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemRam {
        image: [u8; BB_IMAGE_LEN],
    }

    impl Default for MemRam {
        fn default() -> Self {
            Self {
                image: [0u8; BB_IMAGE_LEN],
            }
        }
    }

    impl RetainedRam for MemRam {
        fn load(&mut self, buf: &mut [u8]) {
            buf.copy_from_slice(&self.image);
        }
        fn store(&mut self, data: &[u8]) {
            self.image.copy_from_slice(data);
        }
    }

    #[test]
    fn fresh_ram_comes_up_cleared() {
        let bb = Retained::open(MemRam::default());

        assert_eq!(bb.seq_num(), 0);
        assert!(!bb.post_error_pending());
        assert_eq!(bb.post_error_str(), BB_BAD_POST_ERR_STR);
        assert_eq!(bb.post_error_state_num(), -1);
    }

    #[test]
    fn values_survive_a_reset() {
        let mut bb = Retained::open(MemRam::default());
        bb.bump_seq();
        bb.bump_seq();
        bb.set_post_error_desc("Socket closed unexpectedly");
        bb.set_post_error_state(7);
        bb.set_post_error_pending(true);
        bb.set_test_word(0xBEEF);

        let bb = Retained::open(bb.into_ram());

        assert_eq!(bb.seq_num(), 2);
        assert!(bb.post_error_pending());
        assert_eq!(bb.post_error_str(), "Socket closed unexpectedly");
        assert_eq!(bb.post_error_state_num(), 7);
        assert_eq!(bb.test_word(), 0xBEEF);
    }

    #[test]
    fn corrupt_magic_clears_everything() {
        let mut bb = Retained::open(MemRam::default());
        bb.bump_seq();
        bb.set_test_word(42);

        let mut ram = bb.into_ram();
        ram.image[0] ^= 0xFF;
        let bb = Retained::open(ram);

        assert_eq!(bb.seq_num(), 0);
        assert_eq!(bb.test_word(), 0);
    }

    #[test]
    fn version_change_clears_only_the_error_record() {
        let mut bb = Retained::open(MemRam::default());
        bb.bump_seq();
        bb.set_post_error_desc("Timed out");
        bb.set_post_error_pending(true);

        let mut ram = bb.into_ram();
        ram.image[super::OFF_VER_MINOR] = VER_MINOR.wrapping_add(1);
        let bb = Retained::open(ram);

        assert_eq!(bb.seq_num(), 1, "sequence number must survive an update");
        assert!(!bb.post_error_pending());
        assert_eq!(bb.post_error_str(), BB_BAD_POST_ERR_STR);
    }

    #[test]
    fn long_description_is_truncated_to_capacity() {
        let mut bb = Retained::open(MemRam::default());
        let long = "x".repeat(100);
        bb.set_post_error_desc(&long);
        assert_eq!(bb.post_error_str().len(), BB_ERR_STR_CAP);
    }
}
