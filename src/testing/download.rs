//! Payload generation for the memory-download scenario
//!
//! The harness computes the CRC while it generates the bytes, then bakes
//! the bytes into a C array. The debuggee recomputes the CRC after `load`
//! and the two must agree.

use std::fmt::Write;

use rand::Rng;

/// Default payload size (1 MiB)
pub const DEFAULT_PAYLOAD_LEN: usize = 1 << 20;

/// Bytes per line in the generated source
const BYTES_PER_LINE: usize = 16;

/// Reflected CRC-32 polynomial (IEEE 802.3)
const POLY: u32 = 0xEDB8_8320;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Running CRC-32, matching `crc32()` in `targets/checksum.c`
#[derive(Debug, Clone)]
pub struct Crc32 {
    state: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state = TABLE[((self.state ^ b as u32) & 0xFF) as usize] ^ (self.state >> 8);
        }
    }

    pub fn finalize(&self) -> u32 {
        !self.state
    }
}

/// CRC-32 of a whole buffer
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finalize()
}

/// CRC passed to `all_done` as read back from a0
///
/// RV64 sign-extends 32-bit arguments in registers, unsigned ones included,
/// so only the low word carries the CRC.
pub fn crc_from_register(value: u64) -> u32 {
    value as u32
}

/// Random bytes plus the CRC computed while producing them
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub crc: u32,
}

/// Generate `len` random bytes
pub fn generate<R: Rng>(rng: &mut R, len: usize) -> Payload {
    let mut bytes = Vec::with_capacity(len);
    let mut crc = Crc32::new();
    let mut chunk = [0u8; 4096];

    while bytes.len() < len {
        let n = (len - bytes.len()).min(chunk.len());
        rng.fill(&mut chunk[..n]);
        crc.update(&chunk[..n]);
        bytes.extend_from_slice(&chunk[..n]);
    }

    Payload {
        bytes,
        crc: crc.finalize(),
    }
}

/// Render the payload as a C translation unit defining `data` and `data_len`
pub fn render_c_source(payload: &Payload) -> String {
    let mut out = String::with_capacity(payload.bytes.len() * 6 + 128);
    out.push_str("#include <stdint.h>\n\n");
    let _ = writeln!(out, "/* crc32 = 0x{:08x} */", payload.crc);
    out.push_str("const uint8_t data[] = {\n");
    for line in payload.bytes.chunks(BYTES_PER_LINE) {
        out.push_str("   ");
        for b in line {
            let _ = write!(out, " 0x{:02x},", b);
        }
        out.push('\n');
    }
    out.push_str("};\n");
    let _ = writeln!(out, "const unsigned int data_len = {};", payload.bytes.len());
    out
}
