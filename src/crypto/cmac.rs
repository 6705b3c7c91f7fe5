//! AES-128-CMAC (RFC 4493).
//!
//! The save container header is authenticated with a CMAC keyed by the
//! console's device-unique save MAC key. The MAC covers the `FsLayout`
//! record, which in turn embeds a SHA-256 of the rest of the header, so a
//! single 16-byte tag protects every master hash and bitmap in the header.

use super::aes::{Aes128, Block, xor_into};

const RB: u8 = 0x87;

// Left-shift a 128-bit big-endian value by one bit, folding the carry back
// in with Rb.
fn double(block: &Block) -> Block {
    let mut out = [0u8; 16];
    let mut carry = 0u8;
    for i in (0..16).rev() {
        out[i] = (block[i] << 1) | carry;
        carry = block[i] >> 7;
    }
    if block[0] & 0x80 != 0 {
        out[15] ^= RB;
    }
    out
}

/// Compute the AES-CMAC of `data` under `key`.
pub fn aes_cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let cipher = Aes128::new(key);

    let mut l = [0u8; 16];
    cipher.encrypt_block(&mut l);
    let k1 = double(&l);
    let k2 = double(&k1);

    // The final block is whichever chunk is left once all but one are
    // chained; an empty message still has one (fully padded) block.
    let block_count = data.len().div_ceil(16).max(1);
    let complete = !data.is_empty() && data.len() % 16 == 0;

    let mut state = [0u8; 16];
    for chunk in data.chunks(16).take(block_count - 1) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        xor_into(&mut state, &block);
        cipher.encrypt_block(&mut state);
    }

    let tail = &data[(block_count - 1) * 16..];
    let mut last = [0u8; 16];
    last[..tail.len()].copy_from_slice(tail);
    if complete {
        xor_into(&mut last, &k1);
    } else {
        last[tail.len()] = 0x80;
        xor_into(&mut last, &k2);
    }
    xor_into(&mut state, &last);
    cipher.encrypt_block(&mut state);
    state
}
