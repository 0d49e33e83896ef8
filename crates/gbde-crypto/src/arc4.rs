//! ARC4 keystream used to obfuscate lock metadata.
//!
//! Never used for payload data. A fresh state is seeded for every lock slot
//! from passphrase-derived key material, so the stream only ever covers a few
//! dozen bytes.

use zeroize::Zeroize;

pub struct Arc4 {
    sbox: [u8; 256],
    i: u8,
    j: u8,
}

impl Arc4 {
    /// Key schedule. Keys longer than 256 bytes are folded in with XOR.
    pub fn seed(key: &[u8]) -> Self {
        let mut k = [0u8; 256];
        for (n, b) in key.iter().enumerate() {
            k[n % 256] ^= *b;
        }
        let klen = key.len().clamp(1, 256);

        let mut sbox = [0u8; 256];
        for (n, s) in sbox.iter_mut().enumerate() {
            *s = n as u8;
        }
        let mut j: u8 = 0;
        for n in 0..256 {
            j = j.wrapping_add(sbox[n]).wrapping_add(k[n % klen]);
            sbox.swap(n, j as usize);
        }
        k.zeroize();

        Arc4 { sbox, i: 0, j: 0 }
    }

    /// Next keystream byte.
    pub fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.sbox[self.i as usize]);
        self.sbox.swap(self.i as usize, self.j as usize);
        let t = self.sbox[self.i as usize].wrapping_add(self.sbox[self.j as usize]);
        self.sbox[t as usize]
    }

    /// Fill `buf` with keystream.
    pub fn fill(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.next_byte();
        }
    }

    /// XOR keystream into `buf` (encrypt and decrypt are the same operation).
    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

impl Drop for Arc4 {
    fn drop(&mut self) {
        self.sbox.zeroize();
        self.i = 0;
        self.j = 0;
    }
}

impl std::fmt::Debug for Arc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arc4").field("sbox", &"[REDACTED]").finish()
    }
}
