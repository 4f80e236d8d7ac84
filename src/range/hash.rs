//! 32-bit key hashes for range routing.
//!
//! The hash function is a cluster-wide agreement published by the master
//! under `#/keyhash`; every member must resolve the same name to the same
//! function.

pub const DEFAULT_KEYHASH: &str = "fnv1a";

pub struct KeyHash {
    name: &'static str,
    func: fn(&[u8]) -> u32,
}

impl KeyHash {
    pub fn hash(&self, key: &str) -> u32 {
        (self.func)(key.as_bytes())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

static FNV1A: KeyHash = KeyHash {
    name: "fnv1a",
    func: fnv1a32,
};
static FNV1: KeyHash = KeyHash {
    name: "fnv1",
    func: fnv1_32,
};
static ADLER32: KeyHash = KeyHash {
    name: "adler32",
    func: adler32,
};

pub fn get_keyhash(name: &str) -> Option<&'static KeyHash> {
    match name {
        "fnv1a" => Some(&FNV1A),
        "fnv1" => Some(&FNV1),
        "adler32" => Some(&ADLER32),
        _ => None,
    }
}

const FNV32_OFFSET: u32 = 0x811c9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

fn fnv1a32(data: &[u8]) -> u32 {
    let mut h = FNV32_OFFSET;
    for &b in data {
        h ^= b as u32;
        h = h.wrapping_mul(FNV32_PRIME);
    }

    h
}

fn fnv1_32(data: &[u8]) -> u32 {
    let mut h = FNV32_OFFSET;
    for &b in data {
        h = h.wrapping_mul(FNV32_PRIME);
        h ^= b as u32;
    }

    h
}

const ADLER_MOD: u32 = 65521;

fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + byte as u32) % ADLER_MOD;
        b = (b + a) % ADLER_MOD;
    }

    (b << 16) | a
}
