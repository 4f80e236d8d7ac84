//! 64-bit key hashes for ring routing. A node's id is the hash of its
//! listen address; keys route to the successor of their hash.

pub const DEFAULT_KEYHASH: &str = "fnv1a";

pub struct KeyHash {
    name: &'static str,
    func: fn(&[u8]) -> u64,
}

impl KeyHash {
    pub fn hash(&self, key: &str) -> u64 {
        (self.func)(key.as_bytes())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

static FNV1A: KeyHash = KeyHash {
    name: "fnv1a",
    func: fnv1a64,
};
static FNV1: KeyHash = KeyHash {
    name: "fnv1",
    func: fnv1_64,
};

pub fn get_keyhash(name: &str) -> Option<&'static KeyHash> {
    match name {
        "fnv1a" => Some(&FNV1A),
        "fnv1" => Some(&FNV1),
        _ => None,
    }
}

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(data: &[u8]) -> u64 {
    let mut h = FNV64_OFFSET;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(FNV64_PRIME);
    }

    h
}

fn fnv1_64(data: &[u8]) -> u64 {
    let mut h = FNV64_OFFSET;
    for &b in data {
        h = h.wrapping_mul(FNV64_PRIME);
        h ^= b as u64;
    }

    h
}
