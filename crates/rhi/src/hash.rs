//! Hashing used for descriptor names and shader cache keys.
//!
//! Descriptor lookups key on a 32-bit FNV-1a hash of the name so pass code
//! can resolve `"u_MVP"` with a binary search. Shader identity uses the
//! 64-bit variant over source text and defines.

/// 32-bit hash of a descriptor name.
pub type NameHash = u32;

const FNV32_OFFSET: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;
const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a, 32 bit. Usable in const context so names can be hashed at
/// compile time.
pub const fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
        i += 1;
    }
    hash
}

/// FNV-1a, 64 bit.
pub const fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV64_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV64_PRIME);
        i += 1;
    }
    hash
}

/// Hash of a descriptor name as stored in a descriptor table.
pub const fn name_hash(name: &str) -> NameHash {
    fnv1a32(name.as_bytes())
}

/// Cache key of a shader: the source hash XOR the hash of every define.
pub fn program_key<S: AsRef<str>>(source: &str, defines: &[S]) -> u64 {
    defines
        .iter()
        .fold(fnv1a64(source.as_bytes()), |key, define| {
            key ^ fnv1a64(define.as_ref().as_bytes())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_reference_values() {
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_fnv1a64_reference_values() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_name_hash_is_const() {
        const MVP: NameHash = name_hash("u_MVP");
        assert_eq!(MVP, fnv1a32(b"u_MVP"));
    }

    #[test]
    fn test_known_collision() {
        // FNV-1a 32 maps both words to 0x5e4daa9d.
        assert_eq!(name_hash("costarring"), name_hash("liquid"));
        assert_eq!(name_hash("costarring"), 0x5e4daa9d);
    }

    #[test]
    fn test_program_key_depends_on_defines() {
        let no_defines: [&str; 0] = [];
        let base = program_key("void main() {}", &no_defines);
        let shadow = program_key("void main() {}", &["SHADOWS"]);
        let shadow_again = program_key("void main() {}", &["SHADOWS"]);
        assert_ne!(base, shadow);
        assert_eq!(shadow, shadow_again);
    }
}
