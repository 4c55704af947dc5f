//! The ELF auxiliary vector placed on the initial stack.

use userbox::cpu::Endian;

/// Auxiliary vector keys, per the Linux process start-up ABI.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AuxKey {
    AT_NULL = 0,      /* end of vector */
    AT_IGNORE = 1,    /* entry should be ignored */
    AT_EXECFD = 2,    /* file descriptor of program */
    AT_PHDR = 3,      /* program headers for program */
    AT_PHENT = 4,     /* size of program header entry */
    AT_PHNUM = 5,     /* number of program headers */
    AT_PAGESZ = 6,    /* system page size */
    AT_BASE = 7,      /* base address of interpreter */
    AT_FLAGS = 8,     /* flags */
    AT_ENTRY = 9,     /* entry point of program */
    AT_NOTELF = 10,   /* program is not ELF */
    AT_UID = 11,      /* real uid */
    AT_EUID = 12,     /* effective uid */
    AT_GID = 13,      /* real gid */
    AT_EGID = 14,     /* effective gid */
    AT_PLATFORM = 15, /* string identifying CPU for optimizations */
    AT_HWCAP = 16,    /* arch dependent hints at CPU capabilities */
    AT_CLKTCK = 17,   /* frequency at which times() increments */
    AT_SECURE = 23,   /* secure mode boolean */
    AT_RANDOM = 25,   /* address of 16 random bytes */
    AT_EXECFN = 31,   /* filename of program */
}

/// Encode `(key, value)` pairs as the raw auxv blob, terminated by
/// `AT_NULL`. Each entry occupies two guest words in the given byte order.
#[must_use]
pub fn build(bsz: u8, byte_order: Endian, entries: &[(AuxKey, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity((entries.len() + 1) * 2 * usize::from(bsz));
    let mut word = |out: &mut Vec<u8>, value: u64| match (bsz, byte_order) {
        (4, Endian::Little) => out.extend_from_slice(&(value as u32).to_le_bytes()),
        (4, Endian::Big) => out.extend_from_slice(&(value as u32).to_be_bytes()),
        (_, Endian::Little) => out.extend_from_slice(&value.to_le_bytes()),
        (_, Endian::Big) => out.extend_from_slice(&value.to_be_bytes()),
    };
    for &(key, value) in entries {
        word(&mut out, key as u64);
        word(&mut out, value);
    }
    word(&mut out, AuxKey::AT_NULL as u64);
    word(&mut out, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_two_words_each_and_null_terminated() {
        let blob = build(8, Endian::Little, &[(AuxKey::AT_PAGESZ, 0x1000)]);
        assert_eq!(blob.len(), 32);
        assert_eq!(&blob[0..8], &6u64.to_le_bytes());
        assert_eq!(&blob[8..16], &0x1000u64.to_le_bytes());
        assert_eq!(&blob[16..32], &[0u8; 16]);
    }

    #[test]
    fn honors_word_size_and_byte_order() {
        let blob = build(4, Endian::Big, &[(AuxKey::AT_ENTRY, 0x400100)]);
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[0..4], &9u32.to_be_bytes());
        assert_eq!(&blob[4..8], &0x0040_0100u32.to_be_bytes());
    }
}
