//! Encoding and decoding of the 512-byte ustar header block.
//!
//! Field layout (byte offsets):
//!
//! ```text
//! name 0..100  mode 100..108  uid 108..116  gid 116..124  size 124..136
//! mtime 136..148  chksum 148..156  typeflag 156  magic 257..263
//! version 263..265  uname 265..297  gname 297..329  prefix 345..500
//! ```
//!
//! Numeric fields are zero-padded octal ASCII terminated by a NUL. The
//! checksum is the sum of all header bytes with the checksum field itself
//! counted as eight spaces, stored as six octal digits, a NUL and a space.

use std::borrow::Cow;
use std::ops::Range;
use std::str;

use crate::error::{Error, Result};
use crate::{EntryKind, EntryMetadata};

/// Size of a header block and the alignment unit of entry content.
pub const BLOCK_SIZE: usize = 512;

/// A raw header block.
pub type HeaderBlock = [u8; BLOCK_SIZE];

/// Maximum encoded length of the name field, in bytes.
pub const NAME_LEN: usize = 100;
/// Maximum encoded length of the prefix field, in bytes.
pub const PREFIX_LEN: usize = 155;
const OWNER_NAME_LEN: usize = 32;

const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CKSUM: Range<usize> = 148..156;
const TYPEFLAG: usize = 156;
const MAGIC: Range<usize> = 257..263;
const VERSION: Range<usize> = 263..265;
const UNAME: Range<usize> = 265..297;
const GNAME: Range<usize> = 297..329;
const PREFIX: Range<usize> = 345..500;

// Largest values representable by the 8- and 12-byte octal fields once the
// trailing NUL is accounted for.
const MAX_SHORT_OCTAL: u64 = 0o7_777_777;
const MAX_LONG_OCTAL: u64 = 0o77_777_777_777;

/// The result of decoding one header block.
#[derive(Debug, PartialEq, Eq)]
pub enum Block {
    /// An all-zero block, the first half of the end-of-archive marker.
    Terminator,
    /// A header describing an entry.
    Entry(DecodedHeader),
}

/// Metadata read out of a valid header block.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedHeader {
    /// Entry metadata. `uname`/`gname` fall back to the numeric ids.
    pub metadata: EntryMetadata,
    /// Size of the content that follows the header.
    pub size: u64,
    /// The verified checksum.
    pub checksum: u32,
}

/// Encode `metadata` into a header block announcing `size` content bytes.
///
/// Paths longer than the name field are split with [`split_path`], which may
/// truncate them. Directories then get a trailing `/` appended to their name
/// field when it has room for one.
/// Values wider than their field keep only their low-order digits; callers
/// that cannot trust their input should run [`check_encodable`] first.
pub fn encode(metadata: &EntryMetadata, size: u64) -> HeaderBlock {
    let mut block = [0u8; BLOCK_SIZE];

    let path = if metadata.kind.is_dir() {
        metadata.path.trim_end_matches('/')
    } else {
        metadata.path.as_str()
    };
    let (name, prefix) = split_path(path);
    let mut name = Cow::Borrowed(name);
    if metadata.kind.is_dir() && name.len() < NAME_LEN {
        name.to_mut().push('/');
    }
    block[NAME][..name.len()].copy_from_slice(name.as_bytes());
    block[PREFIX][..prefix.len()].copy_from_slice(prefix.as_bytes());

    octal_into(&mut block[MODE], u64::from(metadata.mode & 0o7777));
    octal_into(&mut block[UID], u64::from(metadata.uid));
    octal_into(&mut block[GID], u64::from(metadata.gid));
    octal_into(&mut block[SIZE], size);
    octal_into(&mut block[MTIME], metadata.mtime);
    block[TYPEFLAG] = metadata.kind.as_byte();
    block[MAGIC].copy_from_slice(b"ustar\0");
    block[VERSION].copy_from_slice(b"00");

    let uname = truncate_utf8(&metadata.uname, OWNER_NAME_LEN);
    block[UNAME][..uname.len()].copy_from_slice(uname.as_bytes());
    let gname = truncate_utf8(&metadata.gname, OWNER_NAME_LEN);
    block[GNAME][..gname.len()].copy_from_slice(gname.as_bytes());

    let cksum = checksum(&block);
    octal_into(&mut block[CKSUM.start..CKSUM.end - 1], u64::from(cksum));
    block[CKSUM.end - 1] = b' ';
    block
}

/// Check that every numeric value of an entry fits its header field.
pub fn check_encodable(metadata: &EntryMetadata, size: u64) -> Result<()> {
    let fields = [
        ("uid", u64::from(metadata.uid), MAX_SHORT_OCTAL),
        ("gid", u64::from(metadata.gid), MAX_SHORT_OCTAL),
        ("size", size, MAX_LONG_OCTAL),
        ("mtime", metadata.mtime, MAX_LONG_OCTAL),
    ];
    for (field, value, max) in fields {
        if value > max {
            return Err(Error::FieldTooLarge { field, value });
        }
    }
    Ok(())
}

/// Decode and validate a header block.
///
/// An all-zero block decodes to [`Block::Terminator`]. A block without the
/// `ustar` magic is [`Error::InvalidFormat`]; a block whose stored checksum
/// differs from the computed one is [`Error::InvalidChecksum`].
pub fn decode(block: &HeaderBlock) -> Result<Block> {
    if block.iter().all(|b| *b == 0) {
        return Ok(Block::Terminator);
    }
    if &block[MAGIC][..5] != b"ustar" {
        return Err(Error::invalid_format("missing ustar magic"));
    }

    let computed = checksum(block);
    let stored = parse_octal(&block[CKSUM]).and_then(|v| u32::try_from(v).ok());
    if stored != Some(computed) {
        return Err(Error::InvalidChecksum { stored, computed });
    }

    let name = field_str(&block[NAME], "name")?;
    let prefix = field_str(&block[PREFIX], "prefix")?;
    let mut path = if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    };
    if path.ends_with('/') {
        path.pop();
    }

    let uid = numeric(&block[UID], "uid")?;
    let gid = numeric(&block[GID], "gid")?;
    let uid = u32::try_from(uid).map_err(|_| Error::invalid_format("uid out of range"))?;
    let gid = u32::try_from(gid).map_err(|_| Error::invalid_format("gid out of range"))?;
    let uname = match field_str(&block[UNAME], "uname")? {
        "" => uid.to_string(),
        name => name.to_string(),
    };
    let gname = match field_str(&block[GNAME], "gname")? {
        "" => gid.to_string(),
        name => name.to_string(),
    };

    let metadata = EntryMetadata {
        kind: EntryKind::from_byte(block[TYPEFLAG]),
        path,
        mode: numeric(&block[MODE], "mode")? as u32,
        uid,
        gid,
        uname,
        gname,
        mtime: numeric(&block[MTIME], "mtime")?,
    };
    Ok(Block::Entry(DecodedHeader {
        metadata,
        size: numeric(&block[SIZE], "size")?,
        checksum: computed,
    }))
}

/// Split an archive path into its ustar `(name, prefix)` fields.
///
/// Paths of at most [`NAME_LEN`] bytes go entirely into `name`. Longer paths
/// are split at the last `/`: the final component becomes `name` and the rest
/// becomes `prefix`, each truncated to its field length without splitting a
/// UTF-8 code point. Truncation is silent, so pathological paths do not
/// survive a round trip unchanged.
pub fn split_path(path: &str) -> (&str, &str) {
    if path.len() <= NAME_LEN {
        return (path, "");
    }
    match path.rfind('/') {
        Some(pos) => (
            truncate_utf8(&path[pos + 1..], NAME_LEN),
            truncate_utf8(&path[..pos], PREFIX_LEN),
        ),
        None => (truncate_utf8(path, NAME_LEN), ""),
    }
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a character
/// boundary.
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Number of zero bytes that follow `size` content bytes to reach the next
/// block boundary.
pub fn padding_for(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - size % block) % block
}

fn checksum(block: &HeaderBlock) -> u32 {
    block[..CKSUM.start]
        .iter()
        .chain(&block[CKSUM.end..])
        .map(|b| u32::from(*b))
        .sum::<u32>()
        + 8 * u32::from(b' ')
}

fn octal_into(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let mut value = value;
    for slot in field[..digits].iter_mut().rev() {
        *slot = b'0' + (value & 0o7) as u8;
        value >>= 3;
    }
    field[digits] = 0;
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let mut rest = field;
    while let [b' ', tail @ ..] = rest {
        rest = tail;
    }
    let mut value = 0u64;
    while let [digit @ b'0'..=b'7', tail @ ..] = rest {
        value = value
            .checked_mul(8)?
            .checked_add(u64::from(*digit - b'0'))?;
        rest = tail;
    }
    if rest.iter().all(|b| *b == 0 || *b == b' ') {
        Some(value)
    } else {
        None
    }
}

fn numeric(field: &[u8], what: &str) -> Result<u64> {
    parse_octal(field).ok_or_else(|| {
        Error::invalid_format(format!(
            "invalid octal {} field: {:?}",
            what,
            String::from_utf8_lossy(field)
        ))
    })
}

fn field_str<'a>(field: &'a [u8], what: &str) -> Result<&'a str> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    str::from_utf8(&field[..end])
        .map_err(|_| Error::invalid_format(format!("invalid UTF-8 in {} field", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EntryMetadata {
        EntryMetadata::file("dir/hello.txt")
            .with_mode(0o100644)
            .with_owner(1000, 100)
            .with_names("alice", "users")
            .with_mtime(1_600_000_000)
    }

    fn decode_entry(block: &HeaderBlock) -> DecodedHeader {
        match decode(block).unwrap() {
            Block::Entry(header) => header,
            Block::Terminator => panic!("unexpected terminator"),
        }
    }

    #[test]
    fn fields_land_at_fixed_offsets() {
        let block = encode(&sample(), 13);
        assert_eq!(&block[0..14], b"dir/hello.txt\0");
        assert_eq!(&block[100..108], b"0000644\0");
        assert_eq!(&block[108..116], b"0001750\0");
        assert_eq!(&block[116..124], b"0000144\0");
        assert_eq!(&block[124..136], b"00000000015\0");
        assert_eq!(&block[136..148], b"13727410000\0");
        assert_eq!(block[156], b'0');
        assert_eq!(&block[257..263], b"ustar\0");
        assert_eq!(&block[263..265], b"00");
        assert_eq!(&block[265..271], b"alice\0");
        assert_eq!(&block[297..303], b"users\0");
        assert!(block[345..500].iter().all(|b| *b == 0));
    }

    #[test]
    fn checksum_is_six_digits_nul_space() {
        let block = encode(&sample(), 13);
        let field = &block[148..156];
        assert!(field[..6].iter().all(|b| (b'0'..=b'7').contains(b)));
        assert_eq!(field[6], 0);
        assert_eq!(field[7], b' ');

        let expected: u32 = block[..148]
            .iter()
            .chain(&block[156..])
            .map(|b| u32::from(*b))
            .sum::<u32>()
            + 256;
        assert_eq!(parse_octal(field), Some(u64::from(expected)));
    }

    #[test]
    fn round_trips_metadata() {
        let header = decode_entry(&encode(&sample(), 13));
        assert_eq!(header.size, 13);
        assert_eq!(header.metadata, sample().with_mode(0o644));
    }

    #[test]
    fn directories_carry_a_trailing_slash() {
        let block = encode(&EntryMetadata::directory("mydir"), 0);
        assert_eq!(&block[0..7], b"mydir/\0");
        assert_eq!(block[156], b'5');

        let header = decode_entry(&block);
        assert_eq!(header.metadata.path, "mydir");
        assert_eq!(header.metadata.kind, EntryKind::Directory);
        assert_eq!(header.size, 0);
    }

    #[test]
    fn empty_owner_names_fall_back_to_ids() {
        let meta = EntryMetadata::file("a").with_owner(42, 7);
        let header = decode_entry(&encode(&meta, 0));
        assert_eq!(header.metadata.uname, "42");
        assert_eq!(header.metadata.gname, "7");
    }

    #[test]
    fn zero_block_is_terminator() {
        assert_eq!(decode(&[0; BLOCK_SIZE]).unwrap(), Block::Terminator);
    }

    #[test]
    fn bad_magic_is_invalid_format() {
        let mut block = encode(&sample(), 0);
        block[257] ^= 0xff;
        assert!(matches!(decode(&block), Err(Error::InvalidFormat(_))));
    }

    #[test]
    fn any_checksum_byte_flip_is_detected() {
        let block = encode(&sample(), 0);
        for i in 148..156 {
            let mut corrupt = block;
            corrupt[i] ^= 0xff;
            assert!(
                matches!(decode(&corrupt), Err(Error::InvalidChecksum { .. })),
                "flip at offset {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn content_byte_flip_breaks_checksum() {
        let mut block = encode(&sample(), 0);
        block[3] = b'X';
        match decode(&block) {
            Err(Error::InvalidChecksum { stored, computed }) => {
                assert!(stored.is_some());
                assert_ne!(stored, Some(computed));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mode_is_masked_to_twelve_bits() {
        let meta = EntryMetadata::file("x").with_mode(0o170_4755);
        let header = decode_entry(&encode(&meta, 0));
        assert_eq!(header.metadata.mode, 0o4755);
    }

    #[test]
    fn encodable_limits() {
        let meta = EntryMetadata::file("x");
        assert!(check_encodable(&meta, MAX_LONG_OCTAL).is_ok());
        assert!(matches!(
            check_encodable(&meta, MAX_LONG_OCTAL + 1),
            Err(Error::FieldTooLarge { field: "size", .. })
        ));
        let meta = meta.with_owner(MAX_SHORT_OCTAL as u32 + 1, 0);
        assert!(matches!(
            check_encodable(&meta, 0),
            Err(Error::FieldTooLarge { field: "uid", .. })
        ));
    }

    #[test]
    fn short_paths_are_not_split() {
        let path = "a".repeat(100);
        assert_eq!(split_path(&path), (path.as_str(), ""));
    }

    #[test]
    fn long_paths_split_on_last_slash() {
        let dir = "d".repeat(80);
        let path = format!("{}/{}", dir, "f".repeat(40));
        let (name, prefix) = split_path(&path);
        assert_eq!(name, "f".repeat(40));
        assert_eq!(prefix, dir);

        let header = decode_entry(&encode(&EntryMetadata::file(path.clone()), 0));
        assert_eq!(header.metadata.path, path);
    }

    #[test]
    fn truncation_respects_code_points() {
        // 'é' is two bytes, so 51 of them straddle the 100 byte limit.
        let name = "é".repeat(51);
        let dir = "ü".repeat(80);
        let path = format!("{}/{}", dir, name);
        let (n, p) = split_path(&path);
        assert_eq!(n.len(), 100);
        assert_eq!(n, "é".repeat(50));
        assert_eq!(p.len(), 154);
        assert_eq!(p, "ü".repeat(77));

        let header = decode_entry(&encode(&EntryMetadata::file(path.clone()), 0));
        assert_ne!(header.metadata.path, path);
        assert_eq!(header.metadata.path, format!("{}/{}", p, n));
    }

    #[test]
    fn long_directory_paths_round_trip() {
        let path = format!("{}/{}", "p".repeat(60), "q".repeat(60));
        let header = decode_entry(&encode(&EntryMetadata::directory(path.clone()), 0));
        assert_eq!(header.metadata.path, path);
        assert!(header.metadata.kind.is_dir());

        // Longer than the prefix field alone, split on the last component.
        let path = format!("{}/{}", "p".repeat(150), "q".repeat(50));
        let block = encode(&EntryMetadata::directory(path.clone()), 0);
        assert_eq!(&block[0..52], format!("{}/\0", "q".repeat(50)).as_bytes());
        let header = decode_entry(&block);
        assert_eq!(header.metadata.path, path);

        let child = format!("{}/f", path);
        let header = decode_entry(&encode(&EntryMetadata::file(child.clone()), 0));
        assert_eq!(header.metadata.path, child);

        // A trailing slash given by the caller is not a split point.
        let header = decode_entry(&encode(&EntryMetadata::directory(format!("{}/", path)), 0));
        assert_eq!(header.metadata.path, path);
    }

    #[test]
    fn padding_boundaries() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(13), 499);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
    }

    #[test]
    fn octal_parsing_is_strict() {
        assert_eq!(parse_octal(b"0000644\0"), Some(0o644));
        assert_eq!(parse_octal(b"  644 \0\0"), Some(0o644));
        assert_eq!(parse_octal(b"\0\0\0\0"), Some(0));
        assert_eq!(parse_octal(b"0006x4\0 "), None);
        assert_eq!(parse_octal(b"000644\0\xdf"), None);
    }
}
