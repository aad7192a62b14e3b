//! Modified UTF-8, the string encoding used on the wire.
//!
//! Identical to UTF-8 except that U+0000 is written as the two bytes
//! `C0 80`, and characters outside the BMP are written as a pair of
//! 3-byte-encoded UTF-16 surrogates instead of one 4-byte sequence.

/// Encode `s` as modified UTF-8.
pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(s));
    for ch in s.chars() {
        let c = ch as u32;
        match c {
            0x01..=0x7F => out.push(c as u8),
            0x00 | 0x80..=0x7FF => push_two(&mut out, c),
            0x800..=0xFFFF => push_three(&mut out, c),
            _ => {
                let v = c - 0x1_0000;
                push_three(&mut out, 0xD800 + (v >> 10));
                push_three(&mut out, 0xDC00 + (v & 0x3FF));
            }
        }
    }
    out
}

/// Number of bytes [`encode`] would produce for `s`.
pub fn encoded_len(s: &str) -> usize {
    s.chars()
        .map(|ch| match ch as u32 {
            0x01..=0x7F => 1,
            0x00 | 0x80..=0x7FF => 2,
            0x800..=0xFFFF => 3,
            _ => 6,
        })
        .sum()
}

/// Decode modified UTF-8 bytes.
///
/// Standard 4-byte UTF-8 sequences and raw NUL bytes are accepted as well.
/// Returns `None` for truncated sequences, bad continuation bytes, and
/// unpaired surrogates.
pub fn decode(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b < 0x80 {
            out.push(b as char);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b1 = continuation(bytes, i + 1)?;
            out.push(char::from_u32(((b as u32 & 0x1F) << 6) | b1)?);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let unit = three(bytes, i)?;
            i += 3;
            match unit {
                0xD800..=0xDBFF => {
                    let low = three(bytes, i)?;
                    if !(0xDC00..=0xDFFF).contains(&low) {
                        return None;
                    }
                    i += 3;
                    let c = 0x1_0000 + ((unit - 0xD800) << 10) + (low - 0xDC00);
                    out.push(char::from_u32(c)?);
                }
                0xDC00..=0xDFFF => return None,
                _ => out.push(char::from_u32(unit)?),
            }
        } else if b & 0xF8 == 0xF0 {
            let b1 = continuation(bytes, i + 1)?;
            let b2 = continuation(bytes, i + 2)?;
            let b3 = continuation(bytes, i + 3)?;
            let c = ((b as u32 & 0x07) << 18) | (b1 << 12) | (b2 << 6) | b3;
            out.push(char::from_u32(c)?);
            i += 4;
        } else {
            return None;
        }
    }
    Some(out)
}

fn push_two(out: &mut Vec<u8>, c: u32) {
    out.push(0xC0 | (c >> 6) as u8);
    out.push(0x80 | (c & 0x3F) as u8);
}

fn push_three(out: &mut Vec<u8>, c: u32) {
    out.push(0xE0 | (c >> 12) as u8);
    out.push(0x80 | ((c >> 6) & 0x3F) as u8);
    out.push(0x80 | (c & 0x3F) as u8);
}

fn continuation(bytes: &[u8], at: usize) -> Option<u32> {
    let b = *bytes.get(at)?;
    (b & 0xC0 == 0x80).then_some(b as u32 & 0x3F)
}

fn three(bytes: &[u8], at: usize) -> Option<u32> {
    let b = *bytes.get(at)?;
    if b & 0xF0 != 0xE0 {
        return None;
    }
    let b1 = continuation(bytes, at + 1)?;
    let b2 = continuation(bytes, at + 2)?;
    Some(((b as u32 & 0x0F) << 12) | (b1 << 6) | b2)
}
