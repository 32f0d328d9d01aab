//! Minimal LZO1X decompressor.
//!
//! UBIFS compresses data blocks with LZO1X-1; only decompression is needed
//! here and no crate in our dependency set provides it, so the byte-oriented
//! decoder is implemented directly. The stream grammar: literal runs, then
//! matches of four distance classes (M1..M4), each instruction carrying up to
//! two trailing literals in its low bits. The stream ends with the M4 marker
//! `0x11 0x00 0x00`.

#[derive(Debug, PartialEq, Eq)]
pub enum LzoError {
    /// Input exhausted mid-instruction.
    InputOverrun,
    /// Output would exceed the caller's size limit.
    OutputOverrun,
    /// A match references data before the start of the output.
    BadMatchDistance,
    /// Trailing bytes after the end marker.
    TrailingGarbage,
}

impl std::fmt::Display for LzoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LzoError::InputOverrun => write!(f, "compressed stream truncated"),
            LzoError::OutputOverrun => write!(f, "output exceeds declared size"),
            LzoError::BadMatchDistance => write!(f, "match distance before stream start"),
            LzoError::TrailingGarbage => write!(f, "data after end-of-stream marker"),
        }
    }
}

impl std::error::Error for LzoError {}

struct Decoder<'a> {
    src: &'a [u8],
    ip: usize,
    out: Vec<u8>,
    max_out: usize,
}

impl<'a> Decoder<'a> {
    fn byte(&mut self) -> Result<u8, LzoError> {
        let b = *self.src.get(self.ip).ok_or(LzoError::InputOverrun)?;
        self.ip += 1;
        Ok(b)
    }

    fn le16(&mut self) -> Result<usize, LzoError> {
        let lo = self.byte()? as usize;
        let hi = self.byte()? as usize;
        Ok(lo | (hi << 8))
    }

    /// Length continuation: a zero byte adds 255, the final non-zero byte is
    /// added on top of `base`.
    fn extended_len(&mut self, base: usize) -> Result<usize, LzoError> {
        let mut len = base;
        loop {
            let b = self.byte()?;
            if b == 0 {
                len += 255;
            } else {
                return Ok(len + b as usize);
            }
        }
    }

    fn literals(&mut self, count: usize) -> Result<(), LzoError> {
        if self.ip + count > self.src.len() {
            return Err(LzoError::InputOverrun);
        }
        if self.out.len() + count > self.max_out {
            return Err(LzoError::OutputOverrun);
        }
        self.out.extend_from_slice(&self.src[self.ip..self.ip + count]);
        self.ip += count;
        Ok(())
    }

    /// Copy `count` bytes from `dist` back in the output. Overlapping copies
    /// are the normal case (run-length encoding), so copy byte by byte.
    fn copy_match(&mut self, dist: usize, count: usize) -> Result<(), LzoError> {
        if dist == 0 || dist > self.out.len() {
            return Err(LzoError::BadMatchDistance);
        }
        if self.out.len() + count > self.max_out {
            return Err(LzoError::OutputOverrun);
        }
        let mut pos = self.out.len() - dist;
        for _ in 0..count {
            let b = self.out[pos];
            self.out.push(b);
            pos += 1;
        }
        Ok(())
    }
}

/// Decompress an LZO1X stream into at most `max_out` bytes.
pub fn decompress(src: &[u8], max_out: usize) -> Result<Vec<u8>, LzoError> {
    let mut d = Decoder {
        src,
        ip: 0,
        out: Vec::with_capacity(max_out),
        max_out,
    };

    // Trailing-literal state carried from the previous instruction.
    let mut state: usize;

    let first = d.byte()?;
    if first > 17 {
        // Initial literal run encoded directly in the first byte.
        let count = first as usize - 17;
        d.literals(count)?;
        state = count.min(4);
    } else {
        d.ip = 0;
        state = 0;
    }

    loop {
        let t = if state == 0 {
            let t = d.byte()? as usize;
            if t < 16 {
                // Literal run of 3 + t bytes (t == 0 extends).
                let count = if t == 0 { d.extended_len(18)? } else { t + 3 };
                d.literals(count)?;
                state = 4;
                continue;
            }
            t
        } else {
            let t = d.byte()? as usize;
            if t < 16 {
                // After literals a low instruction byte is an M1 match:
                // distance 2049..=3072, length 3.
                if state == 4 {
                    let dist = 2049 + (t >> 2) + (d.byte()? as usize) * 4;
                    d.copy_match(dist, 3)?;
                } else {
                    // Distance 1..=1024, length 2.
                    let dist = 1 + (t >> 2) + (d.byte()? as usize) * 4;
                    d.copy_match(dist, 2)?;
                }
                state = t & 3;
                if state > 0 {
                    d.literals(state)?;
                }
                continue;
            }
            t
        };

        // Match instructions. Each carries the count of trailing literals
        // (0..=3) in the low bits of its instruction byte (M1/M2) or of its
        // distance pair (M3/M4).
        let next;
        if t >= 64 {
            // M2: distance 1..=2048, length 3..=8.
            let dist = 1 + ((t >> 2) & 7) + (d.byte()? as usize) * 8;
            d.copy_match(dist, (t >> 5) + 1)?;
            next = t & 3;
        } else if t >= 32 {
            // M3: distance 1..=16384.
            let len = if t & 31 == 0 {
                d.extended_len(33)?
            } else {
                (t & 31) + 2
            };
            let pair = d.le16()?;
            let dist = 1 + (pair >> 2);
            d.copy_match(dist, len)?;
            next = pair & 3;
        } else {
            // M4: distance 16385..=49151, or the end-of-stream marker.
            let high = (t & 8) << 11;
            let len = if t & 7 == 0 {
                d.extended_len(9)?
            } else {
                (t & 7) + 2
            };
            let pair = d.le16()?;
            let dist = high + (pair >> 2);
            if dist == 0 {
                // End marker (0x11 0x00 0x00).
                if d.ip != d.src.len() {
                    return Err(LzoError::TrailingGarbage);
                }
                return Ok(d.out);
            }
            d.copy_match(dist + 16384, len)?;
            next = pair & 3;
        }

        state = next;
        if state > 0 {
            d.literals(state)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_literal_stream() {
        // 5 literals ("hello") then the end marker.
        let src = [22, b'h', b'e', b'l', b'l', b'o', 0x11, 0x00, 0x00];
        assert_eq!(decompress(&src, 64).unwrap(), b"hello");
    }

    #[test]
    fn short_match_expands_run() {
        // One literal 'a', then an M2 match: dist 1, length 7, then the end
        // marker. Expands to eight 'a's.
        let src = [18, b'a', 0xC0, 0x00, 0x11, 0x00, 0x00];
        assert_eq!(decompress(&src, 64).unwrap(), b"aaaaaaaa");
    }

    #[test]
    fn truncated_stream_errors() {
        let src = [22, b'h', b'e'];
        assert_eq!(decompress(&src, 64), Err(LzoError::InputOverrun));
    }

    #[test]
    fn output_limit_enforced() {
        let src = [22, b'h', b'e', b'l', b'l', b'o', 0x11, 0x00, 0x00];
        assert_eq!(decompress(&src, 3), Err(LzoError::OutputOverrun));
    }

    #[test]
    fn empty_stream_errors() {
        assert_eq!(decompress(&[], 16), Err(LzoError::InputOverrun));
    }
}
