//! Byte-stream framing and receiver-format auto-detection.
//!
//! Ground: rs1090's `source::beast::next_msg` (escape handling for Beast
//! framing) generalized to the mlat-client's other wire formats: the
//! Kinetic SBS DLE/STX byte-stuffed stream and the AVR-MLAT text format.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Beast,
    Radarcape,
    Sbs,
    Avr,
    AvrMlat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectError {
    /// A recognizable-but-unusable framing (AVR without timestamps).
    AvrUnsupported,
    /// No framing recognized within the scan window.
    NoMatch,
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::AvrUnsupported => write!(
                f,
                "input looks like plain AVR (no timestamps); this format cannot be used for MLAT"
            ),
            DetectError::NoMatch => {
                write!(f, "could not detect input format in first 512 bytes")
            }
        }
    }
}

impl std::error::Error for DetectError {}

const SCAN_WINDOW: usize = 512;

/// Scan up to the first 512 bytes of a fresh connection for a recognizable
/// framing. Returns the detected mode and the offset of its first byte.
pub fn detect(buf: &[u8]) -> Result<(Mode, usize), DetectError> {
    let window = &buf[..buf.len().min(SCAN_WINDOW)];

    for i in 0..window.len() {
        if window[i] == 0x1A {
            let escaped = i > 0 && window[i - 1] == 0x1A;
            if !escaped {
                if let Some(&next) = window.get(i + 1) {
                    if matches!(next, b'1' | b'2' | b'3' | b'4') {
                        return Ok((Mode::Beast, i));
                    }
                }
            }
        }

        if window[i] == 0x02 && i > 0 && window[i - 1] == 0x10 {
            let escaped = i >= 2 && window[i - 2] == 0x10;
            if !escaped {
                return Ok((Mode::Sbs, i - 1));
            }
        }

        if window[i] == b';' {
            for (sep, seplen) in [(&b"\n\r"[..], 2), (&b"\r\n"[..], 2), (&b"\n"[..], 1), (&b"\r"[..], 1)]
            {
                let marker_at = i + 1 + seplen;
                if window.get(i + 1..marker_at) == Some(sep) {
                    if let Some(&marker) = window.get(marker_at) {
                        if matches!(marker, b'@' | b'%' | b'<') {
                            return Ok((Mode::AvrMlat, i));
                        }
                        if matches!(marker, b'*' | b'.') {
                            return Err(DetectError::AvrUnsupported);
                        }
                    }
                }
            }
        }
    }

    Err(DetectError::NoMatch)
}

/// A single raw frame pulled out of the byte stream, before Mode S field
/// extraction.
pub struct RawFrame {
    pub timestamp: u64,
    pub payload: Vec<u8>,
    /// True if the timestamp is the all-ones "already MLAT'd upstream"
    /// magic value (seen when chaining receivers with `--forward-mlat`).
    pub mlat_magic: bool,
}

/// Pull as many complete frames as currently available out of `buf`,
/// leaving any trailing partial frame as residual.
pub fn extract_frames(mode: Mode, buf: &mut Vec<u8>) -> Vec<RawFrame> {
    match mode {
        Mode::Beast | Mode::Radarcape => extract_beast(buf),
        Mode::Sbs => extract_sbs(buf),
        Mode::AvrMlat => extract_avrmlat(buf),
        Mode::Avr => Vec::new(),
    }
}

fn extract_one_beast(buf: &[u8]) -> Option<(usize, Vec<u8>, u8)> {
    let msg_type = *buf.get(1)?;
    let msg_size = match msg_type {
        b'1' => 11,
        b'2' => 16,
        b'3' => 23,
        b'4' => 23,
        _ => return None,
    };

    let mut out = Vec::with_capacity(msg_size);
    out.push(0x1A);
    out.push(msg_type);
    let mut i = 2;
    loop {
        if out.len() == msg_size {
            return Some((i, out, msg_type));
        }
        let b = *buf.get(i)?;
        if b == 0x1A {
            match buf.get(i + 1) {
                Some(0x1A) => {
                    out.push(0x1A);
                    i += 2;
                }
                _ => return None, // the next frame starts here: this one is short/corrupt
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
}

fn extract_beast(buf: &mut Vec<u8>) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = buf.iter().position(|&b| b == 0x1A) else {
            buf.clear();
            break;
        };
        if start > 0 {
            buf.drain(..start);
        }
        if buf.len() < 2 {
            break;
        }

        match extract_one_beast(buf) {
            Some((consumed, payload, msg_type)) => {
                buf.drain(..consumed);
                if msg_type != b'4' {
                    let mut ts_bytes = [0u8; 8];
                    ts_bytes[2..8].copy_from_slice(&payload[2..8]);
                    let timestamp = u64::from_be_bytes(ts_bytes);
                    let mlat_magic = timestamp & 0xFFFF_FFFF_FFFF == 0xFFFF_FFFF_FFFF;
                    frames.push(RawFrame {
                        timestamp,
                        payload: payload[9..].to_vec(),
                        mlat_magic,
                    });
                }
            }
            None => {
                if buf.len() >= 23 {
                    buf.drain(..1);
                } else {
                    break;
                }
            }
        }
    }
    frames
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn extract_sbs(buf: &mut Vec<u8>) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = find_subslice(buf, &[0x10, 0x02]) else {
            if buf.len() > 1 {
                let keep_from = buf.len() - 1;
                buf.drain(..keep_from);
            }
            break;
        };
        if start > 0 {
            buf.drain(..start);
        }

        let mut out = Vec::new();
        let mut i = 2;
        let mut end = None;
        while i < buf.len() {
            if buf[i] == 0x10 {
                match buf.get(i + 1) {
                    Some(0x10) => {
                        out.push(0x10);
                        i += 2;
                    }
                    Some(0x03) => {
                        end = Some(i + 2);
                        break;
                    }
                    _ => i += 1,
                }
            } else {
                out.push(buf[i]);
                i += 1;
            }
        }

        let Some(consumed) = end else { break };
        buf.drain(..consumed);

        if out.len() < 8 {
            continue;
        }
        let mut ts_bytes = [0u8; 8];
        ts_bytes[2..8].copy_from_slice(&out[1..7]);
        let timestamp = u64::from_be_bytes(ts_bytes);
        let payload = out[8..].to_vec();
        if matches!(payload.len(), 2 | 7 | 14) {
            frames.push(RawFrame {
                timestamp,
                payload,
                mlat_magic: false,
            });
        }
    }
    frames
}

fn extract_avrmlat(buf: &mut Vec<u8>) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let Some(start) = buf.iter().position(|&b| matches!(b, b'@' | b'%' | b'<')) else {
            if buf.len() > 1 {
                let keep_from = buf.len() - 1;
                buf.drain(..keep_from);
            }
            break;
        };
        if start > 0 {
            buf.drain(..start);
        }

        let Some(term) = buf.iter().position(|&b| b == b';') else {
            break;
        };

        let body = buf[1..term].to_vec();
        let consumed = term + 1;

        if body.len() > 12 {
            if let (Ok(ts_hex), frame_hex) = (
                std::str::from_utf8(&body[..12]).map_err(|_| ()),
                std::str::from_utf8(&body[12..]),
            ) {
                if let (Ok(timestamp), Ok(frame_hex)) =
                    (u64::from_str_radix(ts_hex, 16), frame_hex)
                {
                    if let Ok(payload) = hex::decode(frame_hex) {
                        if matches!(payload.len(), 2 | 7 | 14) {
                            frames.push(RawFrame {
                                timestamp,
                                payload,
                                mlat_magic: false,
                            });
                        }
                    }
                }
            }
        }

        buf.drain(..consumed);
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_beast() {
        let mut buf = vec![0u8; 4];
        buf.push(0x1A);
        buf.push(b'3');
        assert_eq!(detect(&buf), Ok((Mode::Beast, 4)));
    }

    #[test]
    fn detect_sbs() {
        let buf = vec![0xAA, 0x10, 0x02, 0x00];
        assert_eq!(detect(&buf), Ok((Mode::Sbs, 1)));
    }

    #[test]
    fn detect_avrmlat() {
        let buf = b";\n@0000".to_vec();
        assert_eq!(detect(&buf), Ok((Mode::AvrMlat, 0)));
    }

    #[test]
    fn detect_avr_is_rejected() {
        let buf = b";\n*0000".to_vec();
        assert_eq!(detect(&buf), Err(DetectError::AvrUnsupported));
    }

    #[test]
    fn detect_no_match_over_zeroes() {
        let buf = vec![0u8; 512];
        assert_eq!(detect(&buf), Err(DetectError::NoMatch));
    }

    #[test]
    fn beast_roundtrip_extracts_frame() {
        let mut buf = vec![0x1A, b'2'];
        buf.extend_from_slice(&[0u8; 6]); // timestamp
        buf.push(0xFF); // signal
        buf.extend_from_slice(&[0xAB; 7]); // 7-byte payload
        let frames = extract_beast(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![0xAB; 7]);
        assert!(buf.is_empty());
    }

    #[test]
    fn beast_unescapes_doubled_marker() {
        let mut buf = vec![0x1A, b'2'];
        buf.extend_from_slice(&[0u8; 6]);
        buf.push(0xFF);
        let mut payload = vec![0x1A, 0x1A];
        payload.extend_from_slice(&[0x00; 6]);
        buf.extend_from_slice(&payload);
        let frames = extract_beast(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload[0], 0x1A);
    }
}
