//! Write-side and read-side framing for the two compression modes the
//! server may negotiate during handshake (spec §4.D).
//!
//! `none` and `zlib` share the newline-delimited write path and the
//! newline-delimited read path; `zlib2` additionally length-prefixes
//! each compressed block on write, and on read expects the same
//! length-prefixed blocks. Grounded in
//! `examples/original_source/mlat/client/jsonclient.py`'s
//! `fill_uncompressed`/`fill_zlib`/`consume_readbuf_uncompressed`/
//! `consume_readbuf_zlib`.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::ServerError;

/// Trailing bytes a `Z_SYNC_FLUSH` always produces; stripped before
/// framing on write, reattached before decompressing on read.
const SYNC_FLUSH_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];
const ZLIB_BLOCK_THRESHOLD: usize = 32768;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression2 {
    None,
    Zlib,
    Zlib2,
}

/// Joins queued lines with `\n`, ready for an uncompressed write.
pub fn fill_uncompressed(lines: &mut Vec<String>, writebuf: &mut Vec<u8>) {
    if lines.is_empty() {
        return;
    }
    writebuf.extend_from_slice(lines.join("\n").as_bytes());
    writebuf.push(b'\n');
    lines.clear();
}

/// Compresses queued lines, flushing (and length-prefixing) whenever
/// the pending block reaches 32768 bytes.
pub fn fill_zlib(
    lines: &mut Vec<String>,
    compressor: &mut Compress,
    writebuf: &mut Vec<u8>,
) -> Result<(), ServerError> {
    if lines.is_empty() {
        return Ok(());
    }

    let mut data = Vec::new();
    for line in lines.drain(..) {
        let mut input = line.into_bytes();
        input.push(b'\n');
        compress_into(compressor, &input, &mut data, FlushCompress::None)?;

        if data.len() >= ZLIB_BLOCK_THRESHOLD {
            flush_block(compressor, &mut data, writebuf)?;
        }
    }

    if !data.is_empty() {
        flush_block(compressor, &mut data, writebuf)?;
    }

    Ok(())
}

fn compress_into(
    compressor: &mut Compress,
    input: &[u8],
    data: &mut Vec<u8>,
    flush: FlushCompress,
) -> Result<(), ServerError> {
    let mut chunk = [0u8; 4096];
    let mut offset = 0;
    loop {
        let in_before = compressor.total_in();
        let out_before = compressor.total_out();
        let status = compressor
            .compress(&input[offset..], &mut chunk, flush)
            .map_err(|_| ServerError::UnsupportedCompression("zlib compression failed".to_string()))?;
        let consumed = (compressor.total_in() - in_before) as usize;
        let produced = (compressor.total_out() - out_before) as usize;
        data.extend_from_slice(&chunk[..produced]);
        offset += consumed;

        if status == Status::StreamEnd {
            break;
        }
        if offset >= input.len() && produced == 0 {
            break;
        }
    }
    Ok(())
}

fn flush_block(compressor: &mut Compress, data: &mut Vec<u8>, writebuf: &mut Vec<u8>) -> Result<(), ServerError> {
    compress_into(compressor, &[], data, FlushCompress::Sync)?;
    if !data.ends_with(&SYNC_FLUSH_TAIL) {
        return Err(ServerError::UnsupportedCompression(
            "zlib sync flush did not produce the expected trailer".to_string(),
        ));
    }
    data.truncate(data.len() - SYNC_FLUSH_TAIL.len());
    writebuf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    writebuf.extend_from_slice(data);
    data.clear();
    Ok(())
}

/// Splits a `zlib2`-framed read buffer into complete length-prefixed
/// blocks, decompressing each (with the sync-flush trailer reattached)
/// into newline-delimited JSON lines. Returns bytes consumed.
pub fn consume_zlib2(
    readbuf: &[u8],
    decompressor: &mut Decompress,
    lines: &mut Vec<Vec<u8>>,
) -> Result<usize, ServerError> {
    let mut i = 0;
    while i + 2 < readbuf.len() {
        let hlen = u16::from_be_bytes([readbuf[i], readbuf[i + 1]]) as usize;
        let end = i + 2 + hlen;
        if end > readbuf.len() {
            break;
        }

        let mut packet = readbuf[i + 2..end].to_vec();
        packet.extend_from_slice(&SYNC_FLUSH_TAIL);

        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut offset = 0;
        loop {
            let in_before = decompressor.total_in();
            let out_before = decompressor.total_out();
            decompressor
                .decompress(&packet[offset..], &mut chunk, FlushDecompress::Sync)
                .map_err(|_| ServerError::UnsupportedCompression("zlib2 block failed to decompress".to_string()))?;
            let consumed = (decompressor.total_in() - in_before) as usize;
            let produced = (decompressor.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..produced]);
            offset += consumed;
            if offset >= packet.len() || (consumed == 0 && produced == 0) {
                break;
            }
        }

        for line in out.split(|&b| b == b'\n') {
            if !line.is_empty() {
                lines.push(line.to_vec());
            }
        }

        i = end;
    }
    Ok(i)
}

pub fn new_compressor() -> Compress {
    Compress::new(Compression::new(1), true)
}

pub fn new_decompressor() -> Decompress {
    Decompress::new(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncompressed_joins_with_newlines() {
        let mut lines = vec!["a".to_string(), "b".to_string()];
        let mut out = Vec::new();
        fill_uncompressed(&mut lines, &mut out);
        assert_eq!(out, b"a\nb\n");
        assert!(lines.is_empty());
    }

    #[test]
    fn zlib_round_trip_through_zlib2_framing() {
        let mut lines = vec!["{\"heartbeat\":{}}".to_string()];
        let mut compressor = new_compressor();
        let mut writebuf = Vec::new();
        fill_zlib(&mut lines, &mut compressor, &mut writebuf).unwrap();
        assert!(!writebuf.is_empty());

        let mut decompressor = new_decompressor();
        let mut out_lines = Vec::new();
        let consumed = consume_zlib2(&writebuf, &mut decompressor, &mut out_lines).unwrap();
        assert_eq!(consumed, writebuf.len());
        assert_eq!(out_lines.len(), 1);
        assert_eq!(out_lines[0], b"{\"heartbeat\":{}}");
    }
}
