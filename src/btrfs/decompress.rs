//! Per-extent decompression: zlib raw deflate, Btrfs-LZO framing, zstd.
//!
//! Compressed sizes are bounded before any allocation happens; an
//! extent that trips a bound is skipped by the caller rather than
//! failing the conversion.

use std::cell::RefCell;

use device_io::BlockDevice;
use flate2::{Decompress, FlushDecompress, Status};
use log::warn;

use crate::error::{ConvertError, Result};

use super::chunk::ChunkMap;
use super::model::FileExtent;
use super::CompressionType;

/// 512 MiB of compressed input is already absurd for one extent.
const MAX_COMP_SIZE: u64 = 512 * 1024 * 1024;
/// 4 GiB decompressed.
const MAX_DECOMP_SIZE: u64 = 4 * 1024 * 1024 * 1024;

thread_local! {
    // Scratch for compressed bytes, reused across extents.
    static COMP_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

/// Decompress one REG/PREALLOC extent. Returns exactly `ram_bytes`
/// bytes (zero-padded if the stream came up short).
pub fn decompress_extent(
    dev: &dyn BlockDevice,
    chunk_map: &ChunkMap,
    ext: &FileExtent,
    block_size: u32,
) -> Result<Vec<u8>> {
    if ext.compression == CompressionType::None {
        return Err(ConvertError::corrupt(
            "decompress called on an uncompressed extent".to_string(),
        ));
    }

    let comp_size = ext.disk_num_bytes;
    let mut decomp_size = ext.ram_bytes;
    if decomp_size == 0 {
        decomp_size = ext.num_bytes;
    }

    if comp_size == 0 || comp_size > MAX_COMP_SIZE {
        return Err(ConvertError::corrupt(format!(
            "extent at 0x{:x}: suspicious compressed size {} bytes",
            ext.disk_bytenr, comp_size
        )));
    }
    if decomp_size == 0 || decomp_size > MAX_DECOMP_SIZE {
        return Err(ConvertError::corrupt(format!(
            "extent at 0x{:x}: suspicious decompressed size {} bytes",
            ext.disk_bytenr, decomp_size
        )));
    }
    if comp_size > decomp_size {
        return Err(ConvertError::corrupt(format!(
            "extent at 0x{:x}: compressed size {} > decompressed size {}",
            ext.disk_bytenr, comp_size, decomp_size
        )));
    }
    // Anti-bomb: never inflate past twice the extent's logical bytes.
    if ext.num_bytes > 0 && decomp_size > ext.num_bytes.saturating_mul(2) {
        return Err(ConvertError::corrupt(format!(
            "extent at 0x{:x}: decompressed size {} exceeds 2x extent bytes {}",
            ext.disk_bytenr, decomp_size, ext.num_bytes
        )));
    }

    let phys = chunk_map.resolve(ext.disk_bytenr).ok_or_else(|| {
        ConvertError::bad_format(format!(
            "cannot resolve compressed extent at 0x{:x}",
            ext.disk_bytenr
        ))
    })?;

    COMP_BUF.with(|cell| {
        let mut comp = cell.borrow_mut();
        if comp.len() < comp_size as usize {
            comp.resize(comp_size as usize, 0);
        }
        dev.read_at(phys, &mut comp[..comp_size as usize])?;

        // Round the output to block size; callers write whole blocks.
        let aligned = (decomp_size + u64::from(block_size) - 1) / u64::from(block_size)
            * u64::from(block_size);
        let mut out = vec![0u8; aligned as usize];

        match ext.compression {
            CompressionType::Zlib => {
                decompress_zlib(&comp[..comp_size as usize], &mut out[..decomp_size as usize])?
            }
            CompressionType::Lzo => {
                decompress_lzo(&comp[..comp_size as usize], &mut out[..decomp_size as usize])?
            }
            CompressionType::Zstd => {
                decompress_zstd(&comp[..comp_size as usize], &mut out[..decomp_size as usize])?
            }
            CompressionType::None => unreachable!(),
        }

        out.truncate(decomp_size as usize);
        Ok(out)
    })
}

/// Raw deflate (window bits -15): Btrfs stores no zlib header.
fn decompress_zlib(input: &[u8], output: &mut [u8]) -> Result<()> {
    let mut inflater = Decompress::new(false);
    match inflater.decompress(input, output, FlushDecompress::Finish) {
        Ok(Status::StreamEnd) | Ok(Status::Ok) => Ok(()),
        Ok(Status::BufError) => Err(ConvertError::corrupt(
            "zlib stream larger than declared decompressed size".to_string(),
        )),
        Err(e) => Err(ConvertError::corrupt(format!("zlib inflate failed: {}", e))),
    }
}

/// One standard zstd frame.
fn decompress_zstd(input: &[u8], output: &mut [u8]) -> Result<()> {
    let decoded = zstd::bulk::decompress(input, output.len())
        .map_err(|e| ConvertError::corrupt(format!("zstd decompress failed: {}", e)))?;
    if decoded.len() > output.len() {
        return Err(ConvertError::corrupt(
            "zstd frame larger than declared decompressed size".to_string(),
        ));
    }
    output[..decoded.len()].copy_from_slice(&decoded);
    Ok(())
}

/// Btrfs LZO framing:
///   [4 bytes LE] total compressed length (including this header)
///   repeated: [4 bytes LE] segment length, then LZO1X data.
/// One segment per 4 KiB of decompressed output.
fn decompress_lzo(input: &[u8], output: &mut [u8]) -> Result<()> {
    if input.len() < 4 {
        return Err(ConvertError::corrupt("LZO data too short".to_string()));
    }

    let mut at = 4usize; // skip the total-length header
    let mut out_at = 0usize;

    while at < input.len() && out_at < output.len() {
        if at + 4 > input.len() {
            break;
        }
        let seg_len = u32::from_le_bytes(input[at..at + 4].try_into().unwrap()) as usize;
        at += 4;
        if seg_len == 0 || at + seg_len > input.len() {
            return Err(ConvertError::corrupt(
                "LZO segment exceeds input".to_string(),
            ));
        }
        let produced = lzo1x_decompress_safe(&input[at..at + seg_len], &mut output[out_at..])?;
        out_at += produced;
        at += seg_len;
    }

    Ok(())
}

/// Read the extended-length encoding: runs of 0x00 add 255 each, the
/// first non-zero byte terminates the run.
fn lzo_read_length(input: &[u8], at: &mut usize, base: usize) -> Result<usize> {
    let mut len = base;
    loop {
        let b = *input
            .get(*at)
            .ok_or_else(|| ConvertError::corrupt("LZO length run truncated".to_string()))?;
        *at += 1;
        if b == 0 {
            len += 255;
            if len > 0x0100_0000 {
                return Err(ConvertError::corrupt("LZO length run absurd".to_string()));
            }
        } else {
            return Ok(len + b as usize);
        }
    }
}

fn lzo_err(msg: &str) -> ConvertError {
    ConvertError::corrupt(format!("LZO1X: {}", msg))
}

fn lzo_take(input: &[u8], ip: &mut usize) -> Result<usize> {
    let b = *input.get(*ip).ok_or_else(|| lzo_err("input truncated"))?;
    *ip += 1;
    Ok(b as usize)
}

fn lzo_take_le16(input: &[u8], ip: &mut usize) -> Result<usize> {
    let lo = lzo_take(input, ip)?;
    let hi = lzo_take(input, ip)?;
    Ok(lo | (hi << 8))
}

fn lzo_copy_literals(
    input: &[u8],
    ip: &mut usize,
    output: &mut [u8],
    op: &mut usize,
    n: usize,
) -> Result<()> {
    if *ip + n > input.len() {
        return Err(lzo_err("literal run past input end"));
    }
    if *op + n > output.len() {
        return Err(lzo_err("literal run past output end"));
    }
    output[*op..*op + n].copy_from_slice(&input[*ip..*ip + n]);
    *ip += n;
    *op += n;
    Ok(())
}

fn lzo_copy_match(output: &mut [u8], op: &mut usize, dist: usize, len: usize) -> Result<()> {
    if dist == 0 || dist > *op {
        return Err(lzo_err("match distance before output start"));
    }
    if *op + len > output.len() {
        return Err(lzo_err("match past output end"));
    }
    // Overlapping copies are the point of LZO; go byte by byte.
    for _ in 0..len {
        output[*op] = output[*op - dist];
        *op += 1;
    }
    Ok(())
}

/// Safe LZO1X decompression of one segment. Returns the number of
/// bytes written into `output`.
fn lzo1x_decompress_safe(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let mut ip = 0usize; // input position
    let mut op = 0usize; // output position
    let mut state; // literals carried by the previous instruction

    // First byte: a long literal run may be encoded directly.
    let first = *input.first().ok_or_else(|| lzo_err("empty segment"))?;
    if first > 17 {
        ip = 1;
        let n = (first - 17) as usize;
        lzo_copy_literals(input, &mut ip, output, &mut op, n)?;
        state = if n < 4 { n } else { 4 };
    } else {
        state = 0;
    }

    loop {
        let t = lzo_take(input, &mut ip)?;

        let (len, dist, trailing) = if t >= 64 {
            // 1 L L D D D S S copies 5..8 bytes, 0 1 L D D D S S copies
            // 3..4 bytes; both reach back at most 2 KiB.
            let len = if t >= 128 {
                5 + ((t >> 5) & 3)
            } else {
                3 + ((t >> 5) & 1)
            };
            let h = lzo_take(input, &mut ip)?;
            (len, (h << 3) + ((t >> 2) & 7) + 1, t & 3)
        } else if t >= 32 {
            // 0 0 1 L L L L L: distance <= 16 KiB, LE16 follows.
            let len = if t & 31 != 0 {
                2 + (t & 31)
            } else {
                lzo_read_length(input, &mut ip, 2 + 31)?
            };
            let d16 = lzo_take_le16(input, &mut ip)?;
            (len, (d16 >> 2) + 1, d16 & 3)
        } else if t >= 16 {
            // 0 0 0 1 H L L L: distance 16..48 KiB, or end of stream.
            let len = if t & 7 != 0 {
                2 + (t & 7)
            } else {
                lzo_read_length(input, &mut ip, 2 + 7)?
            };
            let d16 = lzo_take_le16(input, &mut ip)?;
            let dist = 16384 + ((t & 8) << 11) + (d16 >> 2);
            if dist == 16384 {
                return Ok(op); // end-of-stream marker
            }
            (len, dist, d16 & 3)
        } else {
            // 0 0 0 0 x x x x: meaning depends on the previous state.
            match state {
                0 => {
                    // Long literal run.
                    let len = if t != 0 {
                        3 + t
                    } else {
                        lzo_read_length(input, &mut ip, 3 + 15)?
                    };
                    lzo_copy_literals(input, &mut ip, output, &mut op, len)?;
                    state = 4;
                    continue;
                }
                4 => {
                    // Copy 3 bytes from a 2..3 KiB distance.
                    let h = lzo_take(input, &mut ip)?;
                    (3, (h << 2) + ((t >> 2) & 3) + 2049, t & 3)
                }
                _ => {
                    // Copy 2 bytes from a <= 1 KiB distance.
                    let h = lzo_take(input, &mut ip)?;
                    (2, (h << 2) + ((t >> 2) & 3) + 1, t & 3)
                }
            }
        };

        lzo_copy_match(output, &mut op, dist, len)?;
        lzo_copy_literals(input, &mut ip, output, &mut op, trailing)?;
        state = trailing;
    }
}

/// Log-and-skip wrapper used by the inode writer: bombs and corrupt
/// streams skip the extent instead of failing the conversion.
pub fn try_decompress_extent(
    dev: &dyn BlockDevice,
    chunk_map: &ChunkMap,
    ext: &FileExtent,
    block_size: u32,
) -> Option<Vec<u8>> {
    match decompress_extent(dev, chunk_map, ext, block_size) {
        Ok(buf) => Some(buf),
        Err(e) => {
            warn!(
                "skipping compressed extent at 0x{:x}: {}",
                ext.disk_bytenr, e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btrfs::chunk::ChunkMapping;
    use crate::btrfs::FILE_EXTENT_REG;
    use device_io::MemDevice;
    use std::io::Write;

    fn identity_map(len: u64) -> ChunkMap {
        ChunkMap::from_entries(vec![ChunkMapping {
            logical: 0,
            physical: 0,
            length: len,
            chunk_type: crate::btrfs::BLOCK_GROUP_DATA,
        }])
    }

    fn extent(disk_bytenr: u64, comp: u64, ram: u64, kind: CompressionType) -> FileExtent {
        FileExtent {
            file_offset: 0,
            disk_bytenr,
            disk_num_bytes: comp,
            num_bytes: ram,
            ram_bytes: ram,
            compression: kind,
            extent_type: FILE_EXTENT_REG,
            inline_data: None,
        }
    }

    #[test]
    fn lzo_all_literals() {
        // first byte 17+len literals, then the EOS marker 11 00 00.
        let mut stream = vec![12 + 17];
        stream.extend_from_slice(b"hello world!");
        stream.extend_from_slice(&[0x11, 0x00, 0x00]);

        let mut out = vec![0u8; 12];
        let n = lzo1x_decompress_safe(&stream, &mut out).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&out, b"hello world!");
    }

    #[test]
    fn lzo_match_copy() {
        // "abcde" literals then a 5-byte match at distance 5.
        let mut stream = vec![5 + 17];
        stream.extend_from_slice(b"abcde");
        stream.push(0b0010_0011); // M3, L=3 -> length 5
        stream.extend_from_slice(&[16, 0]); // LE16: D=4 -> distance 5, S=0
        stream.extend_from_slice(&[0x11, 0x00, 0x00]);

        let mut out = vec![0u8; 10];
        let n = lzo1x_decompress_safe(&stream, &mut out).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&out, b"abcdeabcde");
    }

    #[test]
    fn lzo_rejects_truncated_stream() {
        let stream = vec![30, b'a', b'b'];
        let mut out = vec![0u8; 64];
        assert!(lzo1x_decompress_safe(&stream, &mut out).is_err());
    }

    #[test]
    fn zlib_extent_round_trip() {
        let plain = b"compressible compressible compressible data".repeat(40);

        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(&plain).unwrap();
        let comp = enc.finish().unwrap();

        let dev = MemDevice::new(1 << 20);
        dev.write_at(0x10000, &comp).unwrap();

        let map = identity_map(1 << 20);
        let ext = extent(0x10000, comp.len() as u64, plain.len() as u64, CompressionType::Zlib);
        let out = decompress_extent(&dev, &map, &ext, 4096).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn zstd_extent_round_trip() {
        let plain = b"zstd zstd zstd zstd payload".repeat(64);
        let comp = zstd::bulk::compress(&plain, 3).unwrap();

        let dev = MemDevice::new(1 << 20);
        dev.write_at(0x20000, &comp).unwrap();

        let map = identity_map(1 << 20);
        let ext = extent(0x20000, comp.len() as u64, plain.len() as u64, CompressionType::Zstd);
        let out = decompress_extent(&dev, &map, &ext, 4096).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn bomb_heuristics_reject_absurd_extents() {
        let dev = MemDevice::new(1 << 20);
        let map = identity_map(1 << 20);

        // ram_bytes wildly larger than the extent's logical bytes.
        let mut ext = extent(0x1000, 4096, 0xFFFF_FFFF, CompressionType::Zlib);
        ext.num_bytes = 4096;
        assert!(matches!(
            decompress_extent(&dev, &map, &ext, 4096),
            Err(ConvertError::Corrupt(_))
        ));

        // compressed larger than decompressed.
        let ext = extent(0x1000, 8192, 4096, CompressionType::Zlib);
        assert!(decompress_extent(&dev, &map, &ext, 4096).is_err());
    }
}
