//! Firmware image loading: raw binary or Intel HEX, selected by suffix.

use std::path::Path;

use ihex::Record;

use crate::error::{Error, Result};

/// Intel HEX is recognized purely by filename suffix; everything else is
/// passed through as raw binary.
pub fn is_hex_name(path: &Path) -> bool {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "hex" | "ihx" | "ihex")
}

/// Load a firmware image, bounded by the size of the target region.
pub fn load_image<P: AsRef<Path>>(path: P, limit: usize) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let raw = std::fs::read(path)?;
    let data = if is_hex_name(path) {
        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::BadImage("Intel HEX file is not valid text".into()))?;
        let data = read_ihex(text, limit)?;
        log::info!("{} bytes (Intel HEX)", data.len());
        data
    } else {
        log::info!("{} bytes (Binary)", raw.len());
        raw
    };
    if data.len() > limit {
        return Err(Error::BadImage(format!(
            "image is {} bytes, target region only holds {}",
            data.len(),
            limit
        )));
    }
    Ok(data)
}

/// Parse Intel HEX text into a contiguous image starting at address 0.
/// Record types 00/01/02/04 are honored, 05 is accepted and discarded;
/// overlapping data records and data beyond `limit` are rejected.
pub fn read_ihex(text: &str, limit: usize) -> Result<Vec<u8>> {
    let mut base_address: u32 = 0;
    let mut sections: Vec<(u32, Vec<u8>)> = vec![];

    for record in ihex::Reader::new(text) {
        let record = record.map_err(|e| Error::BadImage(format!("invalid Intel HEX ({})", e)))?;
        match record {
            Record::Data { offset, value } => {
                sections.push((base_address + offset as u32, value));
            }
            Record::EndOfFile => break,
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::StartLinearAddress(_) => {}
            Record::StartSegmentAddress { .. } => {
                return Err(Error::BadImage("unsupported record type 03".into()))
            }
        }
    }

    merge_sections(sections, limit)
}

fn merge_sections(mut sections: Vec<(u32, Vec<u8>)>, limit: usize) -> Result<Vec<u8>> {
    sections.sort_by_key(|(addr, _)| *addr);

    let mut image = vec![];
    let mut covered = 0u32;
    for (addr, data) in sections {
        if !image.is_empty() && addr < covered {
            return Err(Error::BadImage(format!(
                "overlapping records at 0x{:04x}",
                addr
            )));
        }
        let end = addr as usize + data.len();
        if end > limit {
            return Err(Error::BadImage(format!(
                "record at 0x{:04x} extends past the target region (0x{:04x})",
                addr, limit
            )));
        }
        // gaps are filled with the erased-flash value
        image.resize(addr as usize, 0xff);
        image.extend_from_slice(&data);
        covered = end as u32;
    }
    Ok(image)
}

/// Pad an image with 0xFF up to a multiple of the dialect write block.
pub fn pad_to_block(mut data: Vec<u8>, block: usize) -> Vec<u8> {
    if block > 0 && data.len() % block != 0 {
        let padded = (data.len() / block + 1) * block;
        data.resize(padded, 0xff);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_detection() {
        assert!(is_hex_name(Path::new("blink.hex")));
        assert!(is_hex_name(Path::new("blink.IHX")));
        assert!(is_hex_name(Path::new("blink.iHex")));
        assert!(!is_hex_name(Path::new("blink.bin")));
        assert!(!is_hex_name(Path::new("blink")));
    }

    #[test]
    fn parses_simple_records() {
        let text = ":03000000020100FA\n:00000001FF\n";
        let data = read_ihex(text, 1024).unwrap();
        assert_eq!(data, vec![0x02, 0x01, 0x00]);
    }

    #[test]
    fn fills_gaps_with_erased_value() {
        // 1 byte at 0, 1 byte at 4
        let text = ":0100000055AA\n:01000400AA51\n:00000001FF\n";
        let data = read_ihex(text, 16).unwrap();
        assert_eq!(data, vec![0x55, 0xff, 0xff, 0xff, 0xaa]);
    }

    #[test]
    fn extended_linear_address_offsets_data() {
        let text = ":020000040001F9\n:0100000055AA\n:00000001FF\n";
        let data = read_ihex(text, 0x2_0000).unwrap();
        assert_eq!(data.len(), 0x1_0001);
        assert_eq!(data[0x1_0000], 0x55);
        assert!(data[..0x1_0000].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn rejects_overlap() {
        let text = ":0200000055AAFF\n:01000100BB43\n:00000001FF\n";
        assert!(matches!(read_ihex(text, 64), Err(Error::BadImage(_))));
    }

    #[test]
    fn rejects_data_past_region() {
        let text = ":01040000AA51\n:00000001FF\n";
        assert!(matches!(read_ihex(text, 4), Err(Error::BadImage(_))));
    }

    #[test]
    fn rejects_bad_checksum() {
        let text = ":0100000055AB\n:00000001FF\n";
        assert!(matches!(read_ihex(text, 64), Err(Error::BadImage(_))));
    }

    #[test]
    fn padding() {
        assert_eq!(pad_to_block(vec![0u8; 80], 128).len(), 128);
        assert_eq!(pad_to_block(vec![0u8; 128], 128).len(), 128);
        assert_eq!(pad_to_block(vec![0u8; 129], 128).len(), 256);
        assert!(pad_to_block(vec![], 256).is_empty());
        let padded = pad_to_block(vec![1, 2, 3], 8);
        assert_eq!(&padded[3..], &[0xff; 5]);
    }

    #[test]
    fn fuzzed_records_never_panic() {
        let mut state: u32 = 0x0bad_cafe;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };
        for _ in 0..500 {
            let len = (next() % 40) as usize;
            let line: String = (0..len)
                .map(|_| char::from_digit(next() % 16, 16).unwrap())
                .collect();
            let text = format!(":{}\n:00000001FF\n", line);
            // outcome must be data or BadImage, never a panic
            let _ = read_ihex(&text, 1024);
        }
    }
}
