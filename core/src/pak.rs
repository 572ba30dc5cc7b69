//! PAK asset container reading.
//!
//! The data registry pulls game-data tables out of PAK archives. The layout
//! is the legacy one: a 64-byte header tagged `PAK\0`, a fixed-width index,
//! and a data region. Entries may be zlib-compressed, flagged per entry.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context};
use bitflags::bitflags;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use flate2::Crc;

use crate::codec::{ByteReader, ByteWriter, WireError};

pub const PAK_SIGNATURE: [u8; 4] = *b"PAK\0";
pub const PAK_HEADER_SIZE: usize = 64;
pub const PAK_PATH_LENGTH: usize = 64;
pub const PAK_INDEX_ENTRY_SIZE: usize = PAK_PATH_LENGTH + 24;
pub const PAK_VERSION: u32 = 2;

bitflags! {
    /// Per-entry flags in the PAK index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PakEntryFlags: u32 {
        const COMPRESSED = 0x0000_0001;
        const ENCRYPTED  = 0x0000_0002;
        const DELETED    = 0x0000_0004;
    }
}

/// The 64-byte archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakHeader {
    pub version: u32,
    pub file_count: u32,
    pub index_offset: u32,
    pub index_size: u32,
    pub flags: u32,
    pub data_offset: u32,
    pub data_size: u32,
    pub reserved: [u32; 8],
}

impl PakHeader {
    pub fn parse(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let signature = r.get_fixed_bytes::<4>()?;
        if signature != PAK_SIGNATURE {
            return Err(WireError::Validation {
                record: "pak_header",
                reason: "bad signature",
            });
        }
        let header = Self {
            version: r.get_u32()?,
            file_count: r.get_u32()?,
            index_offset: r.get_u32()?,
            index_size: r.get_u32()?,
            flags: r.get_u32()?,
            data_offset: r.get_u32()?,
            data_size: r.get_u32()?,
            reserved: {
                let mut reserved = [0u32; 8];
                for slot in reserved.iter_mut() {
                    *slot = r.get_u32()?;
                }
                reserved
            },
        };
        *offset = r.position();
        Ok(header)
    }

    pub fn write(&self, buf: &mut [u8], offset: &mut usize) -> Result<(), WireError> {
        let mut w = ByteWriter::new(buf, *offset);
        w.put_bytes(&PAK_SIGNATURE)?;
        w.put_u32(self.version)?;
        w.put_u32(self.file_count)?;
        w.put_u32(self.index_offset)?;
        w.put_u32(self.index_size)?;
        w.put_u32(self.flags)?;
        w.put_u32(self.data_offset)?;
        w.put_u32(self.data_size)?;
        for slot in &self.reserved {
            w.put_u32(*slot)?;
        }
        *offset = w.position();
        Ok(())
    }
}

/// One fixed-width index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PakIndexEntry {
    pub path: String,
    pub offset: u32,
    pub size: u32,
    pub compressed_size: u32,
    pub flags: PakEntryFlags,
    pub checksum: u32,
    pub timestamp: u32,
}

impl PakIndexEntry {
    pub fn parse(buf: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let mut r = ByteReader::new(buf, *offset);
        let entry = Self {
            path: r.get_fixed_str(PAK_PATH_LENGTH)?,
            offset: r.get_u32()?,
            size: r.get_u32()?,
            compressed_size: r.get_u32()?,
            flags: PakEntryFlags::from_bits_truncate(r.get_u32()?),
            checksum: r.get_u32()?,
            timestamp: r.get_u32()?,
        };
        *offset = r.position();
        Ok(entry)
    }

    pub fn write(&self, buf: &mut [u8], offset: &mut usize) -> Result<(), WireError> {
        let mut w = ByteWriter::new(buf, *offset);
        w.put_fixed_str(&self.path, PAK_PATH_LENGTH)?;
        w.put_u32(self.offset)?;
        w.put_u32(self.size)?;
        w.put_u32(self.compressed_size)?;
        w.put_u32(self.flags.bits())?;
        w.put_u32(self.checksum)?;
        w.put_u32(self.timestamp)?;
        *offset = w.position();
        Ok(())
    }
}

/// An opened archive: parsed header, parsed index, raw bytes.
pub struct PakArchive {
    pub header: PakHeader,
    pub entries: Vec<PakIndexEntry>,
    raw: Vec<u8>,
}

impl PakArchive {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read(path).with_context(|| format!("reading pak {}", path.display()))?;
        Self::from_bytes(raw)
    }

    pub fn from_bytes(raw: Vec<u8>) -> anyhow::Result<Self> {
        let mut offset = 0;
        let header = PakHeader::parse(&raw, &mut offset)
            .map_err(|e| anyhow::anyhow!("parsing pak header: {e}"))?;

        let mut offset = header.index_offset as usize;
        let index_end = offset
            .checked_add(header.index_size as usize)
            .filter(|end| *end <= raw.len());
        if index_end.is_none() {
            bail!("pak index region out of range");
        }
        if header.file_count as usize * PAK_INDEX_ENTRY_SIZE > header.index_size as usize {
            bail!("pak file count does not fit declared index size");
        }

        let mut entries = Vec::with_capacity(header.file_count as usize);
        for n in 0..header.file_count {
            let entry = PakIndexEntry::parse(&raw, &mut offset)
                .map_err(|e| anyhow::anyhow!("parsing pak index entry {n}: {e}"))?;
            entries.push(entry);
        }

        Ok(Self {
            header,
            entries,
            raw,
        })
    }

    pub fn entry(&self, path: &str) -> Option<&PakIndexEntry> {
        self.entries
            .iter()
            .find(|e| e.path == path && !e.flags.contains(PakEntryFlags::DELETED))
    }

    /// Extract one entry, inflating and checksum-verifying it.
    pub fn read_entry(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let entry = self
            .entry(path)
            .with_context(|| format!("pak entry not found: {path}"))?;

        let start = entry.offset as usize;
        let stored = if entry.flags.contains(PakEntryFlags::COMPRESSED) {
            entry.compressed_size as usize
        } else {
            entry.size as usize
        };
        let end = start
            .checked_add(stored)
            .filter(|end| *end <= self.raw.len())
            .with_context(|| format!("pak entry out of range: {path}"))?;
        let slice = &self.raw[start..end];

        let data = if entry.flags.contains(PakEntryFlags::COMPRESSED) {
            let mut decoder = ZlibDecoder::new(slice);
            let mut out = Vec::with_capacity(entry.size as usize);
            decoder
                .read_to_end(&mut out)
                .with_context(|| format!("inflating pak entry: {path}"))?;
            out
        } else {
            slice.to_vec()
        };

        if data.len() != entry.size as usize {
            bail!(
                "pak entry {path}: size mismatch, index says {} got {}",
                entry.size,
                data.len()
            );
        }
        let mut crc = Crc::new();
        crc.update(&data);
        if crc.sum() != entry.checksum {
            bail!("pak entry {path}: checksum mismatch");
        }
        Ok(data)
    }
}

/// In-memory archive writer, used by the packing tool and by tests.
#[derive(Default)]
pub struct PakBuilder {
    files: Vec<(String, Vec<u8>, bool, u32)>,
}

impl PakBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one file. Paths longer than the fixed slot are rejected at
    /// `finish` time by the index writer, not silently truncated.
    pub fn add(&mut self, path: &str, data: &[u8], compress: bool, timestamp: u32) -> &mut Self {
        self.files
            .push((path.to_string(), data.to_vec(), compress, timestamp));
        self
    }

    pub fn finish(&self) -> anyhow::Result<Vec<u8>> {
        use std::io::Write;

        let mut data_region: Vec<u8> = Vec::new();
        let mut entries: Vec<PakIndexEntry> = Vec::new();
        let data_offset = PAK_HEADER_SIZE as u32;

        for (path, data, compress, timestamp) in &self.files {
            if path.len() >= PAK_PATH_LENGTH {
                bail!("pak path too long: {path}");
            }
            let mut crc = Crc::new();
            crc.update(data);

            let offset = data_offset + data_region.len() as u32;
            let (stored, flags) = if *compress {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                (encoder.finish()?, PakEntryFlags::COMPRESSED)
            } else {
                (data.clone(), PakEntryFlags::empty())
            };

            entries.push(PakIndexEntry {
                path: path.clone(),
                offset,
                size: data.len() as u32,
                compressed_size: stored.len() as u32,
                flags,
                checksum: crc.sum(),
                timestamp: *timestamp,
            });
            data_region.extend_from_slice(&stored);
        }

        let index_offset = data_offset + data_region.len() as u32;
        let index_size = (entries.len() * PAK_INDEX_ENTRY_SIZE) as u32;
        let header = PakHeader {
            version: PAK_VERSION,
            file_count: entries.len() as u32,
            index_offset,
            index_size,
            flags: 0,
            data_offset,
            data_size: data_region.len() as u32,
            reserved: [0; 8],
        };

        let total = PAK_HEADER_SIZE + data_region.len() + index_size as usize;
        let mut out = vec![0u8; total];
        let mut offset = 0;
        header
            .write(&mut out, &mut offset)
            .map_err(|e| anyhow::anyhow!("writing pak header: {e}"))?;
        out[offset..offset + data_region.len()].copy_from_slice(&data_region);
        let mut offset = index_offset as usize;
        for entry in &entries {
            entry
                .write(&mut out, &mut offset)
                .map_err(|e| anyhow::anyhow!("writing pak index: {e}"))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixty_four_bytes() {
        let header = PakHeader {
            version: PAK_VERSION,
            file_count: 0,
            index_offset: 64,
            index_size: 0,
            flags: 0,
            data_offset: 64,
            data_size: 0,
            reserved: [0; 8],
        };
        let mut buf = [0u8; PAK_HEADER_SIZE];
        let mut offset = 0;
        header.write(&mut buf, &mut offset).unwrap();
        assert_eq!(offset, PAK_HEADER_SIZE);

        let mut offset = 0;
        assert_eq!(PakHeader::parse(&buf, &mut offset).unwrap(), header);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let buf = [0u8; PAK_HEADER_SIZE];
        let mut offset = 0;
        assert!(PakHeader::parse(&buf, &mut offset).is_err());
        assert_eq!(offset, 0);
    }

    #[test]
    fn index_entry_round_trip() {
        let entry = PakIndexEntry {
            path: "data/item.dat".to_string(),
            offset: 64,
            size: 1000,
            compressed_size: 400,
            flags: PakEntryFlags::COMPRESSED,
            checksum: 0xDEADBEEF,
            timestamp: 1_700_000_000,
        };
        let mut buf = [0u8; PAK_INDEX_ENTRY_SIZE];
        let mut offset = 0;
        entry.write(&mut buf, &mut offset).unwrap();
        assert_eq!(offset, PAK_INDEX_ENTRY_SIZE);

        let mut offset = 0;
        assert_eq!(PakIndexEntry::parse(&buf, &mut offset).unwrap(), entry);
    }

    #[test]
    fn build_then_read_plain_and_compressed_entries() {
        let table = vec![7u8; 4096];
        let mut builder = PakBuilder::new();
        builder.add("motd.txt", b"welcome", false, 1);
        builder.add("data/mob.dat", &table, true, 2);
        let raw = builder.finish().unwrap();

        let archive = PakArchive::from_bytes(raw).unwrap();
        assert_eq!(archive.header.file_count, 2);
        assert_eq!(archive.read_entry("motd.txt").unwrap(), b"welcome");
        assert_eq!(archive.read_entry("data/mob.dat").unwrap(), table);

        let compressed = archive.entry("data/mob.dat").unwrap();
        assert!(compressed.flags.contains(PakEntryFlags::COMPRESSED));
        assert!(compressed.compressed_size < compressed.size);
    }

    #[test]
    fn corrupted_data_fails_checksum() {
        let mut builder = PakBuilder::new();
        builder.add("a.bin", &[1, 2, 3, 4], false, 0);
        let mut raw = builder.finish().unwrap();
        // Flip a payload byte.
        raw[PAK_HEADER_SIZE] ^= 0xFF;
        let archive = PakArchive::from_bytes(raw).unwrap();
        assert!(archive.read_entry("a.bin").is_err());
    }

    #[test]
    fn missing_entry_is_an_error() {
        let raw = PakBuilder::new().finish().unwrap();
        let archive = PakArchive::from_bytes(raw).unwrap();
        assert!(archive.read_entry("nope").is_err());
    }

    #[test]
    fn overlong_path_is_rejected() {
        let mut builder = PakBuilder::new();
        let long = "x".repeat(PAK_PATH_LENGTH);
        builder.add(&long, b"data", false, 0);
        assert!(builder.finish().is_err());
    }
}
