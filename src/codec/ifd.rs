//! Minimal TIFF directory walker.
//!
//! Reaches the ImageDescription entry of the first IFD without decoding any
//! pixel data, so the embedded metadata block can be read or replaced in
//! place. Handles classic and BigTIFF files in either byte order.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// ImageDescription tag number.
pub const IMAGE_DESCRIPTION: u16 = 270;

const ASCII: u16 = 2;
const MAX_DIRECTORIES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        }
    }

    fn u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    fn u64(self, bytes: [u8; 8]) -> u64 {
        match self {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }

    fn put_u16(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn put_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }

    fn put_u64(self, value: u64) -> [u8; 8] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason.into())
}

/// Location of the ImageDescription value inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionSlot {
    entry_offset: u64,
    count: u64,
    value_offset: u64,
    inline: bool,
}

/// Where a new description ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Written over the existing block; file length unchanged.
    InPlace,
    /// Existing block too small; written at end of file and the entry re-pointed.
    Appended { offset: u64 },
}

/// An open TIFF stream positioned by directory offsets.
pub struct TiffLayout<F> {
    file: F,
    order: ByteOrder,
    big_tiff: bool,
    first_ifd: u64,
}

impl<F: Read + Seek> TiffLayout<F> {
    /// Parse the header of `file`.
    pub fn open(mut file: F) -> io::Result<Self> {
        let mut head = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head)?;

        let order = match &head[0..2] {
            b"II" => ByteOrder::Little,
            b"MM" => ByteOrder::Big,
            _ => return Err(invalid("not a TIFF file (bad byte order mark)")),
        };

        let (big_tiff, first_ifd) = match order.u16([head[2], head[3]]) {
            42 => (false, order.u32([head[4], head[5], head[6], head[7]]) as u64),
            43 => {
                let mut offset = [0u8; 8];
                file.read_exact(&mut offset)?;
                (true, order.u64(offset))
            }
            magic => return Err(invalid(format!("not a TIFF file (magic {})", magic))),
        };

        Ok(Self {
            file,
            order,
            big_tiff,
            first_ifd,
        })
    }

    fn entry_size(&self) -> u64 {
        if self.big_tiff {
            20
        } else {
            12
        }
    }

    fn inline_capacity(&self) -> u64 {
        if self.big_tiff {
            8
        } else {
            4
        }
    }

    fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.file.read_exact(&mut buf)?;
        Ok(self.order.u16(buf))
    }

    /// Read a count or offset field (32-bit classic, 64-bit BigTIFF).
    fn read_word(&mut self) -> io::Result<u64> {
        if self.big_tiff {
            let mut buf = [0u8; 8];
            self.file.read_exact(&mut buf)?;
            Ok(self.order.u64(buf))
        } else {
            let mut buf = [0u8; 4];
            self.file.read_exact(&mut buf)?;
            Ok(self.order.u32(buf) as u64)
        }
    }

    fn read_entry_count(&mut self) -> io::Result<u64> {
        if self.big_tiff {
            self.read_word()
        } else {
            self.read_u16().map(u64::from)
        }
    }

    fn entry_count_size(&self) -> u64 {
        if self.big_tiff {
            8
        } else {
            2
        }
    }

    /// Offsets of every image directory, in file order.
    pub fn directory_offsets(&mut self) -> io::Result<Vec<u64>> {
        let mut offsets: Vec<u64> = Vec::new();
        let mut next = self.first_ifd;

        while next != 0 {
            if offsets.contains(&next) || offsets.len() >= MAX_DIRECTORIES {
                return Err(invalid("IFD chain loops back on itself"));
            }
            offsets.push(next);

            self.file.seek(SeekFrom::Start(next))?;
            let entries = self.read_entry_count()?;
            let skip = entries
                .checked_mul(self.entry_size())
                .ok_or_else(|| invalid("IFD entry count overflows"))?;
            self.file
                .seek(SeekFrom::Start(next + self.entry_count_size() + skip))?;
            next = self.read_word()?;
        }

        Ok(offsets)
    }

    /// Locate the ImageDescription entry of the first directory.
    pub fn find_description(&mut self) -> io::Result<Option<DescriptionSlot>> {
        if self.first_ifd == 0 {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(self.first_ifd))?;
        let entries = self.read_entry_count()?;
        let first_entry = self.first_ifd + self.entry_count_size();

        for i in 0..entries {
            let entry_offset = first_entry + i * self.entry_size();
            self.file.seek(SeekFrom::Start(entry_offset))?;
            let tag = self.read_u16()?;
            if tag != IMAGE_DESCRIPTION {
                continue;
            }

            let _field_type = self.read_u16()?;
            let count = self.read_word()?;
            let inline = count <= self.inline_capacity();
            let value_field = entry_offset + if self.big_tiff { 12 } else { 8 };
            let value_offset = if inline {
                value_field
            } else {
                self.read_word()?
            };

            return Ok(Some(DescriptionSlot {
                entry_offset,
                count,
                value_offset,
                inline,
            }));
        }

        Ok(None)
    }

    /// Read the description text, stopping at the first NUL.
    pub fn read_description(&mut self) -> io::Result<Option<String>> {
        let Some(slot) = self.find_description()? else {
            return Ok(None);
        };

        let length = usize::try_from(slot.count)
            .map_err(|_| invalid("ImageDescription is too large"))?;
        let mut bytes = vec![0u8; length];
        self.file.seek(SeekFrom::Start(slot.value_offset))?;
        self.file.read_exact(&mut bytes)?;

        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }

        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| invalid(format!("ImageDescription is not UTF-8: {}", e)))
    }
}

impl<F: Read + Write + Seek> TiffLayout<F> {
    /// Replace the description text. Returns `None` when the first directory
    /// has no ImageDescription entry.
    ///
    /// Only the description bytes and its directory entry are written; strip
    /// data is never touched.
    pub fn write_description(&mut self, text: &str) -> io::Result<Option<Placement>> {
        let Some(slot) = self.find_description()? else {
            return Ok(None);
        };

        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        let needed = bytes.len() as u64;

        let capacity = if slot.inline {
            self.inline_capacity()
        } else {
            slot.count
        };

        if needed <= capacity {
            bytes.resize(capacity as usize, 0);
            self.file.seek(SeekFrom::Start(slot.value_offset))?;
            self.file.write_all(&bytes)?;
            if slot.inline {
                self.write_count(slot.entry_offset, needed)?;
            }
            self.file.flush()?;
            return Ok(Some(Placement::InPlace));
        }

        let end = self.file.seek(SeekFrom::End(0))?;
        // values start on a word boundary
        let offset = end + (end % 2);
        if offset > end {
            self.file.write_all(&[0])?;
        }
        if !self.big_tiff && offset + needed > u32::MAX as u64 {
            return Err(invalid("description does not fit in a classic TIFF"));
        }
        self.file.write_all(&bytes)?;

        let order = self.order;
        self.file.seek(SeekFrom::Start(slot.entry_offset + 2))?;
        self.file.write_all(&order.put_u16(ASCII))?;
        self.write_count(slot.entry_offset, needed)?;
        if self.big_tiff {
            self.file.write_all(&order.put_u64(offset))?;
        } else {
            self.file.write_all(&order.put_u32(offset as u32))?;
        }
        self.file.flush()?;

        Ok(Some(Placement::Appended { offset }))
    }

    /// Write the count field of the entry at `entry_offset`, leaving the
    /// stream positioned on its value field.
    fn write_count(&mut self, entry_offset: u64, count: u64) -> io::Result<()> {
        let order = self.order;
        self.file.seek(SeekFrom::Start(entry_offset + 4))?;
        if self.big_tiff {
            self.file.write_all(&order.put_u64(count))
        } else {
            let count = u32::try_from(count).map_err(|_| invalid("count exceeds 32 bits"))?;
            self.file.write_all(&order.put_u32(count))
        }
    }
}
