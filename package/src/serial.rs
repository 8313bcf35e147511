//! Binary package layout.
//!
//! Little-endian throughout. A file is a [`FileHeader`], `section_count`
//! [`SectionHeader`]s, then the sections in header order, tightly packed.
//! All offsets stored inside a section are relative to that section's
//! start.

use crate::error::FileError;

/// `CSWP` read as a little-endian u32.
pub const MAGIC: u32 = 0x5057_5343;
pub const VERSION: u8 = 0;
pub const WORD_SIZE: u8 = 8;

pub const FILE_HEADER_SIZE: usize = 8;
pub const SECTION_HEADER_SIZE: usize = 28;
pub const FUNCTION_ENTRY_SIZE: usize = 54;
pub const STRING_ENTRY_SIZE: usize = 16;

pub mod section_kind {
    pub const FUNCTION: u32 = 1;
    pub const TYPE: u32 = 2;
    pub const STRING: u32 = 3;
}

#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    pub kind: u32,
    pub offset: u64,
    pub size: u64,
    pub entry_count: u32,
    pub entry_size: u32,
}

/// One fixed-size entry in the function section. Type offsets are relative
/// to the type section; instruction and safepoint offsets are relative to
/// the function section.
#[derive(Debug, Clone, Copy)]
pub struct FunctionEntry {
    pub name_index: u32,
    pub param_type_offset: u64,
    pub param_type_count: u32,
    pub return_type_offset: u64,
    pub return_type_count: u32,
    pub inst_offset: u64,
    pub inst_size: u32,
    pub safepoint_offset: u64,
    pub safepoint_count: u32,
    pub frame_size: u16,
}

pub fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

pub fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

pub fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

impl SectionHeader {
    fn parse(data: &[u8], at: usize) -> Option<SectionHeader> {
        Some(SectionHeader {
            kind: read_u32(data, at)?,
            offset: read_u64(data, at + 4)?,
            size: read_u64(data, at + 12)?,
            entry_count: read_u32(data, at + 20)?,
            entry_size: read_u32(data, at + 24)?,
        })
    }
}

impl FunctionEntry {
    pub fn parse(data: &[u8], at: usize) -> Option<FunctionEntry> {
        Some(FunctionEntry {
            name_index: read_u32(data, at)?,
            param_type_offset: read_u64(data, at + 4)?,
            param_type_count: read_u32(data, at + 12)?,
            return_type_offset: read_u64(data, at + 16)?,
            return_type_count: read_u32(data, at + 24)?,
            inst_offset: read_u64(data, at + 28)?,
            inst_size: read_u32(data, at + 36)?,
            safepoint_offset: read_u64(data, at + 40)?,
            safepoint_count: read_u32(data, at + 48)?,
            frame_size: read_u16(data, at + 52)?,
        })
    }
}

/// The three known sections of a package file.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sections {
    pub function: Option<SectionHeader>,
    pub type_: Option<SectionHeader>,
    pub string: Option<SectionHeader>,
}

/// Validate the file header and section headers: magic, version, word
/// size, contiguity (each section starts where the previous one ended),
/// and no duplicate kinds. Unknown kinds are ignored.
pub fn parse_headers(data: &[u8], path: &str) -> Result<Sections, FileError> {
    let err = |message: String| FileError::new(path, message);

    if data.len() < FILE_HEADER_SIZE {
        return Err(err("file too short for header".to_string()));
    }
    let magic = read_u32(data, 0).expect("sized");
    if magic != MAGIC {
        return Err(err(format!("bad magic {magic:#010x}")));
    }
    let version = data[4];
    if version != VERSION {
        return Err(err(format!("unsupported version {version}")));
    }
    let word_size = data[5];
    if word_size != WORD_SIZE {
        return Err(err(format!("unsupported word size {word_size}")));
    }
    let section_count = read_u16(data, 6).expect("sized") as usize;

    let headers_end = FILE_HEADER_SIZE + section_count * SECTION_HEADER_SIZE;
    if data.len() < headers_end {
        return Err(err("file too short for section headers".to_string()));
    }

    let mut sections = Sections::default();
    let mut expected_offset = headers_end as u64;
    for i in 0..section_count {
        let header =
            SectionHeader::parse(data, FILE_HEADER_SIZE + i * SECTION_HEADER_SIZE)
                .expect("sized");
        if header.offset != expected_offset {
            return Err(err(format!(
                "section {i} starts at {} but previous data ends at \
                 {expected_offset}",
                header.offset
            )));
        }
        let end = header.offset.checked_add(header.size).ok_or_else(|| {
            err(format!("section {i} size overflows"))
        })?;
        if end > data.len() as u64 {
            return Err(err(format!("section {i} extends past end of file")));
        }
        expected_offset = end;

        let slot = match header.kind {
            section_kind::FUNCTION => &mut sections.function,
            section_kind::TYPE => &mut sections.type_,
            section_kind::STRING => &mut sections.string,
            _ => continue,
        };
        if slot.is_some() {
            return Err(err(format!("duplicate section kind {}", header.kind)));
        }

        let entries = header.entry_count as u64 * header.entry_size as u64;
        if entries > header.size {
            return Err(err(format!(
                "section {i} declares more entries than it holds"
            )));
        }
        if header.kind == section_kind::FUNCTION
            && header.entry_count > 0
            && (header.entry_size as usize) < FUNCTION_ENTRY_SIZE
        {
            return Err(err(format!(
                "function entries of size {} are too small",
                header.entry_size
            )));
        }
        if header.kind == section_kind::STRING
            && header.entry_count > 0
            && (header.entry_size as usize) < STRING_ENTRY_SIZE
        {
            return Err(err(format!(
                "string entries of size {} are too small",
                header.entry_size
            )));
        }
        *slot = Some(header);
    }

    Ok(sections)
}

/// Sequential writer over a fixed-size output buffer.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn put_section_header(&mut self, header: &SectionHeader) {
        self.put_u32(header.kind);
        self.put_u64(header.offset);
        self.put_u64(header.size);
        self.put_u32(header.entry_count);
        self.put_u32(header.entry_size);
    }

    pub fn put_function_entry(&mut self, entry: &FunctionEntry) {
        self.put_u32(entry.name_index);
        self.put_u64(entry.param_type_offset);
        self.put_u32(entry.param_type_count);
        self.put_u64(entry.return_type_offset);
        self.put_u32(entry.return_type_count);
        self.put_u64(entry.inst_offset);
        self.put_u32(entry.inst_size);
        self.put_u64(entry.safepoint_offset);
        self.put_u32(entry.safepoint_count);
        self.put_u16(entry.frame_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&MAGIC.to_le_bytes());
        data.push(VERSION);
        data.push(WORD_SIZE);
        data.extend_from_slice(&3u16.to_le_bytes());
        let headers_end = (FILE_HEADER_SIZE + 3 * SECTION_HEADER_SIZE) as u64;
        for kind in [section_kind::FUNCTION, section_kind::TYPE, section_kind::STRING] {
            data.extend_from_slice(&kind.to_le_bytes());
            data.extend_from_slice(&headers_end.to_le_bytes());
            data.extend_from_slice(&0u64.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            let entry_size: u32 = match kind {
                section_kind::FUNCTION => FUNCTION_ENTRY_SIZE as u32,
                section_kind::TYPE => 1,
                _ => STRING_ENTRY_SIZE as u32,
            };
            data.extend_from_slice(&entry_size.to_le_bytes());
        }
        data
    }

    #[test]
    fn accepts_an_empty_package() {
        let data = minimal_file();
        let sections = parse_headers(&data, "t.cswp").expect("parse");
        assert!(sections.function.is_some());
        assert!(sections.type_.is_some());
        assert!(sections.string.is_some());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = minimal_file();
        data[0] = b'X';
        let err = parse_headers(&data, "t.cswp").unwrap_err();
        assert!(err.message.contains("magic"), "{}", err.message);
    }

    #[test]
    fn rejects_bad_version_and_word_size() {
        let mut data = minimal_file();
        data[4] = 9;
        assert!(parse_headers(&data, "t").is_err());
        let mut data = minimal_file();
        data[5] = 4;
        assert!(parse_headers(&data, "t").is_err());
    }

    #[test]
    fn rejects_duplicate_sections() {
        let mut data = minimal_file();
        // Turn the TYPE header into a second FUNCTION header.
        let at = FILE_HEADER_SIZE + SECTION_HEADER_SIZE;
        data[at..at + 4].copy_from_slice(&section_kind::FUNCTION.to_le_bytes());
        let err = parse_headers(&data, "t").unwrap_err();
        assert!(err.message.contains("duplicate"), "{}", err.message);
    }

    #[test]
    fn rejects_gaps_between_sections() {
        let mut data = minimal_file();
        // Claim the second section starts later than the first one ends.
        let at = FILE_HEADER_SIZE + SECTION_HEADER_SIZE + 4;
        let bogus = (data.len() as u64 + 8).to_le_bytes();
        data[at..at + 8].copy_from_slice(&bogus);
        assert!(parse_headers(&data, "t").is_err());
    }

    #[test]
    fn function_entry_round_trips() {
        let entry = FunctionEntry {
            name_index: 3,
            param_type_offset: 10,
            param_type_count: 2,
            return_type_offset: 12,
            return_type_count: 1,
            inst_offset: 200,
            inst_size: 40,
            safepoint_offset: 240,
            safepoint_count: 2,
            frame_size: 7,
        };
        let mut buf = vec![0u8; FUNCTION_ENTRY_SIZE];
        Writer::new(&mut buf).put_function_entry(&entry);
        let back = FunctionEntry::parse(&buf, 0).expect("parse");
        assert_eq!(back.name_index, 3);
        assert_eq!(back.param_type_offset, 10);
        assert_eq!(back.param_type_count, 2);
        assert_eq!(back.return_type_offset, 12);
        assert_eq!(back.return_type_count, 1);
        assert_eq!(back.inst_offset, 200);
        assert_eq!(back.inst_size, 40);
        assert_eq!(back.safepoint_offset, 240);
        assert_eq!(back.safepoint_count, 2);
        assert_eq!(back.frame_size, 7);
    }
}
