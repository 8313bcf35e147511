//! Packages: section-oriented binary files, memory-mapped and materialized
//! on demand.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use tracing::debug;

use memory::Handle;

use crate::error::{Error, FileError};
use crate::function::Function;
use crate::roots::roots;
use crate::safepoints::{self, Safepoints};
use crate::serial::{
    self, section_kind, FunctionEntry, SectionHeader, Sections, Writer,
    FILE_HEADER_SIZE, FUNCTION_ENTRY_SIZE, SECTION_HEADER_SIZE,
    STRING_ENTRY_SIZE,
};
use crate::string::VmString;
use crate::types::{Type, TypeKind};

#[derive(Debug)]
struct PackageData {
    functions: Vec<Option<Handle<Function>>>,
    types: Vec<Option<Handle<Type>>>,
    strings: Vec<Option<Handle<VmString>>>,
    by_name: Option<HashMap<String, u32>>,
}

/// A loaded package. File-backed packages keep their mapping alive and
/// materialize entries lazily under the package lock; packages built by
/// the text assembler are born fully materialized with no backing file.
#[derive(Debug)]
pub struct Package {
    path: String,
    file: Option<Mmap>,
    sections: Sections,
    inner: Mutex<PackageData>,
}

impl Package {
    /// Memory-map `path` read-only and validate its headers. No entries
    /// are materialized yet.
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Package, Error> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        let file = std::fs::File::open(path).map_err(|e| {
            FileError::new(&path_str, format!("cannot open: {e}"))
        })?;
        // SAFETY: the mapping is read-only; mutating the file underneath a
        // running VM is outside the supported contract.
        let map = unsafe {
            Mmap::map(&file).map_err(|e| {
                FileError::new(&path_str, format!("cannot map: {e}"))
            })?
        };

        let sections = serial::parse_headers(&map, &path_str)?;
        let function_count =
            sections.function.map_or(0, |s| s.entry_count as usize);
        let type_count = sections.type_.map_or(0, |s| s.entry_count as usize);
        let string_count =
            sections.string.map_or(0, |s| s.entry_count as usize);
        debug!(
            target: "package",
            path = %path_str, function_count, type_count, string_count,
            "package mapped"
        );

        Ok(Package {
            path: path_str,
            file: Some(map),
            sections,
            inner: Mutex::new(PackageData {
                functions: vec![None; function_count],
                types: vec![None; type_count],
                strings: vec![None; string_count],
                by_name: None,
            }),
        })
    }

    /// Wrap fully materialized functions (the text assembler's output).
    pub fn from_functions(
        path: impl Into<String>,
        functions: Vec<Handle<Function>>,
    ) -> Package {
        Package {
            path: path.into(),
            file: None,
            sections: Sections::default(),
            inner: Mutex::new(PackageData {
                functions: functions.into_iter().map(Some).collect(),
                types: Vec::new(),
                strings: Vec::new(),
                by_name: None,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn function_count(&self) -> usize {
        self.inner.lock().functions.len()
    }

    /// The function at `index`, materializing it from the mapped file on
    /// first request.
    pub fn function_by_index(
        &self,
        index: u32,
    ) -> Result<Handle<Function>, Error> {
        let mut data = self.inner.lock();
        self.function_by_index_locked(&mut data, index)
    }

    /// Look a function up by name. The name map is populated on first use
    /// by materializing every function.
    pub fn function_by_name(
        &self,
        name: &str,
    ) -> Result<Option<Handle<Function>>, Error> {
        let mut data = self.inner.lock();
        if data.by_name.is_none() {
            for i in 0..data.functions.len() {
                self.function_by_index_locked(&mut data, i as u32)?;
            }
            let mut map = HashMap::new();
            for (i, f) in data.functions.iter().enumerate() {
                let f = f.as_ref().expect("materialized above");
                map.insert(f.name().as_str().to_string(), i as u32);
            }
            data.by_name = Some(map);
        }
        let index = match data.by_name.as_ref().expect("built above").get(name)
        {
            Some(&index) => index,
            None => return Ok(None),
        };
        self.function_by_index_locked(&mut data, index).map(Some)
    }

    /// Materialize every function and return the handles in index order.
    pub fn functions(&self) -> Result<Vec<Handle<Function>>, Error> {
        let mut data = self.inner.lock();
        (0..data.functions.len() as u32)
            .map(|i| self.function_by_index_locked(&mut data, i))
            .collect()
    }

    /// Verify every function, annotating failures with this file's path.
    pub fn validate(&self) -> Result<(), Error> {
        let functions = self.functions()?;
        for function in &functions {
            function.validate(self).map_err(|mut e| {
                e.filename = self.path.clone();
                e
            })?;
        }
        Ok(())
    }

    // ── lazy materialization ───────────────────────────────────────

    fn file_error(&self, message: String) -> Error {
        Error::File(FileError::new(&self.path, message))
    }

    fn function_by_index_locked(
        &self,
        data: &mut PackageData,
        index: u32,
    ) -> Result<Handle<Function>, Error> {
        match data.functions.get(index as usize) {
            Some(Some(cached)) => return Ok(cached.clone()),
            Some(None) => {}
            None => {
                return Err(self.file_error(format!(
                    "function index {index} out of range"
                )))
            }
        }

        let section = self.sections.function.ok_or_else(|| {
            self.file_error("package has no function section".to_string())
        })?;
        let file = self.file.as_ref().ok_or_else(|| {
            self.file_error("package has no backing file".to_string())
        })?;
        let section_bytes = &file[section.offset as usize
            ..(section.offset + section.size) as usize];

        let entry_at = index as usize * section.entry_size as usize;
        let entry = FunctionEntry::parse(section_bytes, entry_at)
            .ok_or_else(|| {
                self.file_error(format!("function entry {index} truncated"))
            })?;

        let name = self.string_by_index_locked(data, entry.name_index)?;
        let params = self.type_list_locked(
            data,
            entry.param_type_offset,
            entry.param_type_count,
        )?;
        let returns = self.type_list_locked(
            data,
            entry.return_type_offset,
            entry.return_type_count,
        )?;

        // Copy instruction and safepoint bytes out of the mapped file into
        // heap blocks, so execution never depends on the mapping staying
        // around.
        let insts = section_bytes
            .get(
                entry.inst_offset as usize
                    ..entry.inst_offset as usize + entry.inst_size as usize,
            )
            .ok_or_else(|| {
                self.file_error(format!(
                    "function {index} instructions out of range"
                ))
            })?;
        let sp_len = entry.safepoint_count as usize
            * safepoints::entry_size(entry.frame_size);
        let sp_bytes = section_bytes
            .get(
                entry.safepoint_offset as usize
                    ..entry.safepoint_offset as usize + sp_len,
            )
            .ok_or_else(|| {
                self.file_error(format!(
                    "function {index} safepoints out of range"
                ))
            })?;
        let safepoints = Safepoints::from_bytes(
            entry.frame_size,
            entry.safepoint_count,
            sp_bytes,
        )
        .map_err(Error::Alloc)?;

        let function = Function::create(
            &name,
            &params,
            &returns,
            insts,
            Some(&safepoints),
            entry.frame_size,
        )
        .map_err(Error::Alloc)?;
        debug!(
            target: "package",
            path = %self.path, index, name = %name.as_str(),
            "function materialized"
        );
        data.functions[index as usize] = Some(function.clone());
        Ok(function)
    }

    fn string_by_index_locked(
        &self,
        data: &mut PackageData,
        index: u32,
    ) -> Result<Handle<VmString>, Error> {
        match data.strings.get(index as usize) {
            Some(Some(cached)) => return Ok(cached.clone()),
            Some(None) => {}
            None => {
                return Err(self.file_error(format!(
                    "string index {index} out of range"
                )))
            }
        }

        let section = self.sections.string.ok_or_else(|| {
            self.file_error("package has no string section".to_string())
        })?;
        let file = self.file.as_ref().expect("file-backed entries");
        let section_bytes = &file[section.offset as usize
            ..(section.offset + section.size) as usize];

        let entry_at = index as usize * section.entry_size as usize;
        let offset = serial::read_u64(section_bytes, entry_at).ok_or_else(
            || self.file_error(format!("string entry {index} truncated")),
        )?;
        let size = serial::read_u64(section_bytes, entry_at + 8).ok_or_else(
            || self.file_error(format!("string entry {index} truncated")),
        )?;
        let bytes = section_bytes
            .get(offset as usize..(offset + size) as usize)
            .ok_or_else(|| {
                self.file_error(format!("string {index} data out of range"))
            })?;
        let s = std::str::from_utf8(bytes).map_err(|_| {
            self.file_error(format!("string {index} is not valid UTF-8"))
        })?;

        let handle = VmString::create(s).map_err(Error::Alloc)?;
        data.strings[index as usize] = Some(handle.clone());
        Ok(handle)
    }

    fn type_list_locked(
        &self,
        data: &mut PackageData,
        offset: u64,
        count: u32,
    ) -> Result<Vec<Handle<Type>>, Error> {
        (0..count)
            .map(|i| self.type_by_offset_locked(data, offset + i as u64))
            .collect()
    }

    fn type_by_offset_locked(
        &self,
        data: &mut PackageData,
        offset: u64,
    ) -> Result<Handle<Type>, Error> {
        match data.types.get(offset as usize) {
            Some(Some(cached)) => return Ok(cached.clone()),
            Some(None) => {}
            None => {
                return Err(self.file_error(format!(
                    "type offset {offset} out of range"
                )))
            }
        }

        let section = self.sections.type_.ok_or_else(|| {
            self.file_error("package has no type section".to_string())
        })?;
        let file = self.file.as_ref().expect("file-backed entries");
        let byte = file[(section.offset + offset) as usize];
        let kind = TypeKind::from_u8(byte).ok_or_else(|| {
            self.file_error(format!(
                "unknown type kind {byte} at type offset {offset}"
            ))
        })?;

        let handle = roots().canonical(kind).clone();
        data.types[offset as usize] = Some(handle.clone());
        Ok(handle)
    }

    // ── serialization ──────────────────────────────────────────────

    /// Serialize the package: dedupe strings, linearize type lists and
    /// per-function instruction and safepoint data, then write the header,
    /// section headers, and sections into a fixed-size mapped output file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let path_str = path.display().to_string();
        // Normalize the internal lists before taking the lock for layout.
        let functions = self.functions()?;

        // Deduplicate strings into a list plus a byte blob.
        let mut string_list: Vec<String> = Vec::new();
        let mut string_index: HashMap<String, u32> = HashMap::new();
        for f in &functions {
            let name = f.name().as_str().to_string();
            if !string_index.contains_key(&name) {
                string_index.insert(name.clone(), string_list.len() as u32);
                string_list.push(name);
            }
        }
        let string_entries_size = string_list.len() * STRING_ENTRY_SIZE;
        let mut string_blob: Vec<u8> = Vec::new();
        let string_entries: Vec<(u64, u64)> = string_list
            .iter()
            .map(|s| {
                let at = (string_entries_size + string_blob.len()) as u64;
                string_blob.extend_from_slice(s.as_bytes());
                (at, s.len() as u64)
            })
            .collect();

        // Linearize type lists and function data, remembering offsets.
        let mut type_blob: Vec<u8> = Vec::new();
        let mut fn_blob: Vec<u8> = Vec::new();
        let fn_entries_size = functions.len() * FUNCTION_ENTRY_SIZE;
        let mut entries: Vec<FunctionEntry> = Vec::new();
        for f in &functions {
            let param_type_offset = type_blob.len() as u64;
            for i in 0..f.param_types().len() {
                type_blob.push(f.param_kind(i) as u8);
            }
            let return_type_offset = type_blob.len() as u64;
            for i in 0..f.return_types().len() {
                type_blob.push(f.return_kind(i) as u8);
            }

            let inst_offset = (fn_entries_size + fn_blob.len()) as u64;
            fn_blob.extend_from_slice(f.insts());
            while fn_blob.len() % 4 != 0 {
                fn_blob.push(0);
            }
            let safepoint_offset = (fn_entries_size + fn_blob.len()) as u64;
            let (safepoint_count, frame_size) = match f.safepoints() {
                Some(sp) => {
                    fn_blob.extend_from_slice(sp.entry_bytes());
                    (sp.count() as u32, sp.frame_size())
                }
                None => (0, f.frame_size() as u16),
            };

            entries.push(FunctionEntry {
                name_index: string_index[f.name().as_str()],
                param_type_offset,
                param_type_count: f.param_types().len() as u32,
                return_type_offset,
                return_type_count: f.return_types().len() as u32,
                inst_offset,
                inst_size: f.insts().len() as u32,
                safepoint_offset,
                safepoint_count,
                frame_size,
            });
        }

        // Compute the section layout.
        let fn_section_size = (fn_entries_size + fn_blob.len()) as u64;
        let type_section_size = type_blob.len() as u64;
        let string_section_size =
            (string_entries_size + string_blob.len()) as u64;
        let fn_offset = (FILE_HEADER_SIZE + 3 * SECTION_HEADER_SIZE) as u64;
        let type_offset = fn_offset + fn_section_size;
        let string_offset = type_offset + type_section_size;
        let file_size = (string_offset + string_section_size) as usize;

        // Create a fixed-size mapped output file and write everything.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                FileError::new(&path_str, format!("cannot create: {e}"))
            })?;
        file.set_len(file_size as u64).map_err(|e| {
            FileError::new(&path_str, format!("cannot resize: {e}"))
        })?;
        // SAFETY: the file was just created and is exclusively ours.
        let mut map = unsafe {
            MmapOptions::new().map_mut(&file).map_err(|e| {
                FileError::new(&path_str, format!("cannot map: {e}"))
            })?
        };

        let mut w = Writer::new(&mut map);
        w.put_u32(serial::MAGIC);
        w.put_u8(serial::VERSION);
        w.put_u8(serial::WORD_SIZE);
        w.put_u16(3);
        w.put_section_header(&SectionHeader {
            kind: section_kind::FUNCTION,
            offset: fn_offset,
            size: fn_section_size,
            entry_count: functions.len() as u32,
            entry_size: FUNCTION_ENTRY_SIZE as u32,
        });
        w.put_section_header(&SectionHeader {
            kind: section_kind::TYPE,
            offset: type_offset,
            size: type_section_size,
            entry_count: type_blob.len() as u32,
            entry_size: 1,
        });
        w.put_section_header(&SectionHeader {
            kind: section_kind::STRING,
            offset: string_offset,
            size: string_section_size,
            entry_count: string_list.len() as u32,
            entry_size: STRING_ENTRY_SIZE as u32,
        });
        for entry in &entries {
            w.put_function_entry(entry);
        }
        w.put_bytes(&fn_blob);
        w.put_bytes(&type_blob);
        for (offset, size) in &string_entries {
            w.put_u64(*offset);
            w.put_u64(*size);
        }
        w.put_bytes(&string_blob);
        assert_eq!(w.pos(), file_size, "write position != computed size");

        map.flush().map_err(|e| {
            FileError::new(&path_str, format!("cannot flush: {e}"))
        })?;
        Ok(())
    }
}
