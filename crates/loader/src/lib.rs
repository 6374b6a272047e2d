// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{anyhow, bail, Context, Result};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use object::{Object, ObjectSymbol};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use vp_core::memory::ProgramImage;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Loads a kernel image. ELF files are placed at their physical segment
/// addresses; anything else is treated as a raw binary at `load_addr`.
pub fn load_kernel(path: &Path, load_addr: u64) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read kernel image {:?}", path))?;
    if buffer.starts_with(ELF_MAGIC) {
        if load_addr != 0 {
            debug!("Ignoring load address {:#x} for ELF image", load_addr);
        }
        load_elf_bytes(&buffer).with_context(|| format!("Invalid ELF image {:?}", path))
    } else {
        load_raw_bytes(buffer, load_addr)
    }
}

pub fn load_elf(path: &Path) -> Result<ProgramImage> {
    let buffer = fs::read(path).with_context(|| format!("Failed to read ELF file: {:?}", path))?;
    load_elf_bytes(&buffer)
}

pub fn load_elf_bytes(buffer: &[u8]) -> Result<ProgramImage> {
    let elf = Elf::parse(buffer).context("Failed to parse ELF binary")?;

    info!("ELF Entry Point: {:#x}", elf.entry);
    if elf.header.e_machine != goblin::elf::header::EM_RISCV {
        warn!(
            "ELF machine type {} is not RISC-V, the image may not execute",
            elf.header.e_machine
        );
    }
    if elf.is_64 {
        warn!("64-bit ELF image on a 32-bit platform");
    }

    let mut image = ProgramImage::new(elf.entry);

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }
        let start_addr = ph.p_paddr;
        let size = ph.p_filesz as usize;
        let offset = ph.p_offset as usize;

        debug!(
            "Loadable segment: addr={:#x}, file={} bytes, mem={} bytes, offset={:#x}",
            start_addr, size, ph.p_memsz, offset
        );

        let end = offset
            .checked_add(size)
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| anyhow!("Segment at {:#x} out of bounds in ELF file", start_addr))?;

        let mut data = buffer[offset..end].to_vec();
        // Zero-initialized tail (.bss).
        if ph.p_memsz > ph.p_filesz {
            let memsz = usize::try_from(ph.p_memsz)
                .map_err(|_| anyhow!("Segment at {:#x} is too large", start_addr))?;
            data.resize(memsz, 0);
        }
        image.add_segment(start_addr, data);
    }

    if image.segments.is_empty() {
        warn!("No loadable segments found in ELF file");
    }

    Ok(image)
}

pub fn load_raw_bytes(data: Vec<u8>, load_addr: u64) -> Result<ProgramImage> {
    if data.is_empty() {
        bail!("Raw image is empty");
    }
    info!("Raw image: {} bytes at {:#x}", data.len(), load_addr);
    let mut image = ProgramImage::new(load_addr);
    image.add_segment(load_addr, data);
    Ok(image)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Symbol {
    name: String,
    addr: u64,
    size: u64,
}

/// A symbol name plus the offset of an address into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolRef<'a> {
    pub name: &'a str,
    pub offset: u64,
}

impl fmt::Display for SymbolRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}+{:#x}", self.name, self.offset)
        }
    }
}

/// Address-sorted symbol table read from an ELF symbol file.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("Failed to read ELF for symbols: {:?}", path))?;
        Self::from_bytes(&data).with_context(|| format!("Failed to load symbols from {:?}", path))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let file = object::File::parse(data).context("Failed to parse ELF for symbols")?;
        let mut symbols: Vec<Symbol> = file
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                (!name.is_empty() && sym.address() > 0).then(|| Symbol {
                    name: name.to_string(),
                    addr: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();
        symbols.sort_by(|a, b| a.addr.cmp(&b.addr).then_with(|| b.size.cmp(&a.size)));
        debug!("Loaded {} symbols", symbols.len());
        Ok(Self { symbols })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.iter().find(|s| s.name == name).map(|s| s.addr)
    }

    /// The symbol containing `addr`, or failing that the closest one below it.
    pub fn nearest(&self, addr: u64) -> Option<SymbolRef<'_>> {
        let idx = self.symbols.partition_point(|s| s.addr <= addr);
        let below = &self.symbols[..idx];
        let sym = below
            .iter()
            .rev()
            .find(|s| s.size > 0 && addr < s.addr + s.size)
            .or_else(|| below.last())?;
        Some(SymbolRef {
            name: &sym.name,
            offset: addr - sym.addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Seg {
        paddr: u32,
        data: Vec<u8>,
        memsz: u32,
    }

    fn put16(b: &mut Vec<u8>, v: u16) {
        b.extend_from_slice(&v.to_le_bytes());
    }

    fn put32(b: &mut Vec<u8>, v: u32) {
        b.extend_from_slice(&v.to_le_bytes());
    }

    fn align4(b: &mut Vec<u8>) {
        while b.len() % 4 != 0 {
            b.push(0);
        }
    }

    /// Minimal little-endian ELF32 RISC-V executable with an absolute symbol table.
    fn elf32(entry: u32, segs: &[Seg], syms: &[(&str, u32, u32)]) -> Vec<u8> {
        let phoff = 52u32;
        let mut body = Vec::new();
        let data_start = phoff as usize + 32 * segs.len();

        let mut seg_offsets = Vec::new();
        for s in segs {
            seg_offsets.push((data_start + body.len()) as u32);
            body.extend_from_slice(&s.data);
            align4(&mut body);
        }

        let mut strtab = vec![0u8];
        let mut symtab = vec![0u8; 16];
        for (name, value, size) in syms {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
            put32(&mut symtab, name_off);
            put32(&mut symtab, *value);
            put32(&mut symtab, *size);
            symtab.push(0x12); // GLOBAL FUNC
            symtab.push(0);
            put16(&mut symtab, 0xFFF1); // SHN_ABS
        }
        let shstrtab = b"\0.symtab\0.strtab\0.shstrtab\0".to_vec();

        let symtab_off = (data_start + body.len()) as u32;
        body.extend_from_slice(&symtab);
        let strtab_off = (data_start + body.len()) as u32;
        body.extend_from_slice(&strtab);
        let shstrtab_off = (data_start + body.len()) as u32;
        body.extend_from_slice(&shstrtab);
        align4(&mut body);
        let shoff = (data_start + body.len()) as u32;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        put16(&mut out, 2); // ET_EXEC
        put16(&mut out, 243); // EM_RISCV
        put32(&mut out, 1);
        put32(&mut out, entry);
        put32(&mut out, phoff);
        put32(&mut out, shoff);
        put32(&mut out, 0);
        put16(&mut out, 52);
        put16(&mut out, 32);
        put16(&mut out, segs.len() as u16);
        put16(&mut out, 40);
        put16(&mut out, 4);
        put16(&mut out, 3);

        for (s, off) in segs.iter().zip(&seg_offsets) {
            put32(&mut out, 1); // PT_LOAD
            put32(&mut out, *off);
            put32(&mut out, s.paddr);
            put32(&mut out, s.paddr);
            put32(&mut out, s.data.len() as u32);
            put32(&mut out, s.memsz);
            put32(&mut out, 5);
            put32(&mut out, 4);
        }
        out.extend_from_slice(&body);

        let section = |out: &mut Vec<u8>, name, ty, off, size, link, info, entsize| {
            for v in [name, ty, 0, 0, off, size, link, info, 1, entsize] {
                put32(out, v);
            }
        };
        section(&mut out, 0, 0, 0, 0, 0, 0, 0);
        section(&mut out, 1, 2, symtab_off, symtab.len() as u32, 2, 1, 16);
        section(&mut out, 9, 3, strtab_off, strtab.len() as u32, 0, 0, 0);
        section(&mut out, 17, 3, shstrtab_off, shstrtab.len() as u32, 0, 0, 0);
        out
    }

    fn sample_elf() -> Vec<u8> {
        elf32(
            0x100,
            &[
                Seg {
                    paddr: 0x100,
                    data: vec![0x13, 0, 0, 0, 0x6f, 0, 0, 0],
                    memsz: 8,
                },
                Seg {
                    paddr: 0x2000,
                    data: vec![1, 2, 3, 4],
                    memsz: 12,
                },
            ],
            &[("_start", 0x100, 8), ("main", 0x104, 4), ("data", 0x2000, 0)],
        )
    }

    #[test]
    fn test_elf_segments_and_bss() {
        let image = load_elf_bytes(&sample_elf()).unwrap();
        assert_eq!(image.entry_point, 0x100);
        assert_eq!(image.segments.len(), 2);
        assert_eq!(image.segments[0].start_addr, 0x100);
        assert_eq!(image.segments[0].data, vec![0x13, 0, 0, 0, 0x6f, 0, 0, 0]);
        assert_eq!(image.segments[1].data, vec![1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_truncated_elf_is_rejected() {
        let elf = sample_elf();
        assert!(load_elf_bytes(&elf[..60]).is_err());
    }

    #[test]
    fn test_kernel_detects_format() {
        let mut elf = tempfile::NamedTempFile::new().unwrap();
        elf.write_all(&sample_elf()).unwrap();
        let image = load_kernel(elf.path(), 0x8000).unwrap();
        assert_eq!(image.segments[0].start_addr, 0x100);

        let mut raw = tempfile::NamedTempFile::new().unwrap();
        raw.write_all(&[0xAA; 16]).unwrap();
        let image = load_kernel(raw.path(), 0x8000).unwrap();
        assert_eq!(image.entry_point, 0x8000);
        assert_eq!(image.segments.len(), 1);
        assert_eq!(image.total_bytes(), 16);

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(load_kernel(empty.path(), 0).is_err());
        assert!(load_kernel(Path::new("/nonexistent/kernel"), 0).is_err());
    }

    #[test]
    fn test_symbol_lookup() {
        let table = SymbolTable::from_bytes(&sample_elf()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.resolve("main"), Some(0x104));
        assert_eq!(table.resolve("missing"), None);

        assert_eq!(table.nearest(0x100).unwrap().to_string(), "_start");
        assert_eq!(table.nearest(0x104).unwrap().to_string(), "main");
        assert_eq!(table.nearest(0x106).unwrap().to_string(), "main+0x2");
        // Past every sized symbol: nearest one below.
        assert_eq!(table.nearest(0x2010).unwrap().to_string(), "data+0x10");
        assert!(table.nearest(0x80).is_none());
    }
}
