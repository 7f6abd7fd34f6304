use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};

pub const PAGE_SIZE: usize = 4096;

/// Bit 63 of a page-table entry: the page is resident.
pub const PM_PRESENT: u64 = 1 << 63;

/// Characters per line of the verbose page map.
pub const MAP_LINE_LEN: usize = 32;

pub const IMAGE_MAGIC: [u8; 4] = *b"SIMG";
pub const UNIT_MAGIC: [u8; 4] = *b"SUNT";

/// File suffix identifying a mapped bytecode image.
pub const IMAGE_SUFFIX: &str = ".simg";

/// Section types of a serialized bytecode image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    Header,
    StringIds,
    TypeIds,
    ProtoIds,
    FieldIds,
    MethodIds,
    ClassDefs,
    ClassData,
    Code,
    StringData,
    DebugInfo,
}

impl SectionKind {
    pub const ALL: [SectionKind; 11] = [
        SectionKind::Header,
        SectionKind::StringIds,
        SectionKind::TypeIds,
        SectionKind::ProtoIds,
        SectionKind::FieldIds,
        SectionKind::MethodIds,
        SectionKind::ClassDefs,
        SectionKind::ClassData,
        SectionKind::Code,
        SectionKind::StringData,
        SectionKind::DebugInfo,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::Header => "Header",
            SectionKind::StringIds => "StringId",
            SectionKind::TypeIds => "TypeId",
            SectionKind::ProtoIds => "ProtoId",
            SectionKind::FieldIds => "FieldId",
            SectionKind::MethodIds => "MethodId",
            SectionKind::ClassDefs => "ClassDef",
            SectionKind::ClassData => "ClassData",
            SectionKind::Code => "Code",
            SectionKind::StringData => "StringData",
            SectionKind::DebugInfo => "DebugInfo",
        }
    }

    #[must_use]
    pub fn letter(self) -> char {
        match self {
            SectionKind::Header => 'H',
            SectionKind::StringIds => 'S',
            SectionKind::TypeIds => 'T',
            SectionKind::ProtoIds => 'P',
            SectionKind::FieldIds => 'F',
            SectionKind::MethodIds => 'M',
            SectionKind::ClassDefs => 'C',
            SectionKind::ClassData => 'c',
            SectionKind::Code => 'X',
            SectionKind::StringData => 's',
            SectionKind::DebugInfo => 'D',
        }
    }

    #[must_use]
    pub fn raw(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_raw(raw: u16) -> Option<SectionKind> {
        Self::ALL.iter().copied().find(|k| k.raw() == raw)
    }
}

/// One section of one bytecode unit; offsets are relative to the unit
/// start. Section types this tool does not know keep their raw id and
/// render as unattributed.
#[derive(Debug, Copy, Clone)]
pub struct ImageSection {
    pub raw_kind: u16,
    pub offset: u64,
    pub size: u64,
}

impl ImageSection {
    #[must_use]
    pub fn kind(&self) -> Option<SectionKind> {
        SectionKind::from_raw(self.raw_kind)
    }
}

/// Attribution scans want the highest-offset match first.
pub fn sort_sections_descending(sections: &mut [ImageSection]) {
    sections.sort_by(|a, b| b.offset.cmp(&a.offset));
}

/// Attributes a unit-relative page to the highest-offset non-empty
/// section starting at or before it. Pages ahead of every such section
/// belong to the header.
#[must_use]
pub fn section_for_page(page: u64, sections_desc: &[ImageSection]) -> u16 {
    for s in sections_desc {
        if s.size == 0 {
            continue;
        }
        if s.offset / PAGE_SIZE as u64 <= page {
            return s.raw_kind;
        }
    }
    SectionKind::Header.raw()
}

#[must_use]
pub fn page_type_char(raw: u16) -> char {
    match SectionKind::from_raw(raw) {
        Some(kind) => kind.letter(),
        None => '-',
    }
}

/// Per-section page tally. Known section types start out at zero so the
/// statistics table always has every row.
#[derive(Debug)]
pub struct PageCounts {
    map: BTreeMap<u16, u64>,
}

impl Default for PageCounts {
    fn default() -> Self {
        Self::new()
    }
}

impl PageCounts {
    #[must_use]
    pub fn new() -> Self {
        let mut map = BTreeMap::new();
        for kind in SectionKind::ALL {
            map.insert(kind.raw(), 0);
        }
        Self { map }
    }

    pub fn increment(&mut self, raw: u16) {
        *self.map.entry(raw).or_insert(0) += 1;
    }

    #[must_use]
    pub fn get(&self, raw: u16) -> u64 {
        self.map.get(&raw).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.map.values().sum()
    }
}

/// Walks a unit's page-table entries, tallying resident pages into
/// `counts` and, when `verbose`, appending the page character map to
/// `out` in `MAP_LINE_LEN`-character lines.
pub fn process_page_map(
    out: &mut String,
    entries: &[u64],
    sections_desc: &[ImageSection],
    counts: &mut PageCounts,
    verbose: bool,
) {
    for (page, entry) in entries.iter().enumerate() {
        let mut ch = '.';
        if entry & PM_PRESENT != 0 {
            let raw = section_for_page(page as u64, sections_desc);
            counts.increment(raw);
            ch = page_type_char(raw);
        }
        if verbose {
            out.push(ch);
            if page % MAP_LINE_LEN == MAP_LINE_LEN - 1 {
                out.push('\n');
            }
        }
    }
    if verbose && !entries.len().is_multiple_of(MAP_LINE_LEN) {
        out.push('\n');
    }
}

/// Appends the per-section residency table for one unit: resident pages,
/// mapped pages, percent of the section and percent of the whole unit,
/// closed by a grand-total row.
pub fn render_statistics(
    out: &mut String,
    num_pages: u64,
    resident: &PageCounts,
    sections_desc: &[ImageSection],
) {
    if num_pages == 0 {
        return;
    }
    let mut mapped = PageCounts::new();
    for page in 0..num_pages {
        mapped.increment(section_for_page(page, sections_desc));
    }

    let name_width = SectionKind::ALL
        .iter()
        .map(|k| k.name().len())
        .max()
        .unwrap_or(0)
        .max("Section name".len());
    let _ = writeln!(
        out,
        "{:<name_width$} {:>10} {:>10} % of   % of",
        "Section name", "resident", "total"
    );
    let _ = writeln!(
        out,
        "{:<name_width$} {:>10} {:>10} sect.  total",
        "", "pages", "pages"
    );

    // Lowest offset first; the scan order is descending.
    for section in sections_desc.iter().rev() {
        let Some(kind) = section.kind() else {
            continue;
        };
        let res = resident.get(section.raw_kind);
        let map = mapped.get(section.raw_kind);
        let pct_sect = if map > 0 {
            100.0 * res as f64 / map as f64
        } else {
            0.0
        };
        let pct_total = 100.0 * res as f64 / num_pages as f64;
        let _ = writeln!(
            out,
            "{:<name_width$} {:>10} {:>10} {:6.2} {:6.2}",
            kind.name(),
            res,
            map,
            pct_sect,
            pct_total
        );
    }
    let total_res = resident.total();
    let _ = writeln!(
        out,
        "{:<name_width$} {:>10} {:>10}        {:6.2}",
        "GRAND TOTAL",
        total_res,
        num_pages,
        100.0 * total_res as f64 / num_pages as f64
    );
    let _ = writeln!(out);
}

/// Appends the legend explaining the verbose page map letters.
pub fn render_letter_key(out: &mut String) {
    let _ = writeln!(out, "letter section_type");
    for kind in SectionKind::ALL {
        let _ = writeln!(out, "{}      {}", kind.letter(), kind.name());
    }
}

/// One bytecode unit inside an image container; offsets are relative to
/// the container start.
#[derive(Debug, Copy, Clone)]
pub struct ImageUnit {
    pub offset: u64,
    pub size: u64,
}

fn bad_data(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}

/// Reads the container header: magic and the table of contained units.
pub fn read_image_units(r: &mut impl Read) -> io::Result<Vec<ImageUnit>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != IMAGE_MAGIC {
        return Err(bad_data("not a bytecode image container"));
    }
    let count = r.read_u32::<LittleEndian>()?;
    let mut units = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = r.read_u64::<LittleEndian>()?;
        let size = r.read_u64::<LittleEndian>()?;
        units.push(ImageUnit { offset, size });
    }
    Ok(units)
}

/// Reads one unit's section table.
pub fn read_unit_sections(r: &mut impl Read) -> io::Result<Vec<ImageSection>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != UNIT_MAGIC {
        return Err(bad_data("not a bytecode unit header"));
    }
    let count = r.read_u16::<LittleEndian>()?;
    let mut sections = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw_kind = r.read_u16::<LittleEndian>()?;
        let offset = r.read_u64::<LittleEndian>()?;
        let size = r.read_u64::<LittleEndian>()?;
        sections.push(ImageSection {
            raw_kind,
            offset,
            size,
        });
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn section(kind: SectionKind, offset: u64, size: u64) -> ImageSection {
        ImageSection {
            raw_kind: kind.raw(),
            offset,
            size,
        }
    }

    fn three_section_unit() -> Vec<ImageSection> {
        let mut sections = vec![
            section(SectionKind::Header, 0, 0x1000),
            section(SectionKind::StringData, 0x2000, 0x3000),
            section(SectionKind::Code, 0x5000, 0x1000),
        ];
        sort_sections_descending(&mut sections);
        sections
    }

    #[test]
    fn pages_attribute_to_the_highest_section_at_or_below() {
        let sections = three_section_unit();
        assert_eq!(section_for_page(0, &sections), SectionKind::Header.raw());
        assert_eq!(section_for_page(1, &sections), SectionKind::Header.raw());
        assert_eq!(
            section_for_page(2, &sections),
            SectionKind::StringData.raw()
        );
        assert_eq!(
            section_for_page(4, &sections),
            SectionKind::StringData.raw()
        );
        assert_eq!(section_for_page(5, &sections), SectionKind::Code.raw());
        assert_eq!(section_for_page(9, &sections), SectionKind::Code.raw());
    }

    #[test]
    fn empty_sections_never_claim_pages() {
        let mut sections = vec![
            section(SectionKind::Header, 0, 0x40),
            section(SectionKind::Code, 0x3000, 0),
        ];
        sort_sections_descending(&mut sections);
        assert_eq!(
            section_for_page(3, &sections),
            SectionKind::Header.raw(),
            "the empty section is invisible to attribution"
        );
    }

    #[test]
    fn pages_ahead_of_every_section_fall_back_to_the_header() {
        let mut sections = vec![section(SectionKind::Code, 0x3000, 0x1000)];
        sort_sections_descending(&mut sections);
        assert_eq!(section_for_page(1, &sections), SectionKind::Header.raw());
    }

    #[test]
    fn resident_pages_attribute_and_sum_to_the_grand_total() {
        // A unit of 8 pages with pages 0, 2 and 5 resident.
        let sections = three_section_unit();
        let mut entries = vec![0u64; 8];
        entries[0] = PM_PRESENT;
        entries[2] = PM_PRESENT | 0x1234;
        entries[5] = PM_PRESENT;

        let mut counts = PageCounts::new();
        let mut out = String::new();
        process_page_map(&mut out, &entries, &sections, &mut counts, false);

        assert_eq!(counts.get(SectionKind::Header.raw()), 1);
        assert_eq!(counts.get(SectionKind::StringData.raw()), 1);
        assert_eq!(counts.get(SectionKind::Code.raw()), 1);
        assert_eq!(counts.total(), 3, "per-section counts sum to the total");
        assert!(out.is_empty(), "nothing rendered without the verbose flag");
    }

    #[test]
    fn verbose_map_renders_dots_letters_and_line_breaks() {
        let sections = three_section_unit();
        let mut entries = vec![0u64; 40];
        entries[0] = PM_PRESENT;
        entries[5] = PM_PRESENT;
        entries[33] = PM_PRESENT;

        let mut counts = PageCounts::new();
        let mut out = String::new();
        process_page_map(&mut out, &entries, &sections, &mut counts, true);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAP_LINE_LEN);
        assert_eq!(lines[1].len(), 8);
        assert!(lines[0].starts_with("H....X"));
        assert_eq!(&lines[1][1..2], "X", "page 33 is resident code");
    }

    #[test]
    fn statistics_close_with_a_grand_total_row() {
        let sections = three_section_unit();
        let mut counts = PageCounts::new();
        counts.increment(SectionKind::Header.raw());
        counts.increment(SectionKind::Code.raw());

        let mut out = String::new();
        render_statistics(&mut out, 8, &counts, &sections);
        assert!(out.contains("Section name"));
        assert!(out.contains("Header"));
        assert!(out.contains("GRAND TOTAL"));
        let grand = out
            .lines()
            .find(|l| l.starts_with("GRAND TOTAL"))
            .expect("a grand total row");
        assert!(grand.contains(" 2 "), "2 resident pages in total: {grand}");
        assert!(grand.contains(" 8 "), "8 mapped pages in total: {grand}");
    }

    #[test]
    fn unknown_section_kinds_render_unattributed() {
        assert_eq!(page_type_char(0xBEEF), '-');
        assert_eq!(page_type_char(SectionKind::Code.raw()), 'X');
    }

    #[test]
    fn container_and_unit_headers_roundtrip() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_MAGIC);
        bytes.write_u32::<LittleEndian>(1).unwrap();
        bytes.write_u64::<LittleEndian>(0x40).unwrap();
        bytes.write_u64::<LittleEndian>(0x2000).unwrap();

        let units = read_image_units(&mut bytes.as_slice()).expect("a valid container");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].offset, 0x40);
        assert_eq!(units[0].size, 0x2000);

        let mut unit = Vec::new();
        unit.extend_from_slice(&UNIT_MAGIC);
        unit.write_u16::<LittleEndian>(2).unwrap();
        for (kind, off, size) in [
            (SectionKind::Header.raw(), 0u64, 0x200u64),
            (SectionKind::Code.raw(), 0x1000, 0x800),
        ] {
            unit.write_u16::<LittleEndian>(kind).unwrap();
            unit.write_u64::<LittleEndian>(off).unwrap();
            unit.write_u64::<LittleEndian>(size).unwrap();
        }
        let sections = read_unit_sections(&mut unit.as_slice()).expect("a valid unit");
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].kind(), Some(SectionKind::Code));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = b"NOPE\x00\x00\x00\x00";
        assert!(read_image_units(&mut bytes.as_slice()).is_err());
    }
}
