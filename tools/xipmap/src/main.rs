use {
    anyhow::{anyhow, bail, Context, Result},
    clap::{Arg, ArgAction, ArgMatches, Command},
    colored::*,
    goblin::elf::{program_header::PT_LOAD, Elf, ProgramHeader},
    log::{info, LevelFilter, Log, Metadata, Record},
    prettytable::{format, row, Cell, Row, Table},
    std::{
        fs,
        ops::Range,
        path::{Path, PathBuf},
        time::Instant,
    },
    xipram::{
        boot::{relocate_to_psram, LinearPageCursor, OutOfSpacePolicy, PageAllocator},
        image::FlashSegmentStarts,
        memory::Address,
        mm,
        platform::{esp32c5, esp32c61, esp32p4, PlatformLayout},
        sim::{HalOp, SimSoc},
        xip::{BoundaryMarkers, FixedMarkers, SegmentBounds},
        RegionConfigurator, SegmentKind, WriteProtection, XipConfig, XipSegments, XipState,
    },
};

// xipmap --elf /path/to/firmware.elf --irom-flash 0x10000 --drom-flash 0x20000
fn main() -> Result<()> {
    let matches = command().get_matches();

    ConsoleLogger::install(match matches.get_count("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    })?;

    let mut layout = match matches.get_one::<String>("platform").map(String::as_str) {
        Some("esp32c5") => esp32c5::LAYOUT,
        Some("esp32c61") => esp32c61::LAYOUT,
        _ => esp32p4::LAYOUT,
    };
    if let Some(page_size) = matches.get_one::<usize>("page-size") {
        layout = layout.with_page_size(*page_size);
    }
    layout.validate().map_err(|e| anyhow!(e))?;

    let firmware = FirmwareImage::load(firmware_path(&matches)?)?;
    firmware.check_against(&layout)?;

    let psram_size = *matches.get_one::<usize>("psram-size").unwrap_or(&0x80_0000);
    let start_page = *matches.get_one::<usize>("start-page").unwrap_or(&0);
    let starts = flash_starts(&matches)?;

    let segments = match matches.get_one::<String>("only").map(String::as_str) {
        Some("instructions") => XipSegments::INSTRUCTIONS,
        Some("rodata") => XipSegments::RODATA,
        _ => XipSegments::all(),
    };
    let write_protection = if matches.get_flag("write-protected") {
        WriteProtection::Enforced
    } else {
        WriteProtection::NotYetEnforced
    };
    let policy = if matches.get_flag("abort-on-overflow") {
        OutOfSpacePolicy::Abort
    } else {
        OutOfSpacePolicy::Skip
    };

    println!("{:>12} {}", "Platform".green().bold(), layout);

    let mut soc = SimSoc::new(layout, firmware.flash_size(&layout, &starts), psram_size);
    soc.fill_flash_with_pattern();
    firmware.load_into(&mut soc, &layout, &starts);

    let configurator = RegionConfigurator::new(
        XipConfig::new(segments, write_protection),
        layout,
        firmware.markers.clone(),
        starts,
    )
    .map_err(|e| anyhow!("{}", e))?;
    let mut cursor = LinearPageCursor::new(start_page, psram_size);

    let state = unsafe { relocate_to_psram(&mut soc, configurator, &mut cursor, policy) }
        .map_err(|e| anyhow!("{}", e))?;

    print_plan(&state, &firmware.markers);
    println!(
        "{:>12} {} of {} PSRAM pages, next free page {}",
        "Using".green().bold(),
        state.pages_used(),
        layout.bytes_to_pages(psram_size),
        cursor.next_free_page()
    );

    if matches.get_flag("simulate") {
        verify(&soc, &state)?;
    }

    Ok(())
}

fn command() -> Command {
    Command::new("xipmap - XIP on PSRAM layout tool")
        .about("Plan and simulate moving firmware instructions and rodata from flash to PSRAM")
        .disable_version_flag(true)
        .arg(
            Arg::new("elf")
                .long("elf")
                .help("Path of the firmware ELF file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("platform")
                .long("platform")
                .help("Chip address space layout")
                .value_parser(["esp32p4", "esp32c5", "esp32c61"])
                .default_value("esp32p4"),
        )
        .arg(
            Arg::new("page-size")
                .long("page-size")
                .help("MMU page size, overrides the chip default")
                .value_parser(parse_size),
        )
        .arg(
            Arg::new("psram-size")
                .long("psram-size")
                .help("Usable PSRAM size")
                .value_parser(parse_size)
                .default_value("8M"),
        )
        .arg(
            Arg::new("start-page")
                .long("start-page")
                .help("First free PSRAM page")
                .value_parser(parse_size)
                .default_value("0"),
        )
        .arg(
            Arg::new("irom-flash")
                .long("irom-flash")
                .help("Flash offset of the instruction segment in the app image")
                .value_parser(parse_size),
        )
        .arg(
            Arg::new("drom-flash")
                .long("drom-flash")
                .help("Flash offset of the rodata segment in the app image")
                .value_parser(parse_size),
        )
        .arg(
            Arg::new("only")
                .long("only")
                .help("Relocate only one segment kind")
                .value_parser(["instructions", "rodata"]),
        )
        .arg(
            Arg::new("write-protected")
                .long("write-protected")
                .help("Copy through the PSRAM scratch window, as after the memory protection split")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("abort-on-overflow")
                .long("abort-on-overflow")
                .help("Fail instead of leaving a segment that does not fit in flash")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .help("Verify every relocated byte and report MMU and cache operation counts")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .help("Log per-segment details, twice for per-page progress")
                .action(ArgAction::Count),
        )
}

fn firmware_path(matches: &ArgMatches) -> Result<&PathBuf> {
    matches
        .get_one::<PathBuf>("elf")
        .ok_or_else(|| anyhow!("firmware ELF file must be specified with --elf"))
}

fn flash_starts(matches: &ArgMatches) -> Result<FlashSegmentStarts> {
    let offset = |id: &str, what: &str| {
        matches
            .get_one::<usize>(id)
            .copied()
            .ok_or_else(|| anyhow!("{} flash offset must be specified with --{}", what, id))
    };
    Ok(FlashSegmentStarts::new(
        offset("drom-flash", "rodata")?,
        offset("irom-flash", "instructions")?,
    ))
}

/// Accepts decimal, `0x` hex, and `K`/`M` suffixes.
fn parse_size(arg: &str) -> Result<usize, String> {
    let arg = arg.trim();
    let (digits, multiplier) = match arg.chars().last() {
        Some('K') | Some('k') => (&arg[..arg.len() - 1], 1024),
        Some('M') | Some('m') => (&arg[..arg.len() - 1], 1024 * 1024),
        _ => (arg, 1),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => digits.replace('_', "").parse::<usize>(),
    }
    .map_err(|e| format!("invalid size {}: {}", arg, e))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {} is too large", arg))
}

/// What the tool needs from the firmware ELF file.
struct FirmwareImage {
    markers: FixedMarkers,
    /// Loadable bytes of the reserved range of each segment kind, if present in the file.
    contents: [Option<Vec<u8>>; 2],
}

impl FirmwareImage {
    pub fn new(markers: FixedMarkers, contents: [Option<Vec<u8>>; 2]) -> Self {
        Self { markers, contents }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let elf = Elf::parse(&data).with_context(|| format!("parsing {}", path.display()))?;

        let markers = Self::reserved_markers(|name| Self::symbol_value(&elf, name))?;
        let contents = SegmentKind::ALL.map(|kind| {
            Self::loadable_bytes(&elf.program_headers, &data, markers.reserved_range(kind))
                .map(<[u8]>::to_vec)
        });

        Ok(Self::new(markers, contents))
    }

    /// Reserved ranges from the linker boundary symbols.
    fn reserved_markers(symbol: impl Fn(&str) -> Result<u64>) -> Result<FixedMarkers> {
        let range = |start: &str, end: &str| -> Result<Range<usize>> {
            let start = symbol(start)? as usize;
            let end = symbol(end)? as usize;
            if end < start {
                bail!("reserved range {:#x}..{:#x} is reversed", start, end);
            }
            Ok(start..end)
        };
        Ok(FixedMarkers::new(
            range("_instruction_reserved_start", "_instruction_reserved_end")?,
            range("_rodata_reserved_start", "_rodata_reserved_end")?,
        ))
    }

    fn symbol_value(elf: &Elf, symbol_name: &str) -> Result<u64> {
        let symbol = elf
            .syms
            .iter()
            .find(|sym| elf.strtab.get_at(sym.st_name) == Some(symbol_name))
            .ok_or_else(|| anyhow!("symbol {} not found", symbol_name))?;
        Ok(symbol.st_value)
    }

    /// File bytes backing `range`, if a single loadable segment holds all of them.
    fn loadable_bytes<'a>(
        headers: &[ProgramHeader],
        data: &'a [u8],
        range: Range<usize>,
    ) -> Option<&'a [u8]> {
        let (start, end) = (range.start as u64, range.end as u64);
        let segment = headers.iter().find(|ph| {
            ph.p_type == PT_LOAD && ph.p_vaddr <= start && end <= ph.p_vaddr + ph.p_filesz
        })?;
        let offset = (segment.p_offset + (start - segment.p_vaddr)) as usize;
        data.get(offset..offset + range.len())
    }

    /// Both reserved ranges must be reachable through the PSRAM MMU.
    pub fn check_against(&self, layout: &PlatformLayout) -> Result<()> {
        let window = layout.psram_window();
        for kind in SegmentKind::ALL {
            let bounds = SegmentBounds::of(&self.markers, kind, layout.page_size);
            if bounds.length() == 0 {
                continue;
            }
            let last = bounds.vaddr_end_exclusive().as_usize() - 1;
            if !window.contains(bounds.vaddr_start()) || !window.contains(Address::new(last)) {
                bail!(
                    "{} range {:#x}..{:#x} is outside the PSRAM window {}",
                    kind,
                    bounds.vaddr_start().as_usize(),
                    last + 1,
                    window
                );
            }
        }
        Ok(())
    }

    fn flash_start(kind: SegmentKind, starts: &FlashSegmentStarts) -> usize {
        match kind {
            SegmentKind::Instructions => starts.instructions.as_usize(),
            SegmentKind::Rodata => starts.rodata.as_usize(),
        }
    }

    /// Simulated flash must hold both segments, page rounded.
    pub fn flash_size(&self, layout: &PlatformLayout, starts: &FlashSegmentStarts) -> usize {
        SegmentKind::ALL
            .iter()
            .map(|kind| {
                let bounds = SegmentBounds::of(&self.markers, *kind, layout.page_size);
                mm::align_down(Self::flash_start(*kind, starts), layout.page_size) + bounds.length()
            })
            .max()
            .unwrap_or(0)
            .max(layout.page_size)
    }

    /// Put the segment bytes where the bootloader would have put them.
    pub fn load_into(&self, soc: &mut SimSoc, layout: &PlatformLayout, starts: &FlashSegmentStarts) {
        for kind in SegmentKind::ALL {
            let Some(bytes) = &self.contents[kind.index()] else {
                info!("{} has no file contents, using a fill pattern", kind);
                continue;
            };
            let bounds = SegmentBounds::of(&self.markers, kind, layout.page_size);
            let flash = mm::align_down(Self::flash_start(kind, starts), layout.page_size)
                + (bounds.reserved().start - bounds.vaddr_start().as_usize());
            soc.flash_mut()[flash..flash + bytes.len()].copy_from_slice(bytes);
        }
    }
}

fn print_plan(state: &XipState, markers: &FixedMarkers) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);
    table.set_titles(Row::new(
        [
            "Segment", "Reserved", "Virtual", "Pages", "PSRAM", "Flash", "Offset", "Gap",
        ]
        .iter()
        .map(|title| Cell::new(title).style_spec("bFg"))
        .collect(),
    ));

    for kind in SegmentKind::ALL {
        let reserved = markers.reserved_range(kind);
        let gap = state.alignment_gap_for(kind);
        let reserved = format!("{:#010x}..{:#010x}", reserved.start, reserved.end);
        let gap = format!("{} ({} B)", gap, gap.size());
        match state.descriptor(kind) {
            Some(d) => table.add_row(row![
                kind.section_name(),
                reserved,
                d.vaddr_region(),
                d.size() / state.layout().page_size,
                d.psram_paddr_start(),
                d.flash_paddr_start(),
                format!("{:#x}", d.paddr_offset()),
                gap
            ]),
            None => table.add_row(row![
                kind.section_name(),
                reserved,
                "stays in flash".yellow(),
                state.layout().bytes_to_pages(state.segment_length_for(kind)),
                "-",
                "-",
                "-",
                gap
            ]),
        };
    }

    table.printstd();
}

/// Every relocated byte must read back as its flash source, through both the cache and the
/// reverse address lookup.
fn verify(soc: &SimSoc, state: &XipState) -> Result<()> {
    let mut verified = 0;
    for kind in SegmentKind::ALL {
        let Some(d) = state.descriptor(kind) else {
            continue;
        };
        let flash = d.flash_paddr_start().as_usize();
        if soc.read_virt(d.vaddr_start(), d.size()) != soc.flash()[flash..flash + d.size()] {
            bail!("{} contents differ from flash", kind);
        }
        for offset in (0..d.size()).step_by(4) {
            let vaddr = d.vaddr_start() + offset;
            match state.flash_paddr_of(soc, vaddr) {
                Some(paddr) if paddr.as_usize() == flash + offset => {}
                other => bail!("{} maps back to {:?} instead of {:#x}", vaddr, other, flash + offset),
            }
        }
        verified += d.size();
    }

    let count = |f: fn(&HalOp) -> bool| soc.ops().iter().filter(|op| f(op)).count();
    println!(
        "{:>12} {} bytes, {} maps, {} invalidates, {} writebacks, {} page copies",
        "Verified".green().bold(),
        verified,
        count(|op| matches!(op, HalOp::Map { .. })),
        count(|op| matches!(op, HalOp::Invalidate { .. })),
        count(|op| matches!(op, HalOp::Writeback { .. })),
        count(|op| matches!(op, HalOp::Copy { .. })),
    );
    Ok(())
}

/// Prints log records the way the kernel console does, with uptime and a level marker.
struct ConsoleLogger {
    start: Instant,
    level: LevelFilter,
}

impl ConsoleLogger {
    fn install(level: LevelFilter) -> Result<()> {
        log::set_boxed_logger(Box::new(Self {
            start: Instant::now(),
            level,
        }))
        .map(|()| log::set_max_level(level))
        .map_err(|e| anyhow!("{}", e))
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let marker = match record.level() {
            log::Level::Error => "E".red().bold(),
            log::Level::Warn => "W".yellow().bold(),
            log::Level::Info => " ".normal(),
            log::Level::Debug => "D".blue(),
            log::Level::Trace => "T".dimmed(),
        };
        let uptime = self.start.elapsed();
        eprintln!(
            "[{} {:>3}.{:06}] {}",
            marker,
            uptime.as_secs(),
            uptime.subsec_micros(),
            record.args()
        );
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        goblin::elf::program_header::PT_NOTE,
        xipram::sim::TEST_LAYOUT,
    };

    const INSTRUCTIONS: Range<usize> = 0x4800_0000..0x4800_2234;
    const RODATA: Range<usize> = 0x4800_3010..0x4800_4ffd;
    const IROM_FLASH: usize = 0x1_0000;
    const DROM_FLASH: usize = 0x2_0010;

    fn starts() -> FlashSegmentStarts {
        FlashSegmentStarts::new(DROM_FLASH, IROM_FLASH)
    }

    fn rodata_bytes() -> Vec<u8> {
        (0..RODATA.len()).map(|i| (i * 7) as u8).collect()
    }

    fn firmware() -> FirmwareImage {
        FirmwareImage::new(
            FixedMarkers::new(INSTRUCTIONS, RODATA),
            [Some(vec![0xa5; INSTRUCTIONS.len()]), Some(rodata_bytes())],
        )
    }

    fn header(p_type: u32, p_offset: u64, p_vaddr: u64, p_filesz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type,
            p_flags: 0,
            p_offset,
            p_vaddr,
            p_paddr: p_vaddr,
            p_filesz,
            p_memsz: p_filesz * 2,
            p_align: 0x1000,
        }
    }

    fn symbols<'a>(table: &'a [(&'a str, u64)]) -> impl Fn(&str) -> Result<u64> + 'a {
        move |name: &str| {
            table
                .iter()
                .find(|(symbol, _)| *symbol == name)
                .map(|(_, value)| *value)
                .ok_or_else(|| anyhow!("symbol {} not found", name))
        }
    }

    fn relocate(soc: &mut SimSoc, firmware: &FirmwareImage) -> XipState {
        let configurator = RegionConfigurator::new(
            XipConfig::default(),
            TEST_LAYOUT,
            firmware.markers.clone(),
            starts(),
        )
        .expect("valid layout");
        let mut cursor = LinearPageCursor::new(0, 0x4_0000);
        unsafe { relocate_to_psram(soc, configurator, &mut cursor, OutOfSpacePolicy::Abort) }
            .expect("both fit")
    }

    #[test]
    fn sizes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("0x1_0000"), Ok(0x1_0000));
        assert_eq!(parse_size("64K"), Ok(0x1_0000));
        assert_eq!(parse_size("8M"), Ok(0x80_0000));
        assert!(parse_size("0xzz").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn arguments_are_consistent() {
        command().debug_assert();
    }

    #[test]
    fn missing_offsets_and_elf_are_reported() {
        let matches = command()
            .try_get_matches_from(["xipmap", "--irom-flash", "0x10000"])
            .expect("parses");
        assert!(firmware_path(&matches)
            .unwrap_err()
            .to_string()
            .contains("--elf"));
        assert!(flash_starts(&matches)
            .unwrap_err()
            .to_string()
            .contains("--drom-flash"));

        let matches = command()
            .try_get_matches_from([
                "xipmap",
                "--elf",
                "app.elf",
                "--irom-flash",
                "64K",
                "--drom-flash",
                "0x20010",
            ])
            .expect("parses");
        assert_eq!(
            firmware_path(&matches).expect("given"),
            &PathBuf::from("app.elf")
        );
        assert_eq!(flash_starts(&matches).expect("given"), starts());
    }

    #[test]
    fn reserved_ranges_come_from_boundary_symbols() {
        let table = [
            ("_instruction_reserved_start", 0x4800_0000),
            ("_instruction_reserved_end", 0x4800_2234),
            ("_rodata_reserved_start", 0x4800_3010),
            ("_rodata_reserved_end", 0x4800_4ffd),
        ];
        let markers = FirmwareImage::reserved_markers(symbols(&table)).expect("all present");
        assert_eq!(markers, FixedMarkers::new(INSTRUCTIONS, RODATA));

        let missing = FirmwareImage::reserved_markers(symbols(&table[..3])).unwrap_err();
        assert!(missing.to_string().contains("_rodata_reserved_end"));

        let reversed = [
            ("_instruction_reserved_start", 0x4800_2000),
            ("_instruction_reserved_end", 0x4800_1000),
        ];
        let reversed = FirmwareImage::reserved_markers(symbols(&reversed)).unwrap_err();
        assert!(reversed.to_string().contains("reversed"));
    }

    #[test]
    fn loadable_bytes_come_from_the_covering_load_segment() {
        let data: Vec<u8> = (0..0x200).map(|i| i as u8).collect();
        let headers = [
            header(PT_NOTE, 0, 0x4800_0000, 0x100),
            header(PT_LOAD, 0x100, 0x4800_0000, 0x40),
        ];

        assert_eq!(
            FirmwareImage::loadable_bytes(&headers, &data, 0x4800_0010..0x4800_0020),
            Some(&data[0x110..0x120])
        );
        // Past p_filesz the bytes are zero fill, not file contents.
        assert_eq!(
            FirmwareImage::loadable_bytes(&headers, &data, 0x4800_0030..0x4800_0050),
            None
        );
        assert_eq!(
            FirmwareImage::loadable_bytes(&headers[..1], &data, 0x4800_0010..0x4800_0020),
            None
        );
    }

    #[test]
    fn reserved_ranges_must_be_in_the_psram_window() {
        assert!(firmware().check_against(&TEST_LAYOUT).is_ok());

        let in_flash = FirmwareImage::new(
            FixedMarkers::new(0x4000_0000..0x4000_0100, 0x4800_0000..0x4800_0000),
            [None, None],
        );
        let error = in_flash.check_against(&TEST_LAYOUT).unwrap_err();
        assert!(error.to_string().contains("outside the PSRAM window"));

        let past_the_end = FirmwareImage::new(
            FixedMarkers::new(INSTRUCTIONS, 0x483f_f800..0x4840_0800),
            [None, None],
        );
        assert!(past_the_end.check_against(&TEST_LAYOUT).is_err());
    }

    #[test]
    fn flash_holds_both_page_rounded_segments() {
        assert_eq!(firmware().flash_size(&TEST_LAYOUT, &starts()), 0x2_2000);

        let empty = FirmwareImage::new(
            FixedMarkers::new(0x4800_0000..0x4800_0000, 0x4800_0000..0x4800_0000),
            [None, None],
        );
        assert_eq!(
            empty.flash_size(&TEST_LAYOUT, &FlashSegmentStarts::new(0, 0)),
            TEST_LAYOUT.page_size
        );
    }

    #[test]
    fn segment_bytes_land_at_their_flash_offsets() {
        let firmware = firmware();
        let mut soc = SimSoc::new(
            TEST_LAYOUT,
            firmware.flash_size(&TEST_LAYOUT, &starts()),
            0x4_0000,
        );
        soc.fill_flash_with_pattern();
        firmware.load_into(&mut soc, &TEST_LAYOUT, &starts());

        let rodata = rodata_bytes();
        assert_eq!(soc.flash()[DROM_FLASH..DROM_FLASH + rodata.len()], rodata[..]);
        assert!(soc.flash()[IROM_FLASH..IROM_FLASH + INSTRUCTIONS.len()]
            .iter()
            .all(|byte| *byte == 0xa5));
    }

    #[test]
    fn loaded_image_relocates_and_verifies() {
        let firmware = firmware();
        let mut soc = SimSoc::new(
            TEST_LAYOUT,
            firmware.flash_size(&TEST_LAYOUT, &starts()),
            0x4_0000,
        );
        soc.fill_flash_with_pattern();
        firmware.load_into(&mut soc, &TEST_LAYOUT, &starts());

        let state = relocate(&mut soc, &firmware);

        assert_eq!(state.pages_used(), 5);
        assert_eq!(
            soc.read_virt(Address::new(RODATA.start), RODATA.len()),
            rodata_bytes()
        );
        assert!(verify(&soc, &state).is_ok());
    }
}
