use std::ops::ControlFlow;
use std::path::PathBuf;

use clap::Parser;
use eyre::{bail, WrapErr};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uwucfi::{
    AddressSize, CallFrameInfo, Config, Endianness, Handler, Register, TracingReporter,
    CFA_REGISTER,
};

/// Prints the unwind rules in a raw `.debug_frame` or `.eh_frame` section.
#[derive(Debug, Parser)]
struct Args {
    /// The section contents. Without one, a small built-in `.eh_frame` is used.
    path: Option<PathBuf>,
    /// Read the section as `.eh_frame` instead of `.debug_frame`.
    #[arg(long)]
    eh_frame: bool,
    #[arg(long)]
    big_endian: bool,
    /// 4 or 8.
    #[arg(long, default_value_t = 8)]
    address_size: u8,
    /// Address the section is loaded at, for pc relative pointers.
    #[arg(long, value_parser = parse_hex)]
    cfi_base: Option<u64>,
    #[arg(long, value_parser = parse_hex)]
    text_base: Option<u64>,
    #[arg(long, value_parser = parse_hex)]
    data_base: Option<u64>,
}

fn parse_hex(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// A CIE like the ones compilers emit for x86-64, one FDE with a frame
/// pointer prologue, and the terminator.
#[rustfmt::skip]
const SAMPLE: &[u8] = &[
    // CIE: version 1, "zR", code 1, data -8, return address 16, pcrel sdata4
    0x14, 0, 0, 0,
    0, 0, 0, 0, 1,
    0x7a, 0x52, 0, 1,
    0x78, 0x10, 1,
    0x1b, 0xc, 7, 8,
    0x90, 1, 0, 0,
    // FDE: 0x1130..0x1150
    0x18, 0, 0, 0,
    0x1c, 0, 0, 0,
    0x10, 0x11, 0, 0,
    0x20, 0, 0, 0,
    0,
    0x41, 0x0e, 0x10, 0x86, 0x02, 0x43, 0x0d, 0x06,
    0, 0, 0,
    // terminator
    0, 0, 0, 0,
];

fn register(register: Register) -> String {
    if register == CFA_REGISTER {
        "CFA".to_owned()
    } else {
        format!("r{register}")
    }
}

struct PrintHandler;

impl Handler for PrintHandler {
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: Register,
    ) -> ControlFlow<()> {
        println!(
            "FDE {offset:#x}: {address:#x}..{:#x} version {version} augmentation {augmentation:?} return address {}",
            address.wrapping_add(length),
            register(return_address),
        );
        ControlFlow::Continue(())
    }

    fn undefined_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        println!("  {address:#x}: {} undefined", register(reg));
        ControlFlow::Continue(())
    }

    fn same_value_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        println!("  {address:#x}: {} same value", register(reg));
        ControlFlow::Continue(())
    }

    fn offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        println!("  {address:#x}: {} = [{}{offset:+}]", register(reg), register(base));
        ControlFlow::Continue(())
    }

    fn val_offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        println!("  {address:#x}: {} = {}{offset:+}", register(reg), register(base));
        ControlFlow::Continue(())
    }

    fn register_rule(&mut self, address: u64, reg: Register, base: Register) -> ControlFlow<()> {
        println!("  {address:#x}: {} = {}", register(reg), register(base));
        ControlFlow::Continue(())
    }

    fn expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        println!("  {address:#x}: {} = [expr {expression:02x?}]", register(reg));
        ControlFlow::Continue(())
    }

    fn val_expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        println!("  {address:#x}: {} = expr {expression:02x?}", register(reg));
        ControlFlow::Continue(())
    }

    fn end(&mut self) {
        println!();
    }

    fn personality_routine(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        println!("  personality {address:#x} (indirect: {indirect})");
        ControlFlow::Continue(())
    }

    fn language_specific_data_area(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        println!("  LSDA {address:#x} (indirect: {indirect})");
        ControlFlow::Continue(())
    }

    fn signal_handler(&mut self) -> ControlFlow<()> {
        println!("  signal handler");
        ControlFlow::Continue(())
    }
}

fn main() -> eyre::Result<()> {
    let registry = tracing_subscriber::Registry::default().with(
        EnvFilter::builder()
            .with_default_directive(tracing::Level::INFO.into())
            .from_env()
            .wrap_err("invalid RUST_LOG")?,
    );

    let tree_layer = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    registry.with(tree_layer).init();

    let args = Args::parse();

    let address_size = match args.address_size {
        4 => AddressSize::Four,
        8 => AddressSize::Eight,
        other => bail!("unsupported address size {other}"),
    };
    let endianness = if args.big_endian {
        Endianness::Big
    } else {
        Endianness::Little
    };

    let (name, data, mut config) = match &args.path {
        Some(path) => {
            let data = std::fs::read(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            let config = if args.eh_frame {
                Config::eh_frame(endianness, address_size)
            } else {
                Config::debug_frame(endianness, address_size)
            };
            (path.display().to_string(), data, config)
        }
        None => (
            "<sample>".to_owned(),
            SAMPLE.to_vec(),
            Config::eh_frame(Endianness::Little, AddressSize::Eight).with_cfi_base(0),
        ),
    };
    if let Some(base) = args.cfi_base {
        config = config.with_cfi_base(base);
    }
    if let Some(base) = args.text_base {
        config = config.with_text_base(base);
    }
    if let Some(base) = args.data_base {
        config = config.with_data_base(base);
    }

    let section = if config.is_eh_frame() {
        ".eh_frame"
    } else {
        ".debug_frame"
    };
    let mut reporter = TracingReporter::new(&name, section);
    let outcome = CallFrameInfo::new(&data, config).parse(&mut PrintHandler, &mut reporter);

    tracing::info!(
        delivered = outcome.delivered,
        failed = outcome.failed,
        truncated = outcome.truncated,
        "done"
    );
    if !outcome.is_ok() {
        bail!("{name} contains malformed call frame information");
    }
    Ok(())
}
