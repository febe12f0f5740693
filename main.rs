use machload::{Loader, LoaderBuilder, MappedFile, probe_host_arch};
use std::ffi::OsString;
use std::path::Path;
use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

struct Opts {
    /// Load and unload the image without running it.
    dry_run: bool,

    /// Do not pass the loader's environment to the image.
    clear_env: bool,

    /// Stack size override in bytes.
    stack_size: Option<u64>,

    /// The program to run.
    program: OsString,

    /// The arguments to pass to the program, `argv[0]` excluded.
    program_args: Vec<OsString>,
}

fn main() {
    setup_logging();

    let args: Vec<OsString> = env::args_os().collect();
    if args.len() < 2 {
        usage();
    }
    let opts = parse_opts(&args);
    if opts.program.is_empty() {
        usage();
    }

    let Some(host) = probe_host_arch() else {
        eprintln!("machload: unsupported host architecture");
        exit(1);
    };

    let file = match MappedFile::open(&opts.program) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("machload: {}: {}", Path::new(&opts.program).display(), err);
            exit(1);
        }
    };

    let mut argv = vec![opts.program.clone()];
    argv.extend(opts.program_args.iter().cloned());
    let mut builder = LoaderBuilder::new(host)
        .executable_path(opts.program.clone())
        .args(argv)
        .inherit_env(!opts.clear_env);
    if let Some(stack_size) = opts.stack_size {
        builder = builder.stack_size(stack_size);
    }
    let loader = builder.build();

    if opts.dry_run {
        dry_run(&loader, file.data());
        return;
    }

    if let Err(err) = loader.exec(file.data()) {
        eprintln!("machload: {}: {}", Path::new(&opts.program).display(), err);
        exit(1);
    }
}

fn dry_run(loader: &Loader, image: &[u8]) {
    let mut space = machload::vm::HostAddressSpace::new();
    let loaded = match loader.load(&mut space, image) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("machload: {}", err);
            exit(1);
        }
    };
    println!("arch:   {}", loaded.arch);
    println!("base:   0x{:x}", loaded.base);
    println!("slide:  0x{:x}", loaded.slide);
    println!("entry:  0x{:x} ({:?})", loaded.entry.address, loaded.entry.kind);
    println!("fixups: {}", loaded.fixup_count);
    for segment in &loaded.mapped.segments {
        println!(
            "  {:<16} {} {} filesize 0x{:x}",
            segment.name, segment.region, segment.initprot, segment.filesize
        );
    }
    if let Err(err) = loaded.unload(&mut space) {
        eprintln!("machload: {}", err);
        exit(1);
    }
}

fn usage() -> ! {
    eprintln!("usage: machload [--dry-run] [--clear-env] [--stack-size <bytes>] [--] <program> [arguments...]");
    exit(1);
}

fn parse_opts(args: &[OsString]) -> Opts {
    let mut dry_run = false;
    let mut clear_env = false;
    let mut stack_size = None;
    let mut program = OsString::new();
    let mut program_args: Vec<OsString> = Vec::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        if args[i] == "--dry-run" {
            dry_run = true;
            i += 1;
        } else if args[i] == "--clear-env" {
            clear_env = true;
            i += 1;
        } else if args[i] == "--stack-size" {
            stack_size = args
                .get(i + 1)
                .and_then(|size| size.to_str())
                .and_then(parse_size);
            if stack_size.is_none() {
                usage();
            }
            i += 2;
        } else if args[i] == "--" {
            if i + 1 < args.len() {
                program = args[i + 1].clone();
                program_args = args[i + 2..].to_vec();
            }
            break;
        } else {
            program = args[i].clone();
            program_args = args[i + 1..].to_vec();
            break;
        }
    }
    Opts {
        dry_run,
        clear_env,
        stack_size,
        program,
        program_args,
    }
}

/// Decimal or `0x` hexadecimal.
fn parse_size(s: &str) -> Option<u64> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}
