//! A utility for manipulating PS2 memory card images.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use chrono::{Datelike, Timelike};
use clap::{Args, Parser, Subcommand};
use ps2mc_fs::{DirMode, Error as FsError, FormatParams, McFile, McFs, OpenMode};
use ps2mc_save::icon::{ps1_title, IconSys};
use ps2mc_save::{make_longname, SaveError, SaveFile};

/// Character per mode bit, lowest bit first, as the console tooling prints
/// them.
const MODE_BITS: &str = "rwxpfdD81C+KPH4";

#[derive(Debug, Parser)]
#[command(
    name = "ps2mc",
    version,
    about = "A utility for manipulating PS2 memory card images"
)]
struct Cli {
    /// Print debug information and re-raise errors.
    #[arg(short = 'D', long)]
    debug: bool,

    /// Ignore ECC errors while reading.
    #[arg(short = 'i', long)]
    ignore_ecc: bool,

    /// Path to the memory card image.
    memory_card: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the contents of a directory.
    Ls(LsArgs),
    /// Extract files from the memory card.
    Extract(ExtractArgs),
    /// Add files to the memory card.
    Add(AddArgs),
    /// Make directories.
    Mkdir {
        #[arg(required = true)]
        directory: Vec<String>,
    },
    /// Remove files and directories.
    Remove {
        #[arg(required = true)]
        filename: Vec<String>,
    },
    /// Import save files into the memory card.
    Import(ImportArgs),
    /// Export save files from the memory card.
    Export(ExportArgs),
    /// Recursively delete a directory (save file).
    Delete {
        #[arg(required = true)]
        dirname: Vec<String>,
    },
    /// Set mode flags on files and directories.
    Set(ModeArgs),
    /// Clear mode flags on files and directories.
    Clear(ModeArgs),
    /// Rename a file or directory.
    Rename { oldname: String, newname: String },
    /// Display save file information.
    Dir,
    /// Display the amount of free space.
    Df,
    /// Check for file system errors.
    Check,
    /// Create a new memory card image.
    Format(FormatArgs),
    /// Rewrite the superblock from in-memory state.
    #[command(hide = true)]
    Frob,
    /// Scan every page for uncorrectable ECC errors.
    #[command(hide = true, name = "ecc-check")]
    EccCheck,
}

#[derive(Debug, Args)]
struct LsArgs {
    /// Display creation times instead of modification times.
    #[arg(short = 'c', long)]
    creation_time: bool,
    #[arg(default_value = "/")]
    directory: Vec<String>,
}

#[derive(Debug, Args)]
struct ExtractArgs {
    /// Extract files from this directory.
    #[arg(short, long)]
    directory: Option<String>,
    /// Extract to this file.
    #[arg(short, long, value_name = "FILE", conflicts_with = "use_stdout")]
    output: Option<PathBuf>,
    /// Extract files to standard output.
    #[arg(short = 'p', long)]
    use_stdout: bool,
    #[arg(required = true)]
    filename: Vec<String>,
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Add files to this directory.
    #[arg(short, long)]
    directory: Option<String>,
    #[arg(required = true)]
    filename: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    /// Import to this directory instead of the save's own name.
    #[arg(short = 'd', long, value_name = "DEST")]
    directory: Option<String>,
    /// Ignore saves that already exist on the image.
    #[arg(short = 'i', long)]
    ignore_existing: bool,
    #[arg(required = true)]
    savefile: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct ExportArgs {
    /// Export save files into this host directory.
    #[arg(short, long)]
    directory: Option<PathBuf>,
    /// Overwrite any save files already exported.
    #[arg(short = 'f', long, conflicts_with = "ignore_existing")]
    overwrite_existing: bool,
    /// Ignore any save files already exported.
    #[arg(short = 'i', long)]
    ignore_existing: bool,
    /// Generate longer, more descriptive filenames.
    #[arg(short = 'l', long, conflicts_with = "output_file")]
    longnames: bool,
    /// Use the MAX Drive save file format.
    #[arg(short = 'm', long)]
    max_drive: bool,
    /// Use this as the name of the save file.
    #[arg(short = 'o', long, value_name = "filename")]
    output_file: Option<PathBuf>,
    /// Use the EMS .psu save file format (the default).
    #[arg(short = 'p', long)]
    ems: bool,
    #[arg(required = true)]
    dirname: Vec<String>,
}

#[derive(Debug, Args)]
struct ModeArgs {
    /// Hidden flag.
    #[arg(short = 'H', long)]
    hidden: bool,
    /// PocketStation flag.
    #[arg(short = 'K', long)]
    pocketstation: bool,
    /// PSX flag.
    #[arg(short = 'P', long)]
    psx: bool,
    /// Copy protected flag.
    #[arg(short = 'p', long)]
    protected: bool,
    /// Read allowed flag.
    #[arg(short = 'r', long)]
    read: bool,
    /// Write allowed flag.
    #[arg(short = 'w', long)]
    write: bool,
    /// Executable flag.
    #[arg(short = 'x', long)]
    execute: bool,
    /// Set the mode to this hex value.
    #[arg(short = 'X', long, value_name = "mode")]
    hex_value: Option<String>,
    #[arg(required = true)]
    filename: Vec<String>,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Size in clusters of the memory card.
    #[arg(short, long)]
    clusters: Option<u32>,
    /// Create an image without ECC.
    #[arg(short = 'e', long)]
    no_ecc: bool,
    /// Overwrite any existing file.
    #[arg(short = 'f', long)]
    overwrite_existing: bool,
}

type CardFs = McFs<File>;

fn main() -> ExitCode {
    let cli = Cli::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if cli.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            report(&cli, &err);
            ExitCode::FAILURE
        }
    }
}

fn report(cli: &Cli, err: &anyhow::Error) {
    if cli.debug {
        eprintln!("{err:?}");
        return;
    }
    let fs_err = err.downcast_ref::<FsError>().or_else(|| {
        match err.downcast_ref::<SaveError>() {
            Some(SaveError::Fs(inner)) => Some(inner),
            _ => None,
        }
    });
    let name = fs_err
        .and_then(|e| e.name().map(str::to_owned))
        .unwrap_or_else(|| cli.memory_card.display().to_string());
    eprintln!("{name}: {err}");
}

fn writes_to_the_image(command: &Command) -> bool {
    !matches!(
        command,
        Command::Ls(_)
            | Command::Extract(_)
            | Command::Export(_)
            | Command::Dir
            | Command::Df
            | Command::Check
            | Command::EccCheck
    )
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    if let Command::Format(args) = &cli.command {
        return do_format(cli, args);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(writes_to_the_image(&cli.command))
        .open(&cli.memory_card)
        .with_context(|| "cannot open the memory card image")?;
    let mut fs = McFs::open(file, cli.ignore_ecc)?;

    let code = match &cli.command {
        Command::Ls(args) => do_ls(&mut fs, args)?,
        Command::Extract(args) => do_extract(&mut fs, args)?,
        Command::Add(args) => do_add(&mut fs, args)?,
        Command::Mkdir { directory } => {
            for dir in directory {
                fs.mkdir(dir.as_bytes())?;
            }
            ExitCode::SUCCESS
        }
        Command::Remove { filename } => {
            for name in filename {
                fs.remove(name.as_bytes())?;
            }
            ExitCode::SUCCESS
        }
        Command::Import(args) => do_import(&mut fs, args)?,
        Command::Export(args) => do_export(&mut fs, args)?,
        Command::Delete { dirname } => {
            for name in dirname {
                fs.rmdir_recursive(name.as_bytes())?;
            }
            ExitCode::SUCCESS
        }
        Command::Set(args) => do_setmode(&mut fs, args, false)?,
        Command::Clear(args) => do_setmode(&mut fs, args, true)?,
        Command::Rename { oldname, newname } => {
            fs.rename(oldname.as_bytes(), newname.as_bytes())?;
            ExitCode::SUCCESS
        }
        Command::Dir => do_dir(&mut fs)?,
        Command::Df => {
            println!(
                "{}: {} bytes free.",
                cli.memory_card.display(),
                fs.get_free_space()?
            );
            ExitCode::SUCCESS
        }
        Command::Check => {
            if fs.check()? {
                println!("No errors found.");
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Frob => {
            fs.write_superblock()?;
            ExitCode::SUCCESS
        }
        Command::EccCheck => do_ecc_check(&mut fs)?,
        Command::Format(_) => unreachable!("handled above"),
    };
    fs.close()?;
    Ok(code)
}

/// Expands each argument against the image, keeping arguments that match
/// nothing so the per-file operation can report them.
fn glob_args(fs: &mut CardFs, args: &[String]) -> anyhow::Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for arg in args {
        let matches = fs.glob(arg.as_bytes())?;
        if matches.is_empty() {
            out.push(arg.as_bytes().to_vec());
        } else {
            out.extend(matches);
        }
    }
    Ok(out)
}

fn lossy(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

fn do_ls(fs: &mut CardFs, args: &LsArgs) -> anyhow::Result<ExitCode> {
    let directories = glob_args(fs, &args.directory)?;
    let many = directories.len() > 1;
    for dirname in &directories {
        let entries = fs.read_dir(dirname)?;
        if many {
            println!("\n{}:", lossy(dirname));
        }
        for ent in entries.iter().filter(|e| e.mode.is_live()) {
            let bits = ent.mode.bits();
            let mode: String = MODE_BITS
                .chars()
                .enumerate()
                .map(|(i, c)| if bits & (1 << i) != 0 { c } else { '-' })
                .collect();
            let tod = if args.creation_time {
                ent.created
            } else {
                ent.modified
            };
            let t = tod.to_datetime();
            println!(
                "{mode} {:7} {:04}-{:02}-{:02} {:02}:{:02}:{:02} {}",
                ent.length,
                t.year(),
                t.month(),
                t.day(),
                t.hour(),
                t.minute(),
                t.second(),
                ent.name_lossy()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Copies an open card file to a host writer in small chunks.
fn copy_out(fs: &mut CardFs, file: &mut McFile, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let n = file.read(fs, &mut buf)?;
        if n == 0 {
            return Ok(());
        }
        out.write_all(&buf[..n])?;
    }
}

fn basename(path: &[u8]) -> &[u8] {
    match path.iter().rposition(|&b| b == b'/') {
        Some(p) => &path[p + 1..],
        None => path,
    }
}

fn do_extract(fs: &mut CardFs, args: &ExtractArgs) -> anyhow::Result<ExitCode> {
    if let Some(dir) = &args.directory {
        fs.chdir(dir.as_bytes())?;
    }
    let mut single_out: Option<Box<dyn Write>> = if let Some(path) = &args.output {
        Some(Box::new(File::create(path)?))
    } else if args.use_stdout {
        Some(Box::new(std::io::stdout()))
    } else {
        None
    };

    for filename in glob_args(fs, &args.filename)? {
        let mut file = fs.open_file(&filename, OpenMode::Read)?;
        if let Some(out) = single_out.as_mut() {
            copy_out(fs, &mut file, out)?;
        } else {
            let host = lossy(basename(&filename));
            let mut out = File::create(&host).with_context(|| host.clone())?;
            copy_out(fs, &mut file, &mut out)?;
        }
        file.close(fs)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn do_add(fs: &mut CardFs, args: &AddArgs) -> anyhow::Result<ExitCode> {
    if let Some(dir) = &args.directory {
        fs.chdir(dir.as_bytes())?;
    }
    for src in &args.filename {
        let data = std::fs::read(src).with_context(|| src.display().to_string())?;
        let dest = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut file = fs.open_file(dest.as_bytes(), OpenMode::Write)?;
        file.write(fs, &data)?;
        file.close(fs)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn do_import(fs: &mut CardFs, args: &ImportArgs) -> anyhow::Result<ExitCode> {
    if args.directory.is_some() && args.savefile.len() > 1 {
        bail!("the -d option can only be used with a single savefile");
    }
    for path in &args.savefile {
        let mut f = File::open(path).with_context(|| path.display().to_string())?;
        let sf = SaveFile::load(&mut f)?;
        let target = args.directory.as_ref().map(|d| d.as_bytes().to_vec());
        let shown = target
            .as_deref()
            .map(lossy)
            .unwrap_or_else(|| lossy(sf.dir_name()));
        println!("Importing {} to {}", path.display(), shown);
        if !sf.import(fs, args.ignore_existing, target.as_deref())? {
            println!(
                "{}: already in memory card image, ignored.",
                path.display()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn do_export(fs: &mut CardFs, args: &ExportArgs) -> anyhow::Result<ExitCode> {
    if args.max_drive && args.ems {
        bail!("the -m and -p options are mutually exclusive");
    }
    if args.max_drive {
        return Err(SaveError::Unsupported("MAX Drive").into());
    }
    if args.output_file.is_some() && args.dirname.len() > 1 {
        bail!("only one directory can be exported when the -o option is used");
    }
    if let Some(dir) = &args.directory {
        std::env::set_current_dir(dir).with_context(|| dir.display().to_string())?;
    }

    for dirname in glob_args(fs, &args.dirname)? {
        let sf = SaveFile::export(fs, &dirname)?;
        let filename = match &args.output_file {
            Some(path) => path.clone(),
            None if args.longnames => PathBuf::from(format!("{}.psu", make_longname(&dirname, &sf))),
            None => PathBuf::from(format!("{}.psu", lossy(&dirname))),
        };
        if !args.overwrite_existing && filename.exists() {
            if args.ignore_existing {
                continue;
            }
            return Err(FsError::Exists {
                name: filename.display().to_string(),
            }
            .into());
        }
        println!("Exporting {} to {}", lossy(&dirname), filename.display());
        let mut out = File::create(&filename).with_context(|| filename.display().to_string())?;
        sf.save_psu(&mut out)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn do_setmode(fs: &mut CardFs, args: &ModeArgs, clear: bool) -> anyhow::Result<ExitCode> {
    let mut mask = DirMode::empty();
    for (on, bit) in [
        (args.read, DirMode::READ),
        (args.write, DirMode::WRITE),
        (args.execute, DirMode::EXECUTE),
        (args.protected, DirMode::PROTECTED),
        (args.psx, DirMode::PSX),
        (args.pocketstation, DirMode::POCKETSTN),
        (args.hidden, DirMode::HIDDEN),
    ] {
        if on {
            mask |= bit;
        }
    }

    let value = match &args.hex_value {
        Some(text) => {
            if !mask.is_empty() {
                bail!("the -X option can't be combined with other options");
            }
            let digits = text.trim_start_matches("0x").trim_start_matches("0X");
            Some(u16::from_str_radix(digits, 16).context("bad hex mode value")?)
        }
        None => {
            if mask.is_empty() {
                bail!("at least one option must be given");
            }
            None
        }
    };

    for filename in glob_args(fs, &args.filename)? {
        let mut ent = fs.get_dirent(&filename)?;
        ent.mode = match value {
            Some(v) => DirMode::from_bits_retain(v),
            None if clear => ent.mode & !mask,
            None => ent.mode | mask,
        };
        fs.set_dirent(&filename, &ent)?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Reads a save's icon.sys through the filesystem API.
fn save_title(fs: &mut CardFs, dirname: &[u8], mode: DirMode) -> Option<(String, String)> {
    if mode.contains(DirMode::PSX) {
        // A PS1 save is one file named like its directory; the title sits in
        // its header.
        let mut path = dirname.to_vec();
        path.push(b'/');
        path.extend_from_slice(basename(dirname));
        let mut file = fs.open_file(&path, OpenMode::Read).ok()?;
        let mut head = [0u8; 128];
        let n = file.read(fs, &mut head).ok()?;
        file.close(fs).ok()?;
        if n != head.len() {
            return None;
        }
        return ps1_title(&head).map(|t| (t, String::new()));
    }
    let mut path = dirname.to_vec();
    path.extend_from_slice(b"/icon.sys");
    let mut file = fs.open_file(&path, OpenMode::Read).ok()?;
    let data = file.read_to_end(fs).ok()?;
    file.close(fs).ok()?;
    let icon = IconSys::parse(&data)?;
    let (a, b) = icon.title();
    Some((a.to_owned(), b.to_owned()))
}

fn protection_label(mode: DirMode) -> &'static str {
    if mode.contains(DirMode::PSX) {
        if mode.contains(DirMode::POCKETSTN) {
            return "PocketStation";
        }
        return "PlayStation";
    }
    match (
        mode.contains(DirMode::PROTECTED),
        mode.contains(DirMode::WRITE),
    ) {
        (false, false) => "Delete Protected",
        (false, true) => "Not Protected",
        (true, false) => "Copy & Delete Protected",
        (true, true) => "Copy Protected",
    }
}

fn group_thousands(n: u64) -> String {
    if n > 999_999 {
        format!("{},{:03},{:03}", n / 1_000_000, n / 1000 % 1000, n % 1000)
    } else if n > 999 {
        format!("{},{:03}", n / 1000, n % 1000)
    } else {
        n.to_string()
    }
}

fn do_dir(fs: &mut CardFs) -> anyhow::Result<ExitCode> {
    let entries = fs.read_dir(b"/")?;
    for ent in entries.iter().skip(2) {
        if !ent.mode.is_live() || !ent.mode.is_dir() {
            continue;
        }
        let mut dirname = b"/".to_vec();
        dirname.extend_from_slice(ent.name());
        let length = fs.dir_size(&dirname)?;
        let (title0, title1) =
            save_title(fs, &dirname, ent.mode).unwrap_or_else(|| ("Corrupt".into(), String::new()));
        println!("{:<32} {}", ent.name_lossy(), title0);
        println!(
            "{:>4}KB {:<25} {}",
            length / 1024,
            protection_label(ent.mode),
            title1
        );
        println!();
    }

    let free = fs.get_free_space()? / 1024;
    println!("{} KB Free", group_thousands(free));
    Ok(ExitCode::SUCCESS)
}

fn do_ecc_check(fs: &mut CardFs) -> anyhow::Result<ExitCode> {
    let mut bad = 0u32;
    for page in 0..fs.pages_per_card() {
        match fs.read_page(page) {
            Ok(_) => {}
            Err(FsError::Ecc { page }) => {
                println!("bad: {page:05x}");
                bad += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if bad == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn do_format(cli: &Cli, args: &FormatArgs) -> anyhow::Result<ExitCode> {
    if !args.overwrite_existing && cli.memory_card.exists() {
        return Err(FsError::Exists {
            name: cli.memory_card.display().to_string(),
        }
        .into());
    }
    let params = FormatParams {
        with_ecc: !args.no_ecc,
        ..args
            .clusters
            .map(FormatParams::with_clusters)
            .unwrap_or_default()
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.memory_card)
        .with_context(|| "cannot create the memory card image")?;
    McFs::format(file, &params)?.close()?;
    Ok(ExitCode::SUCCESS)
}
