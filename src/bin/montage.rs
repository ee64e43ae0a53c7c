use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "montage", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a composition JSON to a container file (requires `ffmpeg` on PATH).
    Render(RenderArgs),
    /// Render a single frame as a PNG.
    Frame(FrameArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Input composition JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Output file path.
    #[arg(long)]
    out: PathBuf,

    /// Container (mp4, mov, webm, mkv, mp3, aac, wav). Defaults to mp4.
    #[arg(long)]
    container: Option<String>,

    /// Export range start, in timeline frames.
    #[arg(long)]
    in_point: Option<u64>,

    /// Export range end (exclusive), in timeline frames.
    #[arg(long)]
    out_point: Option<u64>,

    /// Output width override (must be even).
    #[arg(long)]
    width: Option<u32>,

    /// Output height override (must be even).
    #[arg(long)]
    height: Option<u32>,

    /// Media root directory. Defaults to the composition's directory.
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Font registrations as `family=path/to/font.ttf` (repeatable).
    #[arg(long = "font")]
    fonts: Vec<String>,
}

#[derive(Parser, Debug)]
struct FrameArgs {
    /// Input composition JSON.
    #[arg(long = "in")]
    in_path: PathBuf,

    /// Frame index (0-based).
    #[arg(long)]
    frame: u64,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    /// Media root directory. Defaults to the composition's directory.
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Font registrations as `family=path/to/font.ttf` (repeatable).
    #[arg(long = "font")]
    fonts: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Command::Render(args) => cmd_render(args),
        Command::Frame(args) => cmd_frame(args),
    }
}

fn read_comp_json(path: &Path) -> anyhow::Result<montage::Composition> {
    let f = File::open(path).with_context(|| format!("open composition '{}'", path.display()))?;
    let r = BufReader::new(f);
    let comp: montage::Composition =
        serde_json::from_reader(r).with_context(|| "parse composition JSON")?;
    Ok(comp)
}

fn media_root(explicit: Option<PathBuf>, in_path: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| {
        in_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf()
    })
}

fn font_provider(specs: &[String]) -> anyhow::Result<montage::FsFontProvider> {
    let fonts = montage::FsFontProvider::new();
    for spec in specs {
        let (family, path) = spec
            .split_once('=')
            .with_context(|| format!("font spec '{spec}' must be family=path"))?;
        fonts.register(family, path);
    }
    Ok(fonts)
}

fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let comp = read_comp_json(&args.in_path)?;
    comp.validate()?;

    let media = montage::FsMediaStore::new(media_root(args.media_root, &args.in_path));
    let fonts = font_provider(&args.fonts)?;

    let range = match (args.in_point, args.out_point) {
        (Some(i), Some(o)) => Some(montage::FrameRange::new(
            montage::FrameIndex(i),
            montage::FrameIndex(o),
        )?),
        (None, None) => None,
        _ => anyhow::bail!("--in-point and --out-point must be given together"),
    };

    let mut settings = montage::ExportSettings::mp4(
        args.width.unwrap_or(comp.width),
        args.height.unwrap_or(comp.height),
        comp.fps,
    );
    if let Some(container) = &args.container {
        settings.container = montage::Container::parse(container)?;
    }

    let options = montage::RenderOptions {
        settings: Some(settings),
        range,
        cancel: montage::CancellationToken::new(),
    };

    let library = montage::CompositionLibrary::new();
    let mut encoder = montage::FfmpegEncoder::new();
    let mut progress = |p: montage::RenderProgress| {
        if let (Some(current), Some(total)) = (p.current_frame, p.total_frames) {
            eprint!("\rrendering {}/{total}", current + 1);
            if current + 1 == total {
                eprintln!();
            }
        }
    };

    let result = montage::render(
        &comp,
        &library,
        &media,
        &fonts,
        &mut encoder,
        &options,
        Some(&mut progress),
    )?;

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&args.out, &result.bytes)
        .with_context(|| format!("write output '{}'", args.out.display()))?;

    eprintln!(
        "wrote {} ({} bytes, {:.2}s, {})",
        args.out.display(),
        result.byte_size,
        result.duration_seconds,
        result.mime_type
    );
    Ok(())
}

fn cmd_frame(args: FrameArgs) -> anyhow::Result<()> {
    let comp = read_comp_json(&args.in_path)?;
    comp.validate()?;

    let media = montage::FsMediaStore::new(media_root(args.media_root, &args.in_path));
    let fonts = font_provider(&args.fonts)?;
    let library = montage::CompositionLibrary::new();

    let resolved = montage::resolve(&comp, None)?;
    let canvas = resolved.canvas;
    let mut compositor = montage::Compositor::new(resolved, &library, &media, &fonts)?;
    let mut surface = montage::Surface::new(canvas.width, canvas.height)?;
    compositor.render_frame(args.frame, &mut surface)?;

    let bg = montage::parse_hex_rgba(&comp.background_color)?;
    montage::flatten_over_background(surface.data_mut(), bg);

    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    image::save_buffer_with_format(
        &args.out,
        surface.data(),
        surface.width(),
        surface.height(),
        image::ColorType::Rgba8,
        image::ImageFormat::Png,
    )
    .with_context(|| format!("write png '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}
