use std::{
    collections::HashMap,
    fs,
    io::stderr,
    path::{Path, PathBuf},
    str::FromStr,
    time::SystemTime,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use fern::Dispatch;
use log::{LevelFilter, info, warn};
use opencv::{
    core::Mat,
    imgcodecs::{IMREAD_ANYDEPTH, IMREAD_COLOR, imread},
    prelude::*,
};
use perception::{
    AcceptedObject, AiBox, CameraMount, ClassKey, ColorKind, DepthMap, Frame, Intrinsics,
    Params, ParamsStore, Pipeline, Publisher, ShapeKind, encode_object_message, to_hex,
};
use serde::Serialize;

const COLOR_SUFFIX: &str = "_color.png";
const DEPTH_SUFFIX: &str = "_depth.png";
const AI_SUFFIX: &str = "_ai.json";

#[derive(Parser)]
#[command(name = "replay")]
#[command(about = "Replay recorded color and depth frames through the perception pipeline")]
#[command(version)]
struct Cli {
    /// Directory of `<name>_color.png`, `<name>_depth.png` and optional `<name>_ai.json` files.
    #[arg(long)]
    frames: PathBuf,

    /// Nested parameter JSON file.
    #[arg(long, conflicts_with_all = ["flat", "db"])]
    params: Option<PathBuf>,

    /// Flat `block.field` to number JSON file.
    #[arg(long, conflicts_with = "db")]
    flat: Option<PathBuf>,

    /// Preset database, created if missing.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Preset to load from `--db`.
    #[arg(long, default_value = "default")]
    preset: String,

    /// Target class as `<color>_<shape>`, repeatable.
    #[arg(long = "target", default_values_t = ["red_circle".to_string(), "blue_square".to_string()])]
    targets: Vec<String>,

    #[arg(long, default_value = "615.0")]
    fx: f64,

    #[arg(long, default_value = "615.0")]
    fy: f64,

    #[arg(long, default_value = "320.0")]
    cx: f64,

    #[arg(long, default_value = "240.0")]
    cy: f64,

    /// Report robot-frame positions using the default camera mount.
    #[arg(long)]
    mount: bool,

    /// Log at debug level.
    #[arg(long)]
    verbose: bool,

    /// Also append logs to this file.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Logs each encoded object message.
struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&mut self, object: &AcceptedObject) -> Result<()> {
        info!(
            target: "publish",
            "{} {}",
            object.decision.label,
            to_hex(&encode_object_message(object))
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct FrameLine<'a> {
    frame: &'a str,
    #[serde(flatten)]
    report: perception::FrameReport,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let params = load_params(&cli)?;
    let targets = cli
        .targets
        .iter()
        .map(|target| parse_target(target))
        .collect::<Result<Vec<_>>>()?;
    let intrinsics = Intrinsics {
        fx: cli.fx,
        fy: cli.fy,
        cx: cli.cx,
        cy: cli.cy,
    };
    let mount = cli.mount.then(CameraMount::default);
    let mut pipeline = Pipeline::new(targets, Box::new(LogPublisher), mount)?;

    let names = frame_names(&cli.frames)?;
    if names.is_empty() {
        bail!("no *{COLOR_SUFFIX} frames in {}", cli.frames.display());
    }
    info!(target: "replay", "replaying {} frames", names.len());

    for name in &names {
        let frame = read_frame(&cli.frames, name, intrinsics)
            .with_context(|| format!("failed to read frame {name}"))?;
        let report = pipeline.process(&frame, &params)?;
        println!(
            "{}",
            serde_json::to_string(&FrameLine {
                frame: name,
                report
            })?
        );
    }

    Ok(())
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose || cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(stderr());
    if let Some(path) = &cli.log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    log_panics::init();
    Ok(())
}

fn load_params(cli: &Cli) -> Result<Params> {
    if let Some(path) = &cli.params {
        let params = serde_json::from_str::<Params>(&fs::read_to_string(path)?)?;
        params.validate()?;
        return Ok(params);
    }
    if let Some(path) = &cli.flat {
        let values = serde_json::from_str::<HashMap<String, f64>>(&fs::read_to_string(path)?)?;
        return Ok(Params::from_flat(&values)?);
    }
    if let Some(path) = &cli.db {
        let store = ParamsStore::open(path)?;
        return Ok(store.query_or_upsert_preset(&cli.preset)?.params);
    }

    Ok(Params::default())
}

/// Parses `<color>_<shape>`, e.g. `neon_yellow_rectangle`.
fn parse_target(target: &str) -> Result<ClassKey> {
    let (color, shape) = target
        .rsplit_once('_')
        .ok_or_else(|| anyhow!("target {target} is not <color>_<shape>"))?;
    let color = ColorKind::from_str(color).with_context(|| format!("unknown color in {target}"))?;
    let shape = ShapeKind::from_str(shape).with_context(|| format!("unknown shape in {target}"))?;

    Ok(ClassKey::new(shape, color))
}

fn frame_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|file| file.strip_suffix(COLOR_SUFFIX))
                .map(ToString::to_string)
        })
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn read_frame(dir: &Path, name: &str, intrinsics: Intrinsics) -> Result<Frame> {
    let bgr = read_image(&dir.join(format!("{name}{COLOR_SUFFIX}")), IMREAD_COLOR)?;
    let depth = read_image(&dir.join(format!("{name}{DEPTH_SUFFIX}")), IMREAD_ANYDEPTH)?;
    let depth = DepthMap::from_mat(&depth)?;
    if depth.rows() != bgr.rows() || depth.cols() != bgr.cols() {
        warn!(target: "replay", "frame {name} depth is not aligned with color");
    }

    let ai_path = dir.join(format!("{name}{AI_SUFFIX}"));
    let ai_boxes = if ai_path.exists() {
        serde_json::from_str::<Vec<AiBox>>(&fs::read_to_string(ai_path)?)?
    } else {
        vec![]
    };

    Ok(Frame {
        bgr,
        depth,
        intrinsics,
        ai_boxes,
    })
}

fn read_image(path: &Path, flags: i32) -> Result<Mat> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("non UTF-8 path {}", path.display()))?;
    let image = imread(path_str, flags)?;
    if image.empty() {
        bail!("could not read {}", path.display());
    }
    Ok(image)
}
