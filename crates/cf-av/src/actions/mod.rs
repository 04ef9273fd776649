//! Engine invocation building.
//!
//! [`build_invocation`] maps validated [`JobParams`] to a deterministic
//! argument vector. ffmpeg invocations always emit machine-readable progress
//! on stderr (`-progress pipe:2 -nostats`) and keep regular logging at the
//! error level so that diagnostics stay short.

mod tempo;

pub use tempo::{atempo_chain, atempo_filter, ATEMPO_MAX, ATEMPO_MIN};

use std::path::Path;

use cf_core::{Error, FilterType, JobParams, Result, RotateDirection};

use crate::tools::{FFMPEG, FFPROBE};

/// Thumbnail frame size, `WIDTH:HEIGHT`.
pub const THUMBNAIL_SCALE: &str = "640:360";

/// Which engine binary an invocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Ffmpeg,
    Ffprobe,
}

impl Engine {
    pub fn tool_name(&self) -> &'static str {
        match self {
            Engine::Ffmpeg => FFMPEG,
            Engine::Ffprobe => FFPROBE,
        }
    }
}

/// A fully built engine command line (without the program itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub engine: Engine,
    pub args: Vec<String>,
}

/// Build the engine invocation for `params`.
///
/// `output` is required for every kind that produces a file and ignored for
/// metadata probes.
pub fn build_invocation(params: &JobParams, input: &Path, output: Option<&Path>) -> Result<Invocation> {
    let input = input.to_string_lossy().to_string();

    let output = match (params, output) {
        (JobParams::Metadata, _) => {
            return Ok(Invocation {
                engine: Engine::Ffprobe,
                args: ffprobe_args(&input),
            })
        }
        (_, Some(output)) => output.to_string_lossy().to_string(),
        (_, None) => {
            return Err(Error::Internal(format!(
                "{} job needs an output path",
                params.kind()
            )))
        }
    };

    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y", "-loglevel", "error"]
        .into_iter()
        .chain(["-progress", "pipe:2", "-nostats"])
        .map(String::from)
        .collect();

    match params {
        JobParams::Trim {
            start_time,
            end_time,
        } => {
            push(&mut args, ["-ss", &fmt_secs(*start_time), "-i", &input]);
            push(&mut args, ["-t", &fmt_secs(end_time - start_time)]);
        }
        JobParams::Speed { factor } => {
            push(&mut args, ["-i", &input]);
            push(&mut args, ["-filter:v", &format!("setpts={}*PTS", 1.0 / factor)]);
            push(&mut args, ["-filter:a", &atempo_filter(*factor)]);
        }
        JobParams::Filter { filter } => {
            push(&mut args, ["-i", &input, "-vf", filter_graph(*filter)]);
        }
        JobParams::Volume { level } => {
            push(&mut args, ["-i", &input, "-af", &format!("volume={level}")]);
        }
        JobParams::Crop {
            width,
            height,
            x,
            y,
        } => {
            push(
                &mut args,
                ["-i", &input, "-vf", &format!("crop={width}:{height}:{x}:{y}")],
            );
        }
        JobParams::Rotate { direction } => {
            push(&mut args, ["-i", &input, "-vf", rotate_graph(*direction)]);
        }
        JobParams::Thumbnail { timestamp } => {
            push(&mut args, ["-ss", &fmt_secs(*timestamp), "-i", &input]);
            push(
                &mut args,
                ["-frames:v", "1", "-vf", &format!("scale={THUMBNAIL_SCALE}"), "-q:v", "2"],
            );
        }
        JobParams::Export {
            resolution,
            fps,
            format: _,
        } => {
            push(&mut args, ["-i", &input]);
            if let Some(res) = resolution {
                push(&mut args, ["-s", &res.to_string()]);
            }
            if let Some(fps) = fps {
                push(&mut args, ["-r", &fps.to_string()]);
            }
        }
        JobParams::Metadata => {}
    }

    args.push(output);
    Ok(Invocation {
        engine: Engine::Ffmpeg,
        args,
    })
}

/// Arguments for a JSON ffprobe report on `input`.
pub fn ffprobe_args(input: &str) -> Vec<String> {
    [
        "-v",
        "error",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
        input,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn push<'a>(args: &mut Vec<String>, items: impl IntoIterator<Item = &'a str>) {
    args.extend(items.into_iter().map(String::from));
}

fn fmt_secs(secs: f64) -> String {
    format!("{secs:.3}")
}

fn filter_graph(filter: FilterType) -> &'static str {
    match filter {
        FilterType::Grayscale => "hue=s=0",
        FilterType::Sepia => {
            "colorchannelmixer=.393:.769:.189:0:.349:.686:.168:0:.272:.534:.131"
        }
        FilterType::Brightness => "eq=brightness=0.3",
        FilterType::Blur => "boxblur=5:1",
    }
}

fn rotate_graph(direction: RotateDirection) -> &'static str {
    match direction {
        RotateDirection::Clockwise => "transpose=1",
        RotateDirection::CounterClockwise => "transpose=2",
        RotateDirection::FlipHorizontal => "hflip",
        RotateDirection::FlipVertical => "vflip",
    }
}
