//! Command-line renderer: decode a song string (URL or JSON file) and
//! render it to a WAV file or print its summary.

use std::env;
use std::fs;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use chipbox::{Song, Synth};

const USAGE: &str = "\
Usage: chipbox [OPTIONS] <SONG>

SONG is a song URL string, or a path to a file containing one (URL or
JSON form).

Options:
  -o, --output <FILE>    Write a 16-bit stereo WAV here (default: out.wav)
  -d, --duration <SECS>  Seconds to render (default: one full loop)
  -r, --rate <HZ>        Sample rate (default: 44100)
  -j, --json <FILE>      Also export the song as JSON
      --info             Print the song summary and exit
  -h, --help             Show this help
";

struct Args {
    song: String,
    output: String,
    duration: Option<f64>,
    sample_rate: u32,
    json_output: Option<String>,
    info_only: bool,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = env::args().skip(1);
    let mut song = None;
    let mut output = "out.wav".to_string();
    let mut duration = None;
    let mut sample_rate = 44_100;
    let mut json_output = None;
    let mut info_only = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "-o" | "--output" => {
                output = args.next().context("--output needs a file name")?;
            }
            "-d" | "--duration" => {
                let value = args.next().context("--duration needs a number")?;
                duration = Some(value.parse::<f64>().context("invalid duration")?);
            }
            "-r" | "--rate" => {
                let value = args.next().context("--rate needs a number")?;
                sample_rate = value.parse::<u32>().context("invalid sample rate")?;
            }
            "-j" | "--json" => {
                json_output = Some(args.next().context("--json needs a file name")?);
            }
            "--info" => info_only = true,
            other if song.is_none() && !other.starts_with('-') => {
                song = Some(other.to_string());
            }
            other => bail!("unrecognized argument: {other}"),
        }
    }

    match song {
        Some(song) => Ok(Some(Args {
            song,
            output,
            duration,
            sample_rate,
            json_output,
            info_only,
        })),
        None => Ok(None),
    }
}

fn load_song(input: &str) -> Result<Song> {
    // A file path wins over an inline song string when it exists.
    let data = match fs::metadata(input) {
        Ok(metadata) if metadata.is_file() => {
            fs::read_to_string(input).with_context(|| format!("reading {input}"))?
        }
        _ => input.to_string(),
    };
    Song::from_url(data.trim()).context("decoding song")
}

fn run() -> Result<()> {
    let args = match parse_args()? {
        Some(args) => args,
        None => {
            print!("{USAGE}");
            return Ok(());
        }
    };

    let song = load_song(&args.song)?;
    println!("  {}", song.info());

    if let Some(path) = &args.json_output {
        let json = serde_json::to_string_pretty(&song.to_json())?;
        fs::write(path, json).with_context(|| format!("writing {path}"))?;
        println!("  Wrote JSON to {path}");
    }
    if args.info_only {
        return Ok(());
    }

    let duration = args.duration.unwrap_or_else(|| {
        song.seconds_per_bar() * (song.loop_start + song.loop_length) as f64
    });
    let mut synth = Synth::with_sample_rate(song, args.sample_rate as f64);
    synth.play();

    let total = (duration * args.sample_rate as f64).ceil() as usize;
    let mut left = vec![0.0f32; total];
    let mut right = vec![0.0f32; total];
    let chunk = 2048;
    let mut index = 0;
    while index < total {
        let end = (index + chunk).min(total);
        synth.synthesize(&mut left[index..end], &mut right[index..end]);
        index = end;
    }

    chipbox::wav::write_wav(&left, &right, args.sample_rate, &args.output)?;
    println!(
        "  Rendered {duration:.2}s at {} Hz to {}",
        args.sample_rate, args.output
    );
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}
