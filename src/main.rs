use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use m2m_codec::codec::{split_nal_units, AacEncode, CodecKind, MediaCaps};
use m2m_codec::config::{ElementSettings, Property};
use m2m_codec::device::{DeviceOpener, SimulatedDevice, SimulatedOpener, V4l2Opener};
use m2m_codec::engine::{StreamEngine, StreamState};
use m2m_codec::format::{Fraction, PixelFormat, Resolution};
use m2m_codec::pipeline::{CodecPipeline, PipelineInput, PipelineOutput};

/// Device path reported by the simulated device
const SIMULATED_DEVICE: &str = "/dev/sim0";

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// m2m-codec command line arguments
#[derive(Parser, Debug)]
#[command(name = "m2m-codec")]
#[command(version, about = "Run a file through a hardware M2M codec", long_about = None)]
struct CliArgs {
    /// Codec to run (h264enc, h264dec, jpegenc, aacenc)
    #[arg(short = 'c', long, value_name = "CODEC")]
    codec: CodecKind,

    /// Input file: raw frames, raw S16LE audio or an H.264 byte stream
    #[arg(short = 'i', long, value_name = "FILE")]
    input: PathBuf,

    /// Output file
    #[arg(short = 'o', long, value_name = "FILE")]
    output: PathBuf,

    /// Picture width
    #[arg(long, default_value_t = 1920)]
    width: u32,

    /// Picture height
    #[arg(long, default_value_t = 1080)]
    height: u32,

    /// Raw pixel format (nv12, yuv420, yuyv, ...)
    #[arg(long, default_value = "nv12")]
    format: PixelFormat,

    /// Frame rate as num/den
    #[arg(long, default_value = "30/1")]
    framerate: Fraction,

    /// Audio sample rate
    #[arg(long, default_value_t = 44100)]
    rate: u32,

    /// Audio channels
    #[arg(long, default_value_t = 2)]
    channels: u32,

    /// Element property as name=value (repeatable)
    #[arg(short = 'p', long = "property", value_name = "NAME=VALUE")]
    properties: Vec<String>,

    /// JSON settings file, applied before --property
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run against an in-process device that echoes its input
    #[arg(long)]
    simulate: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting m2m-codec v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => ElementSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ElementSettings::default(),
    };

    let opener: Arc<dyn DeviceOpener> = if args.simulate {
        tracing::info!("Using simulated device");
        settings.device = Some(PathBuf::from(SIMULATED_DEVICE));
        Arc::new(SimulatedOpener::new(|path| {
            SimulatedDevice::passthrough(path.display().to_string())
        }))
    } else {
        Arc::new(V4l2Opener)
    };

    let engine = StreamEngine::new(args.codec, opener).with_settings(settings);
    for assignment in &args.properties {
        let property = Property::parse(assignment)?;
        tracing::debug!("Setting {}", assignment);
        engine.set_property(property)?;
    }

    let caps = input_caps(&args);
    let negotiated = engine.set_caps(caps.clone())?;
    tracing::info!(
        "{}: {} -> {} ({} slots)",
        engine.name(),
        negotiated.input_caps(),
        negotiated.output_caps(),
        negotiated.slot_count()
    );
    engine.set_state(StreamState::Playing)?;
    let engine = Arc::new(engine);

    let mut events = engine.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.is_error() {
                tracing::warn!("[{}] {:?}", event.event_name(), event);
            } else {
                tracing::debug!("[{}] {:?}", event.event_name(), event);
            }
        }
    });

    let data = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("reading {}", args.input.display()))?;
    let chunks = split_input(args.codec, &caps, Bytes::from(data));
    let interval = buffer_interval(&caps);
    tracing::info!("Read {} buffers from {}", chunks.len(), args.input.display());

    let mut output = tokio::fs::File::create(&args.output)
        .await
        .with_context(|| format!("creating {}", args.output.display()))?;

    let mut pipeline = CodecPipeline::spawn(engine.clone());
    let producer = pipeline.input();
    let feeder = tokio::spawn(async move {
        for (n, data) in chunks.into_iter().enumerate() {
            let timestamp = interval * n as u32;
            if producer
                .send(PipelineInput::Buffer { data, timestamp })
                .await
                .is_err()
            {
                return;
            }
        }
        let _ = producer.send(PipelineInput::EndOfStream).await;
    });

    let mut written = 0usize;
    let mut failure = None;
    while let Some(message) = pipeline.recv().await {
        match message {
            PipelineOutput::Buffer {
                data,
                sequence,
                corrupted,
                ..
            } => {
                if corrupted {
                    tracing::warn!("Frame {} is marked corrupted", sequence);
                }
                output.write_all(&data).await?;
                written += data.len();
            }
            PipelineOutput::EndOfStream => break,
            PipelineOutput::Error(reason) => {
                tracing::error!("Pipeline error: {}", reason);
                if engine.state() != StreamState::Playing {
                    failure = Some(reason);
                    break;
                }
            }
        }
    }
    output.flush().await?;

    pipeline.stop();
    feeder.abort();
    let stats = pipeline.join().await?;
    engine.set_state(StreamState::Null)?;

    if let Some(reason) = failure {
        anyhow::bail!("{} failed: {}", engine.name(), reason);
    }

    tracing::info!(
        "Wrote {} bytes to {} ({} in, {} out, {} backpressure waits)",
        written,
        args.output.display(),
        stats.buffers_in,
        stats.frames_out,
        stats.backpressure_waits
    );
    Ok(())
}

/// Caps describing the input file for the selected codec
fn input_caps(args: &CliArgs) -> MediaCaps {
    match args.codec {
        CodecKind::H264Encode | CodecKind::JpegEncode => {
            MediaCaps::raw_video(args.format, args.width, args.height, args.framerate)
        }
        CodecKind::H264Decode => MediaCaps::H264 {
            resolution: Resolution::new(args.width, args.height),
            framerate: args.framerate,
        },
        CodecKind::AacEncode => MediaCaps::raw_audio(args.rate, args.channels),
    }
}

/// Cut the input into the buffers the codec consumes
fn split_input(kind: CodecKind, caps: &MediaCaps, data: Bytes) -> Vec<Bytes> {
    let size = match (kind, caps) {
        (CodecKind::H264Decode, _) => {
            return split_nal_units(&data)
                .into_iter()
                .map(|unit| data.slice_ref(unit))
                .collect();
        }
        (_, MediaCaps::RawVideo {
            format, resolution, ..
        }) => format.frame_size(resolution.width, resolution.height),
        (_, MediaCaps::RawAudio { channels, .. }) => AacEncode::frame_bytes(*channels),
        _ => data.len(),
    };

    if size == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity(data.len() / size + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Presentation time between consecutive input buffers
fn buffer_interval(caps: &MediaCaps) -> Duration {
    match caps {
        MediaCaps::RawVideo { framerate, .. } | MediaCaps::H264 { framerate, .. } => {
            framerate.frame_duration().unwrap_or_default()
        }
        MediaCaps::RawAudio { rate, .. } if *rate > 0 => Duration::from_nanos(
            m2m_codec::codec::aac::SAMPLES_PER_FRAME as u64 * 1_000_000_000 / *rate as u64,
        ),
        _ => Duration::ZERO,
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "m2m_codec=error",
        LogLevel::Warn => "m2m_codec=warn",
        LogLevel::Info => "m2m_codec=info",
        LogLevel::Verbose => "m2m_codec=debug,m2m_codec::pool=info",
        LogLevel::Debug => "m2m_codec=debug",
        LogLevel::Trace => "m2m_codec=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_raw_frames() {
        let caps = MediaCaps::raw_video(PixelFormat::Nv12, 4, 2, Fraction::new(30, 1));
        let data = Bytes::from(vec![0u8; 12 * 2 + 5]);
        let chunks = split_input(CodecKind::JpegEncode, &caps, data);
        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![12, 12, 5]
        );
    }

    #[test]
    fn test_split_audio_and_bitstream() {
        let caps = MediaCaps::raw_audio(48000, 1);
        let chunks = split_input(CodecKind::AacEncode, &caps, Bytes::from(vec![0u8; 4096]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2048);

        let caps = MediaCaps::H264 {
            resolution: Resolution::new(320, 240),
            framerate: Fraction::new(25, 1),
        };
        let stream = Bytes::from_static(&[0, 0, 0, 1, 0x67, 1, 0, 0, 1, 0x65, 2]);
        let chunks = split_input(CodecKind::H264Decode, &caps, stream);
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[1][..], &[0, 0, 1, 0x65, 2]);
    }

    #[test]
    fn test_buffer_interval() {
        let video = MediaCaps::raw_video(PixelFormat::Nv12, 4, 2, Fraction::new(25, 1));
        assert_eq!(buffer_interval(&video), Duration::from_millis(40));
        let audio = MediaCaps::raw_audio(48000, 2);
        assert_eq!(buffer_interval(&audio), Duration::from_nanos(21_333_333));
    }
}
