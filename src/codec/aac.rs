//! AAC-LC encoder constraint table and sizing

use super::caps::AacStreamFormat;
use super::constraints::{self, ConstraintViolation};
use super::controls::*;
use super::{
    unsupported_caps, AudioParams, ChannelMode, CodecEngine, CodecKind, CodecMode, MediaCaps,
    MediaParams, RateTarget, SlotSizes, StreamConfiguration,
};
use crate::config::ElementSettings;

/// PCM samples per channel consumed by one access unit
pub const SAMPLES_PER_FRAME: usize = 1024;

/// Bytes per interleaved PCM sample
const BYTES_PER_SAMPLE: usize = 2;

/// Largest access unit per channel (6144 bits)
const MAX_AU_BYTES_PER_CHANNEL: usize = 768;

const ADTS_HEADER_LEN: usize = 7;

/// Driver-private FourCC of interleaved S16LE PCM
pub const PCM_FOURCC: [u8; 4] = *b"LPCM";
pub const AAC_FOURCC: [u8; 4] = *b"AAC ";

#[derive(Debug, Clone, Copy, Default)]
pub struct AacEncode;

impl AacEncode {
    /// PCM bytes making up one input frame
    pub fn frame_bytes(channels: u32) -> usize {
        SAMPLES_PER_FRAME * channels as usize * BYTES_PER_SAMPLE
    }

    fn channel_mode(
        settings: &ElementSettings,
        channels: u32,
    ) -> Result<ChannelMode, ConstraintViolation> {
        let mode = match (settings.channel_mode, channels) {
            (Some(mode), _) => mode,
            (None, 1) => ChannelMode::Mono,
            (None, 2) => ChannelMode::Stereo,
            (None, channels) => {
                return Err(ConstraintViolation::UnsupportedChannels { channels })
            }
        };
        if mode.channels() != channels {
            return Err(ConstraintViolation::ChannelModeMismatch { mode, channels });
        }
        Ok(mode)
    }

    fn audio(config: &StreamConfiguration) -> Option<AudioParams> {
        config.audio()
    }
}

impl CodecEngine for AacEncode {
    fn kind(&self) -> CodecKind {
        CodecKind::AacEncode
    }

    fn configure(
        &self,
        settings: &ElementSettings,
        caps: &MediaCaps,
    ) -> Result<StreamConfiguration, ConstraintViolation> {
        let MediaCaps::RawAudio { rate, channels } = *caps else {
            return Err(unsupported_caps(self.kind(), caps));
        };

        let channel_mode = Self::channel_mode(settings, channels)?;
        let sample_rate_index = constraints::aac_sample_rate_index(rate)
            .ok_or(ConstraintViolation::UnsupportedSampleRate { rate })?;

        // An unset bitrate picks the nearest legal value to the default
        let bitrate = match settings.bitrate {
            0 => {
                let default = self.property_ranges().default_bitrate;
                constraints::aac_stream_bitrate_range(rate, channel_mode)
                    .map(|r| default.clamp(*r.start(), *r.end()))
                    .unwrap_or(default)
            }
            b => b,
        };

        Ok(StreamConfiguration {
            kind: self.kind(),
            media: MediaParams::Audio(AudioParams {
                sample_rate: rate,
                sample_rate_index,
                channel_mode,
            }),
            rate: RateTarget::Bitrate(bitrate),
            mode: CodecMode::Aac {
                enable_cbr: settings.enable_cbr,
                output: settings.aac_output,
            },
        })
    }

    fn validate(&self, config: &StreamConfiguration) -> Result<(), ConstraintViolation> {
        let audio = Self::audio(config).ok_or_else(|| ConstraintViolation::UnsupportedCaps {
            codec: self.kind().to_string(),
            caps: "video".to_string(),
        })?;
        let bitrate = match config.rate {
            RateTarget::Bitrate(0) | RateTarget::Unspecified | RateTarget::Quality(_) => {
                return Err(ConstraintViolation::MissingBitrate)
            }
            RateTarget::Bitrate(b) => b,
        };
        constraints::check_aac_bitrate(audio.sample_rate, audio.channel_mode, bitrate)
    }

    fn output_caps(&self, config: &StreamConfiguration) -> MediaCaps {
        let stream_format = match config.mode {
            CodecMode::Aac { output, .. } => output,
            _ => AacStreamFormat::Raw,
        };
        let (rate, channels) = Self::audio(config)
            .map(|a| (a.sample_rate, a.channel_mode.channels()))
            .unwrap_or((0, 0));
        MediaCaps::Aac {
            rate,
            channels,
            stream_format,
        }
    }

    fn slot_sizes(&self, config: &StreamConfiguration) -> SlotSizes {
        let channels = Self::audio(config)
            .map(|a| a.channel_mode.channels())
            .unwrap_or(2);
        SlotSizes {
            input: Self::frame_bytes(channels),
            output: MAX_AU_BYTES_PER_CHANNEL * channels as usize + ADTS_HEADER_LEN,
        }
    }

    fn default_slot_count(&self) -> usize {
        8
    }

    fn input_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        PCM_FOURCC
    }

    fn output_fourcc(&self, _config: &StreamConfiguration) -> [u8; 4] {
        AAC_FOURCC
    }

    fn controls(&self, config: &StreamConfiguration) -> Vec<DeviceControl> {
        let mut controls = Vec::new();
        if let Some(audio) = Self::audio(config) {
            controls.push(DeviceControl::new(
                CID_AAC_SAMPLE_RATE_INDEX,
                audio.sample_rate_index as i32,
                "sample_rate_index",
            ));
            controls.push(DeviceControl::new(
                CID_AUDIO_MODE,
                audio.channel_mode.v4l2_value(),
                "audio_mode",
            ));
        }
        if let Some(bitrate) = config.bitrate() {
            controls.push(DeviceControl::new(
                CID_AUDIO_AAC_BITRATE,
                bitrate as i32,
                "aac_bitrate",
            ));
        }
        if let CodecMode::Aac { enable_cbr, output } = config.mode {
            controls.push(DeviceControl::new(
                CID_AAC_ENABLE_CBR,
                enable_cbr as i32,
                "enable_cbr",
            ));
            controls.push(DeviceControl::new(
                CID_AAC_OUTPUT_FORMAT,
                matches!(output, AacStreamFormat::Adts) as i32,
                "output_format",
            ));
        }
        controls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::negotiate;
    use crate::config::{Property, PropertyRanges};

    fn with_bitrate(bitrate: u32) -> ElementSettings {
        ElementSettings {
            bitrate,
            ..Default::default()
        }
    }

    #[test]
    fn test_bitrate_table_mono() {
        for (rate, min, max) in constraints::AAC_BITRATE_TABLE {
            let caps = MediaCaps::raw_audio(rate, 1);
            for bitrate in [min, (min + max) / 2, max] {
                assert!(negotiate(&AacEncode, &with_bitrate(bitrate), &caps).is_ok());
            }
            assert!(negotiate(&AacEncode, &with_bitrate(max + 1), &caps).is_err());
            assert!(negotiate(&AacEncode, &with_bitrate(min - 1), &caps).is_err());
        }
    }

    #[test]
    fn test_property_clamp_then_negotiate() {
        // 8 kHz lower bound coincides with the property minimum
        let ranges = PropertyRanges::for_codec(CodecKind::AacEncode);
        let mut settings = ElementSettings::default();
        settings.apply(Property::Bitrate(15999), &ranges);
        let caps = MediaCaps::raw_audio(8000, 1);
        assert!(negotiate(&AacEncode, &settings, &caps).is_ok());

        // 48 kHz upper bound coincides with the property maximum
        settings.apply(Property::Bitrate(288001), &ranges);
        let caps = MediaCaps::raw_audio(48000, 1);
        assert!(negotiate(&AacEncode, &settings, &caps).is_ok());
    }

    #[test]
    fn test_stereo_288k_at_44100() {
        let settings = ElementSettings {
            bitrate: 288000,
            aac_output: AacStreamFormat::Raw,
            ..Default::default()
        };
        let n = negotiate(&AacEncode, &settings, &MediaCaps::raw_audio(44100, 2)).unwrap();
        assert_eq!(
            *n.output_caps(),
            MediaCaps::Aac {
                rate: 44100,
                channels: 2,
                stream_format: AacStreamFormat::Raw,
            }
        );
        let audio = n.config().audio().unwrap();
        assert_eq!(audio.sample_rate_index, 4);
        assert_eq!(audio.channel_mode, ChannelMode::Stereo);
        assert_eq!(AacEncode::frame_bytes(2), 4096);
        assert_eq!(n.slot_sizes().input, 4096);
    }

    #[test]
    fn test_default_bitrate_fits_rate() {
        let n = negotiate(
            &AacEncode,
            &ElementSettings::default(),
            &MediaCaps::raw_audio(8000, 1),
        )
        .unwrap();
        assert_eq!(n.config().bitrate(), Some(48000));
    }

    #[test]
    fn test_channel_modes() {
        let dual = ElementSettings {
            channel_mode: Some(ChannelMode::DualMono),
            bitrate: 128000,
            ..Default::default()
        };
        assert!(negotiate(&AacEncode, &dual, &MediaCaps::raw_audio(48000, 2)).is_ok());
        assert!(matches!(
            negotiate(&AacEncode, &dual, &MediaCaps::raw_audio(48000, 1)),
            Err(ConstraintViolation::ChannelModeMismatch { .. })
        ));
        assert!(matches!(
            negotiate(&AacEncode, &with_bitrate(128000), &MediaCaps::raw_audio(48000, 6)),
            Err(ConstraintViolation::UnsupportedChannels { channels: 6 })
        ));
    }

    #[test]
    fn test_unsupported_rate() {
        assert!(matches!(
            negotiate(&AacEncode, &with_bitrate(128000), &MediaCaps::raw_audio(96000, 2)),
            Err(ConstraintViolation::UnsupportedSampleRate { rate: 96000 })
        ));
        assert!(matches!(
            negotiate(&AacEncode, &with_bitrate(128000), &MediaCaps::raw_audio(44000, 2)),
            Err(ConstraintViolation::UnsupportedSampleRate { rate: 44000 })
        ));
    }
}
