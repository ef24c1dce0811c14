//! V4L2 control identifiers used to program the codecs

/// `V4L2_CTRL_CLASS_CODEC | 0x900`
const CODEC_BASE: u32 = 0x0099_0900;
/// `V4L2_CTRL_CLASS_JPEG | 0x900`
const JPEG_BASE: u32 = 0x009d_0900;
/// Driver-private controls of the AAC encoder
const PRIVATE_BASE: u32 = 0x0800_0000;

pub const CID_AUDIO_MODE: u32 = CODEC_BASE + 105;
pub const CID_AUDIO_AAC_BITRATE: u32 = CODEC_BASE + 110;
pub const CID_VIDEO_B_FRAMES: u32 = CODEC_BASE + 202;
pub const CID_VIDEO_GOP_SIZE: u32 = CODEC_BASE + 203;
pub const CID_VIDEO_BITRATE_MODE: u32 = CODEC_BASE + 206;
pub const CID_VIDEO_BITRATE: u32 = CODEC_BASE + 207;
pub const CID_VIDEO_FRAME_RC_ENABLE: u32 = CODEC_BASE + 215;
pub const CID_JPEG_COMPRESSION_QUALITY: u32 = JPEG_BASE + 3;
pub const CID_AAC_SAMPLE_RATE_INDEX: u32 = PRIVATE_BASE;
pub const CID_AAC_ENABLE_CBR: u32 = PRIVATE_BASE + 1;
pub const CID_AAC_OUTPUT_FORMAT: u32 = PRIVATE_BASE + 2;

/// One control write issued after the formats are set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceControl {
    pub id: u32,
    pub value: i32,
    pub name: &'static str,
}

impl DeviceControl {
    pub const fn new(id: u32, value: i32, name: &'static str) -> Self {
        Self { id, value, name }
    }
}

/// Which stop command flushes the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainKind {
    /// `VIDIOC_ENCODER_CMD(V4L2_ENC_CMD_STOP)`
    Encoder,
    /// `VIDIOC_DECODER_CMD(V4L2_DEC_CMD_STOP)`
    Decoder,
}
