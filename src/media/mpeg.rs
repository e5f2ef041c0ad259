//! MPEG audio frame header parsing
//!
//! Fallback files are typically MP3, and looping them cleanly requires the
//! exact byte offset of the first real codec frame (ID3 tags and junk may
//! precede it) plus the encoded bitrate.
//!
//! Frame header layout (32 bits, big endian):
//! ```text
//! +------------+---------+-------+------+---------+------------+---------+
//! |  sync (11) | ver (2) | layer | prot | bitrate | samplerate | padding |
//! |            |         |  (2)  | (1)  |   (4)   |    (2)     |   (1)   |
//! +------------+---------+-------+------+---------+------------+---------+
//! ```

/// MPEG version field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    /// MPEG 2.5 (unofficial low-rate extension)
    V2_5,
    /// MPEG 2 (ISO/IEC 13818-3)
    V2,
    /// MPEG 1 (ISO/IEC 11172-3)
    V1,
}

impl MpegVersion {
    fn from_bits(b: u32) -> Option<Self> {
        match b {
            0 => Some(MpegVersion::V2_5),
            2 => Some(MpegVersion::V2),
            3 => Some(MpegVersion::V1),
            _ => None,
        }
    }
}

/// MPEG layer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegLayer {
    Layer1,
    Layer2,
    Layer3,
}

impl MpegLayer {
    fn from_bits(b: u32) -> Option<Self> {
        match b {
            1 => Some(MpegLayer::Layer3),
            2 => Some(MpegLayer::Layer2),
            3 => Some(MpegLayer::Layer1),
            _ => None,
        }
    }
}

/// Bitrates in kbit/s by [version group][layer][index].
const BITRATES_V1: [[u32; 15]; 3] = [
    // Layer 1
    [
        0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
    ],
    // Layer 2
    [
        0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
    ],
    // Layer 3
    [
        0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
    ],
];

const BITRATES_V2: [[u32; 15]; 3] = [
    // Layer 1
    [
        0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
    ],
    // Layers 2 and 3 share a table in MPEG 2/2.5
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];

/// Sample rates in Hz by [version][index].
const SAMPLE_RATES: [[u32; 3]; 3] = [
    [11025, 12000, 8000],  // MPEG 2.5
    [22050, 24000, 16000], // MPEG 2
    [44100, 48000, 32000], // MPEG 1
];

/// A parsed MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub layer: MpegLayer,
    /// Bitrate in bits per second.
    pub bitrate: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Whole frame length in bytes, header included.
    pub frame_len: usize,
}

impl FrameHeader {
    /// Parse a header from 4 bytes. Returns `None` for anything that is not
    /// a valid, fixed-bitrate frame header (free-format frames are rejected
    /// because their length cannot be derived).
    pub fn parse(bytes: [u8; 4]) -> Option<Self> {
        let h = u32::from_be_bytes(bytes);

        if h >> 21 & 0x7ff != 0x7ff {
            return None;
        }
        let version = MpegVersion::from_bits(h >> 19 & 0x3)?;
        let layer = MpegLayer::from_bits(h >> 17 & 0x3)?;
        let bitrate_index = (h >> 12 & 0xf) as usize;
        let rate_index = (h >> 10 & 0x3) as usize;
        let padding = (h >> 9 & 0x1) as u32;

        if bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
            return None;
        }

        let layer_row = match layer {
            MpegLayer::Layer1 => 0,
            MpegLayer::Layer2 => 1,
            MpegLayer::Layer3 => 2,
        };
        let bitrate = match version {
            MpegVersion::V1 => BITRATES_V1[layer_row][bitrate_index],
            _ => BITRATES_V2[layer_row][bitrate_index],
        } * 1000;

        let version_row = match version {
            MpegVersion::V2_5 => 0,
            MpegVersion::V2 => 1,
            MpegVersion::V1 => 2,
        };
        let sample_rate = SAMPLE_RATES[version_row][rate_index];

        let frame_len = match layer {
            MpegLayer::Layer1 => ((12 * bitrate / sample_rate + padding) * 4) as usize,
            MpegLayer::Layer2 => (144 * bitrate / sample_rate + padding) as usize,
            MpegLayer::Layer3 => match version {
                MpegVersion::V1 => (144 * bitrate / sample_rate + padding) as usize,
                _ => (72 * bitrate / sample_rate + padding) as usize,
            },
        };

        Some(Self {
            version,
            layer,
            bitrate,
            sample_rate,
            frame_len,
        })
    }

    /// Whether another header could belong to the same stream. Version,
    /// layer and sample rate stay fixed across frames; bitrate may vary.
    pub fn compatible_with(&self, other: &FrameHeader) -> bool {
        self.version == other.version
            && self.layer == other.layer
            && self.sample_rate == other.sample_rate
    }
}

/// Scan `buf` for the first MPEG frame that is immediately followed by a
/// compatible second frame, returning its offset within `buf` and header.
///
/// Requiring a confirming frame keeps random `0xff` bytes inside tag data
/// from being mistaken for sync.
pub fn find_first_frame(buf: &[u8]) -> Option<(usize, FrameHeader)> {
    let mut pos = 0;
    while pos + 4 <= buf.len() {
        if buf[pos] != 0xff {
            pos += 1;
            continue;
        }
        let header = match FrameHeader::parse([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
        {
            Some(h) => h,
            None => {
                pos += 1;
                continue;
            }
        };
        let next = pos + header.frame_len;
        if next + 4 <= buf.len() {
            let confirm =
                FrameHeader::parse([buf[next], buf[next + 1], buf[next + 2], buf[next + 3]]);
            match confirm {
                Some(c) if header.compatible_with(&c) => return Some((pos, header)),
                _ => {
                    pos += 1;
                    continue;
                }
            }
        }
        // not enough data for a confirming frame; accept the lone header
        return Some((pos, header));
    }
    None
}
