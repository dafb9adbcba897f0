//! AFAN: compact quantized blendshape animation.
//!
//! ```text
//! offset  size  field
//! 0       4     magic 0x4146414E (u32 LE)
//! 4       1     version (1 | 2)
//! 5       1     fps
//! 6       1     channel count
//! 7       1     reserved (0)
//! 8       4     frame count (u32 LE)
//! v1 only:      per channel, name length (u8) + UTF-8 name
//! then          frames × channels bytes, round(clamp(w, 0, 1) × 255)
//! ```
//!
//! Version 2 carries no names; channels follow [`BLENDSHAPE_NAMES`].

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::error::{FacecastError, Result};
use crate::face::blendshape::{BlendshapeFrame, BLENDSHAPE_COUNT, BLENDSHAPE_NAMES};

pub const AFAN_MAGIC: u32 = 0x4146_414E;

const MAX_CHANNELS: usize = u8::MAX as usize;
const MAX_NAME_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfanVersion {
    /// Self-describing: channel names stored in the header.
    V1,
    /// Fixed ARKit channel order, no names.
    V2,
}

impl AfanVersion {
    fn tag(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(FacecastError::format(format!(
                "unsupported AFAN version {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AfanAnimation {
    pub fps: u8,
    pub channel_names: Vec<String>,
    /// One row per frame, `channel_names.len()` weights each.
    pub frames: Vec<Vec<f32>>,
}

impl AfanAnimation {
    /// 52-channel animation in ARKit order.
    pub fn from_frames(fps: u8, frames: &[BlendshapeFrame]) -> Self {
        Self {
            fps,
            channel_names: BLENDSHAPE_NAMES.iter().map(|n| (*n).to_owned()).collect(),
            frames: frames.iter().map(|f| f.weights().to_vec()).collect(),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_names.len()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.fps == 0 {
            return 0.0;
        }
        self.frames.len() as f64 / f64::from(self.fps)
    }

    /// `floor(time × fps)` clamped into the frame range. 0 when empty.
    pub fn frame_index_at(&self, time: f64) -> usize {
        let last = self.frames.len().saturating_sub(1);
        let index = (time * f64::from(self.fps)).floor();
        if index.is_nan() || index <= 0.0 {
            0
        } else {
            (index as usize).min(last)
        }
    }

    pub fn frame_at_time(&self, time: f64) -> Option<&[f32]> {
        self.frames
            .get(self.frame_index_at(time))
            .map(Vec::as_slice)
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channel_names.iter().position(|n| n == name)
    }

    /// Weight of channel `name` in frame `frame`, if both exist.
    pub fn weight(&self, frame: usize, name: &str) -> Option<f32> {
        let channel = self.channel_index(name)?;
        self.frames.get(frame)?.get(channel).copied()
    }

    pub fn encode(&self, version: AfanVersion) -> Result<Vec<u8>> {
        let names_len: usize = match version {
            AfanVersion::V1 => self.channel_names.iter().map(|n| n.len() + 1).sum(),
            AfanVersion::V2 => 0,
        };
        let mut buf =
            Vec::with_capacity(12 + names_len + self.frames.len() * self.channel_names.len());
        self.write_to(&mut buf, version)?;
        Ok(buf)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W, version: AfanVersion) -> Result<()> {
        self.validate(version)?;
        let channels = self.channel_names.len();

        writer.write_u32::<LittleEndian>(AFAN_MAGIC)?;
        writer.write_u8(version.tag())?;
        writer.write_u8(self.fps)?;
        writer.write_u8(channels as u8)?;
        writer.write_u8(0)?;
        writer.write_u32::<LittleEndian>(self.frames.len() as u32)?;

        if version == AfanVersion::V1 {
            for name in &self.channel_names {
                writer.write_u8(name.len() as u8)?;
                writer.write_all(name.as_bytes())?;
            }
        }

        let mut row = vec![0u8; channels];
        for frame in &self.frames {
            for (dst, &w) in row.iter_mut().zip(frame) {
                *dst = quantize(w);
            }
            writer.write_all(&row)?;
        }

        debug!(
            version = version.tag(),
            fps = self.fps,
            channels,
            frames = self.frames.len(),
            "encoded AFAN"
        );
        Ok(())
    }

    fn validate(&self, version: AfanVersion) -> Result<()> {
        if self.fps == 0 {
            return Err(FacecastError::range("AFAN fps must be at least 1"));
        }
        let channels = self.channel_names.len();
        if channels > MAX_CHANNELS {
            return Err(FacecastError::range(format!(
                "{channels} channels exceed the AFAN limit of {MAX_CHANNELS}"
            )));
        }
        if u32::try_from(self.frames.len()).is_err() {
            return Err(FacecastError::range("too many frames for AFAN"));
        }
        if let Some(name) = self.channel_names.iter().find(|n| n.len() > MAX_NAME_LEN) {
            return Err(FacecastError::range(format!(
                "channel name of {} bytes exceeds {MAX_NAME_LEN}",
                name.len()
            )));
        }
        if version == AfanVersion::V2
            && !self
                .channel_names
                .iter()
                .map(String::as_str)
                .eq(BLENDSHAPE_NAMES.iter().copied())
        {
            return Err(FacecastError::range(
                "AFAN v2 requires the 52 ARKit channels in order",
            ));
        }
        if let Some((i, frame)) = self
            .frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.len() != channels)
        {
            return Err(FacecastError::range(format!(
                "frame {i} has {} weights, expected {channels}",
                frame.len()
            )));
        }
        Ok(())
    }
}

/// Parse a complete AFAN buffer.
pub fn decode(bytes: &[u8]) -> Result<AfanAnimation> {
    read_from(&mut Cursor::new(bytes))
}

pub fn read_from<R: Read>(reader: &mut R) -> Result<AfanAnimation> {
    let magic = reader.read_u32::<LittleEndian>().map_err(truncated)?;
    if magic != AFAN_MAGIC {
        return Err(FacecastError::format(format!(
            "bad AFAN magic 0x{magic:08X}"
        )));
    }
    let version = AfanVersion::from_tag(reader.read_u8().map_err(truncated)?)?;
    let fps = reader.read_u8().map_err(truncated)?;
    let channels = usize::from(reader.read_u8().map_err(truncated)?);
    let _reserved = reader.read_u8().map_err(truncated)?;
    let frame_count = reader.read_u32::<LittleEndian>().map_err(truncated)? as usize;

    let channel_names = match version {
        AfanVersion::V1 => {
            let mut names = Vec::with_capacity(channels);
            for i in 0..channels {
                let len = usize::from(reader.read_u8().map_err(truncated)?);
                let mut raw = vec![0u8; len];
                reader.read_exact(&mut raw).map_err(truncated)?;
                let name = String::from_utf8(raw).map_err(|_| {
                    FacecastError::format(format!("channel {i} name is not UTF-8"))
                })?;
                names.push(name);
            }
            names
        }
        AfanVersion::V2 => (0..channels)
            .map(|i| {
                BLENDSHAPE_NAMES
                    .get(i)
                    .map_or_else(|| format!("channel{i}"), |n| (*n).to_owned())
            })
            .collect(),
    };
    if version == AfanVersion::V2 && channels != BLENDSHAPE_COUNT {
        debug!(channels, "AFAN v2 with non-standard channel count");
    }

    // Grow as rows arrive; the header count is not trusted for allocation.
    let mut frames = Vec::with_capacity(frame_count.min(1 << 16));
    let mut row = vec![0u8; channels];
    for _ in 0..frame_count {
        reader.read_exact(&mut row).map_err(truncated)?;
        frames.push(row.iter().map(|&b| f32::from(b) / 255.0).collect());
    }

    Ok(AfanAnimation {
        fps,
        channel_names,
        frames,
    })
}

fn quantize(weight: f32) -> u8 {
    if weight.is_nan() {
        return 0;
    }
    (weight.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn truncated(e: io::Error) -> FacecastError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FacecastError::format("truncated AFAN data")
    } else {
        FacecastError::Io(e)
    }
}
