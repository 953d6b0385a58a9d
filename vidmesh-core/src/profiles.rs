//! Rendition profiles: named target formats a broadcast can request.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub name: String,
    pub bitrate: String,
    pub framerate: u32,
    pub resolution: String,
    pub aspect_ratio: String,
}

impl VideoProfile {
    fn new(name: &str, bitrate: &str, framerate: u32, resolution: &str, aspect: &str) -> Self {
        Self {
            name: name.to_string(),
            bitrate: bitrate.to_string(),
            framerate,
            resolution: resolution.to_string(),
            aspect_ratio: aspect.to_string(),
        }
    }
}

pub fn p_144p_30fps_16_9() -> VideoProfile {
    VideoProfile::new("P144p30fps16x9", "400k", 30, "256x144", "16:9")
}

pub fn p_240p_30fps_16_9() -> VideoProfile {
    VideoProfile::new("P240p30fps16x9", "600k", 30, "426x240", "16:9")
}

pub fn p_240p_30fps_4_3() -> VideoProfile {
    VideoProfile::new("P240p30fps4x3", "600k", 30, "320x240", "4:3")
}

pub fn p_360p_30fps_16_9() -> VideoProfile {
    VideoProfile::new("P360p30fps16x9", "1200k", 30, "640x360", "16:9")
}

pub fn p_720p_30fps_16_9() -> VideoProfile {
    VideoProfile::new("P720p30fps16x9", "4000k", 30, "1280x720", "16:9")
}

/// Look a profile up by its registered name.
pub fn lookup(name: &str) -> Option<VideoProfile> {
    match name {
        "P144p30fps16x9" => Some(p_144p_30fps_16_9()),
        "P240p30fps16x9" => Some(p_240p_30fps_16_9()),
        "P240p30fps4x3" => Some(p_240p_30fps_4_3()),
        "P360p30fps16x9" => Some(p_360p_30fps_16_9()),
        "P720p30fps16x9" => Some(p_720p_30fps_16_9()),
        _ => None,
    }
}
