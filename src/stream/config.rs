//! Stream configuration, intents and states.

use crate::buffer::{BufferUsage, PixelFormat};
use crate::error::{Error, Result};
use crate::memory::{BufferSource, PoolConfig};
use std::time::Duration;

/// Use case a stream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamIntent {
    /// Viewfinder frames.
    Preview,
    /// Recorded frames.
    Video,
    /// Still captures; may continue offline after stop.
    Still,
    /// Unprocessed sensor frames.
    Raw,
}

impl StreamIntent {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamIntent::Preview => "preview",
            StreamIntent::Video => "video",
            StreamIntent::Still => "still",
            StreamIntent::Raw => "raw",
        }
    }
}

impl std::fmt::Display for StreamIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamState {
    /// Not configured, or stopped.
    #[default]
    Idle,
    /// Configuration committed, pool sized, registered with the dispatcher.
    Active,
    /// Worker running.
    Busy,
    /// Outstanding work handed to an offline pipeline.
    Offline,
}

/// Configuration committed to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub format: PixelFormat,
    /// Memory usage flags.
    pub usage: BufferUsage,
    /// Buffers in the stream's pool (or tunnel).
    pub buffer_count: usize,
    /// Exchange buffers with an attached tunnel instead of the pool.
    pub tunnel_mode: bool,
    /// Allocation backend for the pool.
    pub source: BufferSource,
    /// How long the worker waits for a free buffer before retrying.
    pub acquire_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            format: PixelFormat::Nv12,
            usage: BufferUsage::CPU_READ | BufferUsage::CAMERA_WRITE,
            buffer_count: 4,
            tunnel_mode: false,
            source: BufferSource::Heap,
            acquire_timeout: Duration::from_millis(100),
        }
    }
}

impl StreamConfig {
    /// Preview preset: NV12 for the compositor, 4 buffers.
    pub fn preview(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            usage: BufferUsage::CAMERA_WRITE | BufferUsage::COMPOSER,
            ..Default::default()
        }
    }

    /// Still preset: JPEG, 2 buffers, CPU readable.
    pub fn still(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Jpeg,
            usage: BufferUsage::CAMERA_WRITE | BufferUsage::CPU_READ,
            buffer_count: 2,
            ..Default::default()
        }
    }

    /// Video preset: NV12 for the encoder, 8 shareable buffers.
    pub fn video(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            usage: BufferUsage::CAMERA_WRITE | BufferUsage::VIDEO_ENCODER,
            buffer_count: 8,
            source: BufferSource::Memfd,
            acquire_timeout: Duration::from_millis(33),
            ..Default::default()
        }
    }

    /// Set the buffer count.
    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = count;
        self
    }

    /// Enable or disable tunnel mode.
    pub fn tunnel_mode(mut self, enabled: bool) -> Self {
        self.tunnel_mode = enabled;
        self
    }

    /// Set the pool's allocation backend.
    pub fn source(mut self, source: BufferSource) -> Self {
        self.source = source;
        self
    }

    /// Set the acquire retry timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Check dimensions and buffer count.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "stream dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.buffer_count == 0 {
            return Err(Error::InvalidConfig("stream needs at least one buffer".into()));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::InvalidConfig("acquire timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl From<&StreamConfig> for PoolConfig {
    fn from(config: &StreamConfig) -> Self {
        // Tunnel streams exchange the tunnel's buffers; the pool stays empty
        let source = if config.tunnel_mode {
            BufferSource::External
        } else {
            config.source
        };
        PoolConfig::new(config.width, config.height, config.buffer_count)
            .format(config.format)
            .usage(config.usage)
            .source(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        StreamConfig::preview(1280, 720).validate().unwrap();
        StreamConfig::still(4000, 3000).validate().unwrap();
        StreamConfig::video(1920, 1080).validate().unwrap();
        assert_eq!(StreamConfig::video(1920, 1080).source, BufferSource::Memfd);
    }

    #[test]
    fn test_invalid_config() {
        assert!(StreamConfig::preview(0, 720).validate().is_err());
        assert!(StreamConfig::preview(64, 64).buffer_count(0).validate().is_err());
        assert!(
            StreamConfig::preview(64, 64)
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_pool_config_from_stream() {
        let stream = StreamConfig::still(320, 240);
        let pool = PoolConfig::from(&stream);
        assert_eq!(pool.count, 2);
        assert_eq!(pool.format, PixelFormat::Jpeg);
        assert_eq!(pool.source, BufferSource::Heap);

        let tunneled = PoolConfig::from(&stream.tunnel_mode(true));
        assert_eq!(tunneled.source, BufferSource::External);
    }
}
