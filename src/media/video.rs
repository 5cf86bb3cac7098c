//! Video frame extraction through ffmpeg
//!
//! `ffprobe` reports the stream geometry, then an `ffmpeg` child decodes the
//! first video stream to raw RGB24 on stdout. A reader thread slices stdout
//! into frames and hands them over a bounded channel, so decoding runs ahead
//! of inference by at most `queue` frames.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{bounded, Receiver};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::config::AnalysisConfig;
use crate::engine::preprocess::frame_from_rgb;

/// Geometry and timing of the first video stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: Option<u64>,
    pub fps: Option<f64>,
    pub codec: String,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    r_frame_rate: Option<String>,
    codec_name: Option<String>,
}

/// Parse `ffprobe -of json` output for the first video stream
pub fn parse_probe_output(json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json).context("malformed ffprobe output")?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        bail!("video stream has zero-size dimensions {}x{}", width, height);
    }

    Ok(VideoInfo {
        width,
        height,
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
        fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
        codec: stream.codec_name.unwrap_or_default(),
    })
}

/// `30000/1001` style rates; `0/0` means unknown
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    (den > 0.0 && num > 0.0).then(|| num / den)
}

/// Spawns ffmpeg/ffprobe for frame extraction
#[derive(Debug, Clone)]
pub struct VideoDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    queue: usize,
}

impl VideoDecoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf, queue: usize) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            queue: queue.max(1),
        }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            config.ffprobe_path.clone(),
            config.frame_queue,
        )
    }

    /// Whether both binaries can be executed
    pub fn is_available(&self) -> bool {
        [&self.ffmpeg, &self.ffprobe].iter().all(|bin| {
            Command::new(bin)
                .arg("-version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        })
    }

    pub fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
            .arg("stream=width,height,nb_frames,r_frame_rate,codec_name")
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to run {}", self.ffprobe.display()))?;

        if !output.status.success() {
            bail!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }

    /// Start decoding at most `max_frames` frames
    pub fn frames(&self, path: &Path, max_frames: usize) -> Result<FrameStream> {
        let info = self.probe(path)?;
        info!(
            "Video: {}x{} codec={} frames={:?} fps={:?}",
            info.width, info.height, info.codec, info.frame_count, info.fps
        );

        let mut child = Command::new(&self.ffmpeg)
            .args(["-nostdin", "-v", "error", "-noautorotate", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-frames:v"])
            .arg(max_frames.to_string())
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run {}", self.ffmpeg.display()))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;

        // Drained concurrently so a chatty decoder never blocks on a full pipe
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        let (width, height) = (info.width, info.height);
        let frame_len = width as usize * height as usize * 3;
        let (tx, rx) = bounded::<Result<DynamicImage>>(self.queue);

        thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || loop {
                let mut buffer = vec![0u8; frame_len];
                match stdout.read_exact(&mut buffer) {
                    Ok(()) => {
                        if tx.send(frame_from_rgb(width, height, buffer)).is_err() {
                            debug!("Frame consumer went away, stopping reader");
                            break;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow!(e).context("reading ffmpeg output")));
                        break;
                    }
                }
            })
            .context("failed to spawn frame reader")?;

        Ok(FrameStream {
            receiver: rx,
            child,
            stderr,
            info,
            yielded: 0,
            finished: false,
            reaped: false,
        })
    }
}

/// Decoded frames in presentation order.
///
/// Dropping the stream before ffmpeg has been waited on kills the child.
pub struct FrameStream {
    receiver: Receiver<Result<DynamicImage>>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    info: VideoInfo,
    yielded: usize,
    finished: bool,
    reaped: bool,
}

impl FrameStream {
    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    /// Reap ffmpeg once stdout is drained; a failure before the first frame
    /// means the input could not be decoded at all.
    fn finish(&mut self) -> Option<Result<DynamicImage>> {
        self.finished = true;
        let status = match self.child.wait() {
            Ok(status) => status,
            Err(e) => return Some(Err(anyhow!(e).context("waiting for ffmpeg"))),
        };
        self.reaped = true;
        if status.success() {
            return None;
        }

        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if self.yielded > 0 {
            warn!(
                "ffmpeg exited with {} after {} frames: {}",
                status,
                self.yielded,
                stderr.trim()
            );
            None
        } else {
            Some(Err(anyhow!("ffmpeg exited with {}: {}", status, stderr.trim())))
        }
    }
}

impl Iterator for FrameStream {
    type Item = Result<DynamicImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.receiver.recv() {
            Ok(Ok(frame)) => {
                self.yielded += 1;
                Some(Ok(frame))
            }
            Ok(Err(e)) => {
                self.finished = true;
                self.reap();
                Some(Err(e))
            }
            Err(_) => self.finish(),
        }
    }
}

impl FrameStream {
    /// Kill ffmpeg if it is still running and collect its exit status
    fn reap(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.child.kill();
        if self.child.wait().is_ok() {
            self.reaped = true;
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.reap();
    }
}

/// Encode a small synthetic clip with ffmpeg's `testsrc`, or `None` when
/// ffmpeg is not installed
#[cfg(test)]
pub(crate) fn write_test_clip(dir: &Path, frames: usize) -> Option<PathBuf> {
    let decoder = VideoDecoder::from_config(&AnalysisConfig::default());
    if !decoder.is_available() {
        eprintln!("ffmpeg/ffprobe not installed, skipping video test");
        return None;
    }

    let path = dir.join("clip.mp4");
    let status = Command::new("ffmpeg")
        .args(["-nostdin", "-v", "error", "-y", "-f", "lavfi", "-i"])
        .arg("testsrc=size=64x48:rate=10")
        .arg("-frames:v")
        .arg(frames.to_string())
        .args(["-pix_fmt", "yuv420p", "-c:v", "mpeg4"])
        .arg(&path)
        .status()
        .ok()?;
    status.success().then_some(path)
}

/// Shell stand-ins for ffprobe/ffmpeg that report a `width`x`height` stream
/// of `frames` solid red frames, whatever the input file holds. Returns the
/// (ffmpeg, ffprobe) paths.
#[cfg(all(test, unix))]
pub(crate) fn write_stub_decoder(dir: &Path, width: u32, height: u32, frames: usize) -> (PathBuf, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let frame_path = dir.join("frame.rgb");
    let pixel = [255u8, 0, 0];
    let frame: Vec<u8> = pixel.iter().copied().cycle().take(width as usize * height as usize * 3).collect();
    std::fs::write(&frame_path, frame).unwrap();

    let ffprobe = format!(
        "#!/bin/sh\n\
         [ \"$1\" = \"-version\" ] && exit 0\n\
         echo '{{\"streams\": [{{\"codec_name\": \"rawvideo\", \"width\": {w}, \"height\": {h}, \
         \"r_frame_rate\": \"10/1\", \"nb_frames\": \"{n}\"}}]}}'\n",
        w = width,
        h = height,
        n = frames
    );
    let ffmpeg = format!(
        "#!/bin/sh\n\
         n=0\n\
         prev=\n\
         for arg in \"$@\"; do\n\
         [ \"$arg\" = \"-version\" ] && exit 0\n\
         [ \"$prev\" = \"-frames:v\" ] && n=$arg\n\
         prev=$arg\n\
         done\n\
         [ \"$n\" -gt {total} ] && n={total}\n\
         i=0\n\
         while [ \"$i\" -lt \"$n\" ]; do\n\
         cat '{frame}'\n\
         i=$((i + 1))\n\
         done\n",
        total = frames,
        frame = frame_path.display()
    );

    let mut paths = Vec::new();
    for (name, script) in [("ffmpeg", ffmpeg), ("ffprobe", ffprobe)] {
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        paths.push(path);
    }
    (paths[0].clone(), paths[1].clone())
}
