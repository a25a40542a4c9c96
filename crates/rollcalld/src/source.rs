use std::path::{Path, PathBuf};

use chrono::Utc;
use rollcall_core::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot read frame directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("frame source released")]
    Released,
}

/// Something that yields RGB frames on demand.
pub trait FrameSource: Send {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Stop producing frames and drop any held device or file handles.
    fn release(&mut self);
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Replays a directory of still images in file-name order.
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
    seq: u64,
    released: bool,
}

impl DirectorySource {
    pub fn open(dir: &Path, looping: bool) -> Result<Self, SourceError> {
        let io_err = |source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), looping, "frame source opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            cursor: 0,
            looping,
            seq: 0,
            released: false,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.released {
            return Err(SourceError::Released);
        }
        if self.cursor >= self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }

        let path = &self.files[self.cursor];
        self.cursor += 1;
        let image = image::open(path)
            .map_err(|source| SourceError::Decode {
                path: path.clone(),
                source,
            })?
            .to_rgb8();

        self.seq += 1;
        Ok(Some(Frame::new(self.seq, Utc::now(), image)))
    }

    fn release(&mut self) {
        if !self.released {
            tracing::info!(dir = %self.dir.display(), "frame source released");
        }
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn frames_dir(name: &str, count: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let img = RgbImage::from_pixel(4 + i as u32, 4, Rgb([i as u8, 0, 0]));
            img.save(dir.join(format!("frame_{i:03}.png"))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();
        dir
    }

    #[test]
    fn test_replays_in_name_order() {
        let dir = frames_dir("order", 3);
        let mut source = DirectorySource::open(&dir, false).unwrap();
        assert_eq!(source.len(), 3);

        let widths: Vec<u32> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.width())
            .collect();
        assert_eq!(widths, vec![4, 5, 6]);
        assert!(source.next_frame().unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_looping_keeps_sequence_increasing() {
        let dir = frames_dir("loop", 2);
        let mut source = DirectorySource::open(&dir, true).unwrap();
        let seqs: Vec<u64> = (0..5)
            .map(|_| source.next_frame().unwrap().unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_release_stops_frames() {
        let dir = frames_dir("release", 1);
        let mut source = DirectorySource::open(&dir, true).unwrap();
        source.release();
        assert!(matches!(source.next_frame(), Err(SourceError::Released)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_directory_rejected() {
        let dir = frames_dir("empty", 0);
        assert!(matches!(
            DirectorySource::open(&dir, false),
            Err(SourceError::Empty(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
