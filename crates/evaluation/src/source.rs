use anyhow::{Context, bail};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// One decoded image of the evaluation set.
#[derive(Debug, Clone)]
pub struct Image {
    pub id: String,
    pub width: u32,
    pub height: u32,
    /// RGB8 pixels in HWC order
    pub pixels: Vec<u8>,
}

/// Fixed-size, indexable collection of images.
pub trait ImageSource {
    fn count(&self) -> usize;

    fn image_at(&mut self, index: usize) -> anyhow::Result<Image>;
}

/// Images of one directory, in file-name order.
pub struct DirectoryImageSource {
    paths: Vec<PathBuf>,
}

impl DirectoryImageSource {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        if !dir.is_dir() {
            bail!("Image directory {} does not exist", dir.display());
        }

        let mut paths = Vec::new();
        for ext in IMAGE_EXTENSIONS {
            let pattern = dir.join(format!("*.{ext}"));
            let pattern = pattern
                .to_str()
                .with_context(|| format!("Non UTF-8 image directory {}", dir.display()))?;
            for entry in glob::glob(pattern)? {
                paths.push(entry?);
            }
        }
        paths.sort();

        tracing::info!(dir = %dir.display(), images = paths.len(), "Image directory indexed");
        Ok(Self { paths })
    }
}

impl ImageSource for DirectoryImageSource {
    fn count(&self) -> usize {
        self.paths.len()
    }

    fn image_at(&mut self, index: usize) -> anyhow::Result<Image> {
        let path = self
            .paths
            .get(index)
            .with_context(|| format!("Image index {index} out of range"))?;

        let img = image::open(path)
            .with_context(|| format!("Failed to decode {}", path.display()))?
            .to_rgb8();

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("Unusable file name {}", path.display()))?
            .to_string();

        Ok(Image {
            id,
            width: img.width(),
            height: img.height(),
            pixels: img.into_raw(),
        })
    }
}
