//! COCO-format instance segmentation dataset
//!
//! Reads a COCO annotation JSON and the referenced images. Category ids are
//! remapped to contiguous labels `1..=K` in ascending id order, leaving 0 for
//! background. Images without usable annotations are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{DataError, Dataset, Sample, Target};

#[derive(Debug, Deserialize)]
struct CocoFile {
    images: Vec<CocoImage>,
    #[serde(default)]
    annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Deserialize)]
struct CocoImage {
    id: u64,
    file_name: String,
    width: usize,
    height: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct CocoCategory {
    id: u64,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CocoAnnotation {
    image_id: u64,
    category_id: u64,
    bbox: [f32; 4],
    #[serde(default)]
    area: Option<f32>,
    #[serde(default)]
    iscrowd: u8,
    #[serde(default)]
    segmentation: Option<Segmentation>,
}

/// Instance outline in one of the COCO encodings
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
    /// Flat `[x0, y0, x1, y1, ...]` polygons
    Polygons(Vec<Vec<f64>>),
    /// Run-length encoding over the column-major mask
    Rle {
        /// Run lengths, alternating background and foreground
        counts: RleCounts,
        /// `[height, width]`
        size: [usize; 2],
    },
}

/// RLE run lengths, plain or in the compact string form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
    /// Plain run lengths
    Uncompressed(Vec<u64>),
    /// Compact ASCII encoding
    Compressed(String),
}

struct ImageEntry {
    image: CocoImage,
    annotations: Vec<CocoAnnotation>,
}

/// COCO dataset producing [`Sample`]s
pub struct CocoDataset {
    name: String,
    image_dir: PathBuf,
    entries: Vec<ImageEntry>,
    labels: BTreeMap<u64, u32>,
    category_names: Vec<String>,
}

impl CocoDataset {
    /// Open a dataset from an annotation file; images resolve against `image_dir`,
    /// or the annotation file's directory when `None`
    #[instrument(skip_all)]
    pub fn open(
        annotation_path: impl AsRef<Path>,
        image_dir: Option<&Path>,
    ) -> Result<Self, DataError> {
        let annotation_path = annotation_path.as_ref();
        if !annotation_path.exists() {
            return Err(DataError::DatasetNotFound {
                path: annotation_path.display().to_string(),
            });
        }
        let raw = fs::read_to_string(annotation_path)?;
        let file: CocoFile = serde_json::from_str(&raw)?;

        let image_dir = match image_dir {
            Some(dir) => dir.to_path_buf(),
            None => annotation_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        };

        let mut categories = file.categories.clone();
        categories.sort_by_key(|c| c.id);
        let labels: BTreeMap<u64, u32> = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i as u32 + 1))
            .collect();
        let category_names = categories.into_iter().map(|c| c.name).collect();

        let mut by_image: BTreeMap<u64, Vec<CocoAnnotation>> = BTreeMap::new();
        for ann in file.annotations {
            if !labels.contains_key(&ann.category_id) {
                warn!("annotation references unknown category {}", ann.category_id);
                continue;
            }
            if ann.bbox[2] <= 0.0 || ann.bbox[3] <= 0.0 {
                debug!("dropping degenerate box on image {}", ann.image_id);
                continue;
            }
            by_image.entry(ann.image_id).or_default().push(ann);
        }

        let total_images = file.images.len();
        let entries: Vec<ImageEntry> = file
            .images
            .into_iter()
            .filter_map(|image| {
                by_image
                    .remove(&image.id)
                    .map(|annotations| ImageEntry { image, annotations })
            })
            .collect();

        info!(
            "Loaded COCO dataset with {} annotated images ({} skipped) and {} categories",
            entries.len(),
            total_images - entries.len(),
            labels.len()
        );

        Ok(Self {
            name: annotation_path.display().to_string(),
            image_dir,
            entries,
            labels,
            category_names,
        })
    }

    /// Number of foreground categories
    pub fn num_categories(&self) -> usize {
        self.labels.len()
    }

    /// Category names ordered by label
    pub fn category_names(&self) -> &[String] {
        &self.category_names
    }

    fn load_image(&self, index: usize, entry: &ImageEntry) -> Result<Tensor, DataError> {
        let path = self.image_dir.join(&entry.image.file_name);
        let rgb = image::open(&path)?.to_rgb8();
        let (w, h) = rgb.dimensions();
        if (w as usize, h as usize) != (entry.image.width, entry.image.height) {
            return Err(DataError::MalformedData {
                index,
                reason: format!(
                    "{} is {}x{} but annotated as {}x{}",
                    path.display(),
                    w,
                    h,
                    entry.image.width,
                    entry.image.height
                ),
            });
        }
        let tensor = Tensor::from_vec(rgb.into_raw(), (h as usize, w as usize, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        Ok((tensor / 255.0)?)
    }
}

impl Dataset for CocoDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<Sample, DataError> {
        let entry = self.entries.get(index).ok_or(DataError::InvalidIndex {
            index,
            dataset_size: self.entries.len(),
        })?;
        let (height, width) = (entry.image.height, entry.image.width);
        let image = self.load_image(index, entry)?;

        let n = entry.annotations.len();
        let mut boxes = Vec::with_capacity(n * 4);
        let mut labels = Vec::with_capacity(n);
        let mut masks = Vec::with_capacity(n * height * width);
        let mut areas = Vec::with_capacity(n);
        let mut crowd = Vec::with_capacity(n);

        for ann in &entry.annotations {
            let [x, y, w, h] = ann.bbox;
            boxes.extend_from_slice(&[x, y, x + w, y + h]);
            labels.push(self.labels.get(&ann.category_id).copied().unwrap_or_default());
            let mask = match &ann.segmentation {
                Some(seg) => decode_segmentation(seg, height, width)
                    .map_err(|reason| DataError::MalformedData { index, reason })?,
                None => box_mask(&[x, y, x + w, y + h], height, width),
            };
            masks.extend_from_slice(&mask);
            areas.push(ann.area.unwrap_or(w * h));
            crowd.push(ann.iscrowd);
        }

        let device = Device::Cpu;
        let target = Target {
            image_id: entry.image.id,
            boxes: Tensor::from_vec(boxes, (n, 4), &device)?,
            labels: Tensor::from_vec(labels, n, &device)?,
            masks: Tensor::from_vec(masks, (n, height, width), &device)?,
            area: Tensor::from_vec(areas, n, &device)?,
            iscrowd: Tensor::from_vec(crowd, n, &device)?,
        };
        Ok(Sample { image, target })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Rasterize a segmentation into a row-major `height * width` binary mask
pub fn decode_segmentation(
    seg: &Segmentation,
    height: usize,
    width: usize,
) -> Result<Vec<u8>, String> {
    match seg {
        Segmentation::Polygons(polygons) => Ok(rasterize_polygons(polygons, height, width)),
        Segmentation::Rle { counts, size } => {
            if *size != [height, width] {
                return Err(format!(
                    "RLE size {:?} does not match image {}x{}",
                    size, height, width
                ));
            }
            let counts = match counts {
                RleCounts::Uncompressed(c) => c.clone(),
                RleCounts::Compressed(s) => decompress_counts(s)?,
            };
            decode_rle(&counts, height, width)
        }
    }
}

/// Even-odd scanline fill of polygons, sampling pixel centers
pub fn rasterize_polygons(polygons: &[Vec<f64>], height: usize, width: usize) -> Vec<u8> {
    let mut mask = vec![0u8; height * width];
    for poly in polygons {
        let points: Vec<(f64, f64)> = poly.chunks_exact(2).map(|p| (p[0], p[1])).collect();
        if points.len() < 3 {
            continue;
        }
        for row in 0..height {
            let y = row as f64 + 0.5;
            let mut crossings = Vec::new();
            for i in 0..points.len() {
                let (x0, y0) = points[i];
                let (x1, y1) = points[(i + 1) % points.len()];
                if (y0 <= y && y < y1) || (y1 <= y && y < y0) {
                    crossings.push(x0 + (y - y0) / (y1 - y0) * (x1 - x0));
                }
            }
            crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for span in crossings.chunks_exact(2) {
                let start = (span[0] - 0.5).ceil().max(0.0) as usize;
                let end = ((span[1] - 0.5).floor() + 1.0).clamp(0.0, width as f64) as usize;
                for col in start..end.min(width) {
                    mask[row * width + col] = 1;
                }
            }
        }
    }
    mask
}

/// Expand column-major run lengths into a row-major mask
pub fn decode_rle(counts: &[u64], height: usize, width: usize) -> Result<Vec<u8>, String> {
    let total = height * width;
    let run_sum: u64 = counts.iter().sum();
    if run_sum as usize != total {
        return Err(format!("RLE covers {run_sum} pixels, image has {total}"));
    }
    let mut mask = vec![0u8; total];
    let mut pos = 0usize;
    for (i, &run) in counts.iter().enumerate() {
        let run = run as usize;
        if i % 2 == 1 {
            for p in pos..pos + run {
                let (col, row) = (p / height, p % height);
                mask[row * width + col] = 1;
            }
        }
        pos += run;
    }
    Ok(mask)
}

/// Characters a single run may span before its value overflows an `i64`
const MAX_RUN_CHARS: usize = 12;

/// Decode the compact ASCII form of RLE counts
pub fn decompress_counts(s: &str) -> Result<Vec<u64>, String> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0;
        loop {
            if k == MAX_RUN_CHARS {
                return Err("RLE run too long".into());
            }
            let c = i64::from(bytes.get(p).copied().ok_or("truncated RLE string")?) - 48;
            x |= (c & 0x1f) << (5 * k);
            p += 1;
            k += 1;
            if c & 0x20 == 0 {
                if c & 0x10 != 0 {
                    x |= -1i64 << (5 * k);
                }
                break;
            }
        }
        if counts.len() > 2 {
            x += counts[counts.len() - 2];
        }
        counts.push(x);
    }
    counts
        .into_iter()
        .map(|c| u64::try_from(c).map_err(|_| format!("negative RLE run {c}")))
        .collect()
}

fn box_mask(b: &[f32; 4], height: usize, width: usize) -> Vec<u8> {
    let mut mask = vec![0u8; height * width];
    let x0 = (b[0].max(0.0) as usize).min(width);
    let y0 = (b[1].max(0.0) as usize).min(height);
    let x1 = (b[2].ceil().max(0.0) as usize).min(width);
    let y1 = (b[3].ceil().max(0.0) as usize).min(height);
    for row in y0..y1 {
        mask[row * width + x0..row * width + x1].fill(1);
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_rasterize_square_polygon() {
        let mask = rasterize_polygons(&[vec![1.0, 1.0, 3.0, 1.0, 3.0, 3.0, 1.0, 3.0]], 4, 4);
        #[rustfmt::skip]
        let expected = vec![
            0, 0, 0, 0,
            0, 1, 1, 0,
            0, 1, 1, 0,
            0, 0, 0, 0,
        ];
        assert_eq!(mask, expected);
    }

    #[test]
    fn test_decode_uncompressed_rle_is_column_major() {
        // 2x3 image, foreground is the middle column
        let mask = decode_rle(&[2, 2, 2], 2, 3).unwrap();
        assert_eq!(mask, vec![0, 1, 0, 0, 1, 0]);
        assert!(decode_rle(&[1, 1], 2, 3).is_err());
    }

    #[test]
    fn test_decompress_counts() {
        // single-character runs without deltas
        assert_eq!(decompress_counts("12").unwrap(), vec![1, 2]);
        // runs after the third are stored relative to the run two back
        assert_eq!(decompress_counts("3211").unwrap(), vec![3, 2, 1, 3]);
    }

    #[test]
    fn test_decompress_counts_rejects_overlong_run() {
        // 'o' carries the continuation bit, so the run never terminates
        let malformed = "o".repeat(20);
        assert_eq!(decompress_counts(&malformed).unwrap_err(), "RLE run too long");
        assert!(decompress_counts("ooo").is_err());
    }

    fn write_dataset(dir: &TempDir) -> PathBuf {
        let mut img = RgbImage::new(8, 6);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.save(dir.path().join("a.png")).unwrap();
        img.save(dir.path().join("b.png")).unwrap();

        let json = serde_json::json!({
            "images": [
                {"id": 1, "file_name": "a.png", "width": 8, "height": 6},
                {"id": 2, "file_name": "b.png", "width": 8, "height": 6}
            ],
            "annotations": [
                {"id": 10, "image_id": 1, "category_id": 7, "bbox": [1, 1, 4, 3],
                 "area": 12, "iscrowd": 0,
                 "segmentation": [[1, 1, 5, 1, 5, 4, 1, 4]]},
                {"id": 11, "image_id": 1, "category_id": 3, "bbox": [0, 0, 2, 2],
                 "iscrowd": 1,
                 "segmentation": {"counts": [0, 2, 4, 2, 40], "size": [6, 8]}}
            ],
            "categories": [{"id": 7, "name": "tree"}, {"id": 3, "name": "shrub"}]
        });
        let path = dir.path().join("annotations.json");
        fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_coco_dataset_sample() {
        let dir = TempDir::new().unwrap();
        let path = write_dataset(&dir);
        let dataset = CocoDataset::open(&path, None).unwrap();

        // image 2 has no annotations
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.num_categories(), 2);
        assert_eq!(dataset.category_names(), &["shrub".to_string(), "tree".to_string()]);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.image.dims(), &[3, 6, 8]);
        let red = sample.image.get(0).unwrap().get(0).unwrap().get(0).unwrap();
        assert_eq!(red.to_scalar::<f32>().unwrap(), 1.0);

        let t = &sample.target;
        assert_eq!(t.image_id, 1);
        assert_eq!(t.labels_vec().unwrap(), vec![2, 1]);
        assert_eq!(t.boxes_vec().unwrap()[0], [1.0, 1.0, 5.0, 4.0]);
        assert_eq!(t.masks.dims(), &[2, 6, 8]);
        assert_eq!(t.area.to_vec1::<f32>().unwrap(), vec![12.0, 4.0]);
        assert_eq!(t.iscrowd.to_vec1::<u8>().unwrap(), vec![0, 1]);

        let pixels = |i: usize| {
            t.masks.get(i).unwrap().to_dtype(DType::U32).unwrap().sum_all().unwrap().to_scalar::<u32>().unwrap()
        };
        assert_eq!(pixels(0), 12);
        assert_eq!(pixels(1), 4);
    }

    #[test]
    fn test_missing_annotation_file() {
        let err = CocoDataset::open("/nonexistent/annotations.json", None);
        assert!(matches!(err, Err(DataError::DatasetNotFound { .. })));
    }

    #[test]
    fn test_out_of_range_index() {
        let dir = TempDir::new().unwrap();
        let dataset = CocoDataset::open(write_dataset(&dir), None).unwrap();
        assert!(matches!(dataset.get(5), Err(DataError::InvalidIndex { .. })));
    }
}
