//! Box arithmetic on host-side `[x0, y0, x1, y1]` boxes

/// An axis-aligned box in `(x0, y0, x1, y1)` pixel coordinates
pub type BBox = [f32; 4];

/// Upper bound on predicted log-scale deltas, as in the reference box coder
const BBOX_XFORM_CLIP: f32 = 4.135_166_6; // ln(1000 / 16)

/// Box area; degenerate boxes have zero area
pub fn area(b: &BBox) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Intersection over union of two boxes
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix0 = a[0].max(b[0]);
    let iy0 = a[1].max(b[1]);
    let ix1 = a[2].min(b[2]);
    let iy1 = a[3].min(b[3]);
    let inter = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Clamp a box to an image of `(height, width)`
pub fn clip(b: &BBox, height: usize, width: usize) -> BBox {
    let w = width as f32;
    let h = height as f32;
    [
        b[0].clamp(0.0, w),
        b[1].clamp(0.0, h),
        b[2].clamp(0.0, w),
        b[3].clamp(0.0, h),
    ]
}

/// Scale a box around its center
pub fn expand(b: &BBox, factor: f32) -> BBox {
    let cx = (b[0] + b[2]) * 0.5;
    let cy = (b[1] + b[3]) * 0.5;
    let hw = (b[2] - b[0]) * 0.5 * factor;
    let hh = (b[3] - b[1]) * 0.5 * factor;
    [cx - hw, cy - hh, cx + hw, cy + hh]
}

/// Whether a point lies inside the box
pub fn contains(b: &BBox, x: f32, y: f32) -> bool {
    x >= b[0] && x <= b[2] && y >= b[1] && y <= b[3]
}

/// Encodes boxes as center/size deltas relative to reference boxes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    /// Weights for `(dx, dy, dw, dh)`
    pub weights: [f32; 4],
}

impl BoxCoder {
    /// Create a coder with the given delta weights
    pub fn new(weights: [f32; 4]) -> Self {
        Self { weights }
    }

    /// Deltas that turn `reference` into `target`
    pub fn encode(&self, target: &BBox, reference: &BBox) -> [f32; 4] {
        let [wx, wy, ww, wh] = self.weights;
        let rw = (reference[2] - reference[0]).max(1e-3);
        let rh = (reference[3] - reference[1]).max(1e-3);
        let rx = reference[0] + 0.5 * rw;
        let ry = reference[1] + 0.5 * rh;

        let tw = (target[2] - target[0]).max(1e-3);
        let th = (target[3] - target[1]).max(1e-3);
        let tx = target[0] + 0.5 * tw;
        let ty = target[1] + 0.5 * th;

        [
            wx * (tx - rx) / rw,
            wy * (ty - ry) / rh,
            ww * (tw / rw).ln(),
            wh * (th / rh).ln(),
        ]
    }

    /// Apply `deltas` to `reference`
    pub fn decode(&self, deltas: &[f32; 4], reference: &BBox) -> BBox {
        let [wx, wy, ww, wh] = self.weights;
        let rw = reference[2] - reference[0];
        let rh = reference[3] - reference[1];
        let rx = reference[0] + 0.5 * rw;
        let ry = reference[1] + 0.5 * rh;

        let dx = deltas[0] / wx;
        let dy = deltas[1] / wy;
        let dw = (deltas[2] / ww).min(BBOX_XFORM_CLIP);
        let dh = (deltas[3] / wh).min(BBOX_XFORM_CLIP);

        let cx = dx * rw + rx;
        let cy = dy * rh + ry;
        let w = dw.exp() * rw;
        let h = dh.exp() * rh;

        [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
    }
}

/// Greedy non-maximum suppression; returns kept indices by descending score
pub fn nms(boxes: &[BBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        keep.push(i);
        for &j in &order[rank + 1..] {
            if !suppressed[j] && iou(&boxes[i], &boxes[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }
    keep
}

/// Integer feature-map window `(start, len)` covering `[lo, hi)` at `stride`
pub fn feature_window(lo: f32, hi: f32, stride: f32, size: usize) -> (usize, usize) {
    let size = size.max(1);
    let start = ((lo / stride).floor().max(0.0) as usize).min(size - 1);
    let end = ((hi / stride).ceil().max(0.0) as usize).clamp(start + 1, size);
    (start, end - start)
}
