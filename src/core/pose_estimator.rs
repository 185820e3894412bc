use std::path::Path;
use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

use crate::core::runtime::InferenceSession;
use crate::models::export::ExportError;
use crate::models::pose::{Keypoint2D, PoseConfig, PoseError, PoseEstimate, PoseResult, SKELETON};
use crate::models::tensor::DenseTensor;

const KEYPOINT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LIMB_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const KEYPOINT_RADIUS: i32 = 4;
const LIMB_THICKNESS: i32 = 2;

// ==============================================================================
// Pre- and Post-processing
// ==============================================================================

/// Resize, normalise and lay out an image as a `[1, 3, H, W]` model input
pub fn preprocess(image: &DynamicImage, config: &PoseConfig) -> DenseTensor {
    let rgb = image.to_rgb8();
    let resized = imageops::resize(
        &rgb,
        config.input_width,
        config.input_height,
        FilterType::Triangle,
    );

    let (w, h) = (config.input_width as usize, config.input_height as usize);
    let plane = w * h;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            data[c * plane + offset] = (value - config.mean[c]) / config.std[c];
        }
    }

    DenseTensor {
        shape: vec![1, 3, h, w],
        data,
    }
}

/// Per-joint argmax of `[1, J, h, w]` heatmaps, mapped onto a `(width, height)` image
pub fn decode_heatmaps(heatmaps: &DenseTensor, image_size: (u32, u32)) -> PoseResult<Vec<Keypoint2D>> {
    let (joints, h, w) = match heatmaps.shape.as_slice() {
        [1, joints, h, w] if *h > 0 && *w > 0 => (*joints, *h, *w),
        _ => return Err(PoseError::InvalidHeatmap(heatmaps.dims_i64())),
    };

    let scale_x = image_size.0 as f32 / w as f32;
    let scale_y = image_size.1 as f32 / h as f32;

    let keypoints = heatmaps
        .data
        .chunks_exact(h * w)
        .take(joints)
        .map(|map| {
            // First maximum wins on ties
            let (index, score) = map
                .iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
            let (hx, hy) = (index % w, index / w);
            Keypoint2D::new(
                (hx as f32 * scale_x).floor(),
                (hy as f32 * scale_y).floor(),
                score,
            )
        })
        .collect();
    Ok(keypoints)
}

// ==============================================================================
// Rendering
// ==============================================================================

fn put_pixel_checked(canvas: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < canvas.width() && (y as u32) < canvas.height() {
        canvas.put_pixel(x as u32, y as u32, color);
    }
}

fn fill_circle(canvas: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                put_pixel_checked(canvas, cx + dx, cy + dy, color);
            }
        }
    }
}

/// Bresenham line stamped with a square brush
fn draw_line(canvas: &mut RgbImage, from: (i32, i32), to: (i32, i32), thickness: i32, color: Rgb<u8>) {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    let lo = -(thickness - 1) / 2;
    let hi = thickness / 2;

    loop {
        for oy in lo..=hi {
            for ox in lo..=hi {
                put_pixel_checked(canvas, x + ox, y + oy, color);
            }
        }
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

/// Draw keypoints and skeleton limbs scoring at least `min_score`
pub fn draw_pose(canvas: &mut RgbImage, keypoints: &[Keypoint2D], min_score: f32) {
    let point = |kp: &Keypoint2D| (kp.x as i32, kp.y as i32);

    for kp in keypoints.iter().filter(|kp| kp.is_visible(min_score)) {
        let (x, y) = point(kp);
        fill_circle(canvas, x, y, KEYPOINT_RADIUS, KEYPOINT_COLOR);
    }

    for (a, b) in SKELETON {
        let (Some(ka), Some(kb)) = (keypoints.get(a as usize), keypoints.get(b as usize)) else {
            continue;
        };
        if ka.is_visible(min_score) && kb.is_visible(min_score) {
            draw_line(canvas, point(ka), point(kb), LIMB_THICKNESS, LIMB_COLOR);
        }
    }
}

// ==============================================================================
// Pose Estimator
// ==============================================================================

pub struct PoseEstimator {
    session: InferenceSession,
    input_name: String,
    config: PoseConfig,
}

fn session_error(e: ExportError, wrap: fn(String) -> PoseError) -> PoseError {
    match e {
        ExportError::Unsupported(msg) => PoseError::NotSupported(msg),
        other => wrap(other.to_string()),
    }
}

impl PoseEstimator {
    pub fn new(model_path: &Path, config: PoseConfig) -> PoseResult<Self> {
        let session = InferenceSession::open(model_path, config.use_cuda)
            .map_err(|e| session_error(e, PoseError::ModelLoadFailed))?;
        let input_name = session
            .inputs()
            .first()
            .map(|info| info.name.clone())
            .ok_or_else(|| PoseError::ModelLoadFailed("model declares no inputs".into()))?;

        tracing::info!("Loaded pose model {} (input '{}')", model_path.display(), input_name);
        Ok(Self {
            session,
            input_name,
            config,
        })
    }

    pub fn config(&self) -> &PoseConfig {
        &self.config
    }

    /// Run the model on one image and decode its keypoints
    pub fn estimate(&mut self, image: &DynamicImage) -> PoseResult<PoseEstimate> {
        let start_time = Instant::now();
        let input = preprocess(image, &self.config);

        let mut outputs = self
            .session
            .run(&[(self.input_name.as_str(), &input)])
            .map_err(|e| session_error(e, PoseError::InferenceFailed))?;
        if outputs.is_empty() {
            return Err(PoseError::InferenceFailed("model produced no outputs".into()));
        }
        let (_, heatmaps) = outputs.swap_remove(0);
        tracing::debug!("Heatmaps: {:?}", heatmaps.shape);

        let image_size = (image.width(), image.height());
        let keypoints = decode_heatmaps(&heatmaps, image_size)?;
        let heatmap_size = (heatmaps.shape[2], heatmaps.shape[3]);

        Ok(PoseEstimate {
            keypoints,
            heatmap_size,
            image_size,
            processing_time_ms: start_time.elapsed().as_millis() as u64,
        })
    }

    /// Estimate the pose in `image_path` and save an annotated copy to `output_path`
    pub fn infer_file(&mut self, image_path: &Path, output_path: &Path) -> PoseResult<PoseEstimate> {
        let image = image::open(image_path)
            .map_err(|e| PoseError::ImageLoadFailed(format!("{}: {}", image_path.display(), e)))?;

        println!("Running inference...");
        let estimate = self.estimate(&image)?;
        println!(
            "Output shape: [1, {}, {}, {}]",
            estimate.keypoints.len(),
            estimate.heatmap_size.0,
            estimate.heatmap_size.1
        );

        let mut canvas = image.to_rgb8();
        draw_pose(&mut canvas, &estimate.keypoints, self.config.min_keypoint_score);
        canvas
            .save(output_path)
            .map_err(|e| PoseError::ImageSaveFailed(format!("{}: {}", output_path.display(), e)))?;
        println!("Result saved to {}", output_path.display());

        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_layout_and_normalisation() {
        let config = PoseConfig {
            input_width: 4,
            input_height: 2,
            ..PoseConfig::default()
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 4, Rgb([255, 0, 128])));
        let tensor = preprocess(&image, &config);

        assert_eq!(tensor.shape, vec![1, 3, 2, 4]);
        let red = (1.0 - 0.485) / 0.229;
        let green = (0.0 - 0.456) / 0.224;
        assert!(tensor.data[..8].iter().all(|v| (v - red).abs() < 1e-4));
        assert!(tensor.data[8..16].iter().all(|v| (v - green).abs() < 1e-4));
    }

    #[test]
    fn test_decode_heatmaps_scales_to_image() {
        // 2 joints on a 4x3 (h x w) grid
        let mut heatmaps = DenseTensor::zeros(&[1, 2, 4, 3]);
        heatmaps.data[2 * 3 + 1] = 0.9; // joint 0 at (x=1, y=2)
        heatmaps.data[12 + 3 * 3 + 2] = 0.5; // joint 1 at (x=2, y=3)

        let keypoints = decode_heatmaps(&heatmaps, (30, 40)).unwrap();
        assert_eq!(keypoints.len(), 2);
        assert_eq!(keypoints[0], Keypoint2D::new(10.0, 20.0, 0.9));
        assert_eq!(keypoints[1], Keypoint2D::new(20.0, 30.0, 0.5));
    }

    #[test]
    fn test_decode_prefers_first_maximum() {
        let heatmaps = DenseTensor::from_vec(&[1, 1, 2, 2], vec![0.3, 0.7, 0.7, 0.1]).unwrap();
        let keypoints = decode_heatmaps(&heatmaps, (2, 2)).unwrap();
        assert_eq!((keypoints[0].x, keypoints[0].y), (1.0, 0.0));
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        for shape in [vec![17, 64, 48], vec![2, 17, 64, 48], vec![1, 17, 0, 48]] {
            let heatmaps = DenseTensor::zeros(&shape);
            assert!(matches!(
                decode_heatmaps(&heatmaps, (192, 256)),
                Err(PoseError::InvalidHeatmap(_))
            ));
        }
    }

    #[test]
    fn test_draw_pose_marks_points_and_limbs() {
        let mut canvas = RgbImage::new(40, 40);
        let mut keypoints = vec![Keypoint2D::new(0.0, 0.0, -1.0); 17];
        keypoints[0] = Keypoint2D::new(5.0, 20.0, 1.0); // nose
        keypoints[1] = Keypoint2D::new(35.0, 20.0, 1.0); // left eye

        draw_pose(&mut canvas, &keypoints, 0.0);

        // Limbs are drawn over the keypoints they join
        assert_eq!(*canvas.get_pixel(5, 24), KEYPOINT_COLOR);
        assert_eq!(*canvas.get_pixel(35, 16), KEYPOINT_COLOR);
        assert_eq!(*canvas.get_pixel(5, 20), LIMB_COLOR);
        assert_eq!(*canvas.get_pixel(20, 20), LIMB_COLOR);
        // Hidden joints are neither drawn nor connected
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*canvas.get_pixel(5, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_clips_at_borders() {
        let mut canvas = RgbImage::new(4, 4);
        let keypoints = vec![Keypoint2D::new(0.0, 0.0, 1.0), Keypoint2D::new(100.0, 100.0, 1.0)];
        draw_pose(&mut canvas, &keypoints, 0.0);
        assert_eq!(*canvas.get_pixel(0, 3), KEYPOINT_COLOR);
        assert_eq!(*canvas.get_pixel(0, 0), LIMB_COLOR);
        assert_eq!(*canvas.get_pixel(3, 3), LIMB_COLOR);
    }

    #[test]
    fn test_default_config_draws_negative_peaks() {
        let mut canvas = RgbImage::new(20, 20);
        let keypoints = vec![Keypoint2D::new(10.0, 10.0, -3.5)];
        draw_pose(&mut canvas, &keypoints, PoseConfig::default().min_keypoint_score);
        assert_eq!(*canvas.get_pixel(10, 10), KEYPOINT_COLOR);
    }

    #[cfg(feature = "runtime")]
    #[test]
    fn test_infer_file_writes_annotated_image() {
        use crate::core::exporter::export;
        use crate::core::model_hub::PoseModel;
        use crate::core::testing::tiny_config;
        use crate::models::export::ExportOptions;
        use crate::models::tensor::build_synthetic_input;

        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("tiny.onnx");
        let model = PoseModel::random(tiny_config(true), Some(2)).unwrap();
        export(&model, &build_synthetic_input(1, 3, 32, 16, None), &model_path, &ExportOptions::default()).unwrap();

        let image_path = dir.path().join("person.png");
        RgbImage::from_pixel(64, 96, Rgb([90, 120, 150])).save(&image_path).unwrap();
        let output_path = dir.path().join("result.jpg");

        let config = PoseConfig {
            input_width: 16,
            input_height: 32,
            use_cuda: false,
            ..PoseConfig::default()
        };
        let mut estimator = PoseEstimator::new(&model_path, config).unwrap();
        let estimate = estimator.infer_file(&image_path, &output_path).unwrap();

        assert_eq!(estimate.keypoints.len(), 17);
        assert_eq!(estimate.heatmap_size, (16, 8));
        assert_eq!(estimate.image_size, (64, 96));
        assert!(estimate.keypoints.iter().all(|kp| kp.x < 64.0 && kp.y < 96.0));
        assert!(output_path.is_file());
    }
}
