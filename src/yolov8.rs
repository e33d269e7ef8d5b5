use std::path::{Path, PathBuf};

use super::{
    bounding_box::{BoundingBox, non_maximum_suppression},
    model::{Multiples, YoloV8 as YoloV8Model},
};
use candle_core::{DType, Device, Tensor, safetensors::MmapedSafetensors};
use candle_nn::{Module, VarBuilder};
use kornia_image::{Image, ImageSize};

/// Hub repository holding the pretrained candle YOLOv8 checkpoints.
const HUB_REPOSITORY: &str = "lmz/candle-yolo-v8";

/// Number of classes of the pretrained COCO checkpoints.
const COCO_NUM_CLASSES: usize = 80;

/// YOLOv8 error enum.
#[derive(thiserror::Error, Debug)]
pub enum YoloV8Error {
    /// Failed to load YOLOv8 model.
    #[error("Failed to load YOLOv8 model: {0}")]
    LoadModelError(String),

    /// Internal candle error.
    #[error(transparent)]
    CandleError(#[from] candle_core::Error),

    /// Kornia image error.
    #[error(transparent)]
    KorniaImageError(#[from] kornia_image::ImageError),

    /// Hugging Face API error.
    #[error(transparent)]
    ApiError(#[from] hf_hub::api::sync::ApiError),
}

/// YOLOv8 model size enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YoloV8Size {
    /// N model size.
    N,
    /// S model size.
    S,
    /// M model size.
    M,
    /// L model size.
    L,
    /// X model size.
    X,
}

impl YoloV8Size {
    fn multiples(&self) -> Multiples {
        match self {
            YoloV8Size::N => Multiples::n(),
            YoloV8Size::S => Multiples::s(),
            YoloV8Size::M => Multiples::m(),
            YoloV8Size::L => Multiples::l(),
            YoloV8Size::X => Multiples::x(),
        }
    }

    /// Recover the size from the output channels of the first stem convolution.
    fn from_stem_channels(channels: usize) -> Result<Self, YoloV8Error> {
        Ok(match channels {
            16 => YoloV8Size::N,
            32 => YoloV8Size::S,
            48 => YoloV8Size::M,
            64 => YoloV8Size::L,
            80 => YoloV8Size::X,
            _ => {
                return Err(YoloV8Error::LoadModelError(format!(
                    "unexpected stem width {channels}, not a YOLOv8 n/s/m/l/x checkpoint"
                )));
            }
        })
    }
}

impl std::str::FromStr for YoloV8Size {
    type Err = YoloV8Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "n" => YoloV8Size::N,
            "s" => YoloV8Size::S,
            "m" => YoloV8Size::M,
            "l" => YoloV8Size::L,
            "x" => YoloV8Size::X,
            _ => return Err(YoloV8Error::LoadModelError(format!("Invalid size: {s}"))),
        })
    }
}

impl TryFrom<String> for YoloV8Size {
    type Error = YoloV8Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::fmt::Display for YoloV8Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                YoloV8Size::N => "n",
                YoloV8Size::S => "s",
                YoloV8Size::M => "m",
                YoloV8Size::L => "l",
                YoloV8Size::X => "x",
            }
        )
    }
}

/// Where the detector weights come from.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightsSource {
    /// A candle-layout safetensors checkpoint on disk.
    Local(PathBuf),
    /// Pretrained COCO weights of the given size from the Hugging Face hub.
    Hub(YoloV8Size),
}

impl WeightsSource {
    /// Startup weights policy: use `path` when it exists, otherwise fall back
    /// to the pretrained `fallback` weights.
    ///
    /// Only a missing file triggers the fallback. A file that exists but fails
    /// to load is reported by [`YoloV8::new`].
    pub fn resolve(path: &Path, fallback: YoloV8Size) -> Self {
        if path.exists() {
            WeightsSource::Local(path.to_path_buf())
        } else {
            tracing::warn!(
                "custom model not found at {}, using pretrained yolov8{} as fallback",
                path.display(),
                fallback
            );
            WeightsSource::Hub(fallback)
        }
    }
}

impl std::fmt::Display for WeightsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightsSource::Local(path) => write!(f, "{}", path.display()),
            WeightsSource::Hub(size) => write!(f, "{HUB_REPOSITORY}/yolov8{size}.safetensors"),
        }
    }
}

/// YOLOv8 configuration struct.
#[derive(Debug, Clone)]
pub struct YoloV8Config {
    /// The weights to load
    pub weights: WeightsSource,
    /// The confidence threshold for the model
    pub confidence_threshold: f32,
    /// The non-maximum suppression threshold for the model
    pub nms_threshold: f32,
    /// Maximum number of boxes reported per image
    pub max_detections: usize,
    /// Length of the longest input side, a multiple of 32
    pub image_size: usize,
    /// Whether to use the CPU or GPU
    pub use_cpu: bool,
}

/// Default configuration for YOLOv8.
impl Default for YoloV8Config {
    fn default() -> Self {
        Self {
            weights: WeightsSource::Hub(YoloV8Size::N),
            confidence_threshold: 0.1,
            nms_threshold: 0.7,
            max_detections: 300,
            image_size: 640,
            use_cpu: true,
        }
    }
}

/// Something that finds objects in an rgb8 image.
///
/// The HTTP layer only knows this trait, so a loaded model can be shared
/// across request handlers behind an `Arc<dyn Detector>`.
pub trait Detector: Send + Sync {
    /// Detect objects, boxes are in the pixel coordinates of `image`.
    fn detect(&self, image: &Image<u8, 3>) -> Result<Vec<BoundingBox>, YoloV8Error>;
}

/// YOLOv8 high level interface.
pub struct YoloV8 {
    config: YoloV8Config,
    device: Device,
    model: YoloV8Model,
    size: YoloV8Size,
    num_classes: usize,
}

impl YoloV8 {
    /// Create a new YOLOv8 instance
    pub fn new(config: YoloV8Config) -> Result<Self, YoloV8Error> {
        let device = if config.use_cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0)
                .map_err(|_| YoloV8Error::LoadModelError("cuda:0 error".to_string()))?
        };
        let (vb, size, num_classes) = match &config.weights {
            WeightsSource::Local(path) => Self::load_local(path, &device)?,
            WeightsSource::Hub(size) => Self::load_hub(*size, &device)?,
        };
        tracing::info!(
            "model loaded from {}: yolov8{}, {} classes, device {:?}",
            config.weights,
            size,
            num_classes,
            device
        );
        Self::from_var_builder(config, vb, size, num_classes)
    }

    /// Build a detector from an already prepared var builder.
    pub fn from_var_builder(
        config: YoloV8Config,
        vb: VarBuilder,
        size: YoloV8Size,
        num_classes: usize,
    ) -> Result<Self, YoloV8Error> {
        if config.image_size == 0 || config.image_size % 32 != 0 {
            return Err(YoloV8Error::LoadModelError(format!(
                "input size {} is not a positive multiple of 32",
                config.image_size
            )));
        }
        let device = vb.device().clone();
        let model = YoloV8Model::load(vb, size.multiples(), num_classes)?;
        Ok(Self {
            config,
            device,
            model,
            size,
            num_classes,
        })
    }

    /// Size variant of the loaded network.
    pub fn size(&self) -> YoloV8Size {
        self.size
    }

    /// Number of classes the loaded head predicts.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Perform inference on an rgb8 image
    pub fn inference(&self, image: &Image<u8, 3>) -> Result<Vec<BoundingBox>, YoloV8Error> {
        // preprocess the image
        let (image_t, w_ratio, h_ratio) = self.preprocess_image(image)?;

        // forward the image
        let pred = self.model.forward(&image_t)?.squeeze(0)?;

        // postprocess the predictions
        let mut bboxes = self.postprocess_predictions(&pred, w_ratio, h_ratio)?;
        let (width, height) = (image.width() as f32, image.height() as f32);
        for bbox in bboxes.iter_mut() {
            *bbox = bbox.clip(width, height);
        }
        Ok(bboxes)
    }

    fn preprocess_image(&self, image: &Image<u8, 3>) -> Result<(Tensor, f32, f32), YoloV8Error> {
        let (width, height) = input_dims(image.width(), image.height(), self.config.image_size);

        let w_ratio = image.width() as f32 / width as f32;
        let h_ratio = image.height() as f32 / height as f32;

        let mut image_resized = Image::from_size_val(ImageSize { width, height }, 0)?;
        kornia_imgproc::resize::resize_fast(
            image,
            &mut image_resized,
            kornia_imgproc::interpolation::InterpolationMode::Nearest,
        )?;

        let image_resized = image_resized.map(|&x| x as f32 / 255.0);

        let image_t =
            Tensor::from_vec::<_, f32>(image_resized.into_vec(), (height, width, 3), &self.device)?
                .permute((2, 0, 1))?
                .unsqueeze(0)?;

        Ok((image_t, w_ratio, h_ratio))
    }

    fn postprocess_predictions(
        &self,
        pred: &Tensor,
        w_ratio: f32,
        h_ratio: f32,
    ) -> Result<Vec<BoundingBox>, YoloV8Error> {
        let (pred_size, _npreds) = pred.dims2()?;
        let nclasses = pred_size - 4;
        // one row per anchor: cx, cy, w, h, class scores
        let rows = pred.t()?.contiguous()?.to_vec2::<f32>()?;
        let mut bboxes: Vec<Vec<BoundingBox>> = (0..nclasses).map(|_| Vec::new()).collect();
        for pred in rows.iter() {
            let scores = &pred[4..];
            let Some((class_index, &confidence)) = scores
                .iter()
                .enumerate()
                .reduce(|best, next| if next.1 > best.1 { next } else { best })
            else {
                continue;
            };
            if confidence > self.config.confidence_threshold && confidence > 0. {
                bboxes[class_index].push(BoundingBox {
                    xmin: (pred[0] - pred[2] / 2.0) * w_ratio,
                    ymin: (pred[1] - pred[3] / 2.0) * h_ratio,
                    xmax: (pred[0] + pred[2] / 2.0) * w_ratio,
                    ymax: (pred[1] + pred[3] / 2.0) * h_ratio,
                    confidence,
                    class: class_index as u32,
                });
            }
        }

        non_maximum_suppression(&mut bboxes, self.config.nms_threshold);

        let mut bboxes: Vec<BoundingBox> = bboxes.into_iter().flatten().collect();
        bboxes.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        bboxes.truncate(self.config.max_detections);
        Ok(bboxes)
    }

    fn load_local(
        path: &Path,
        device: &Device,
    ) -> Result<(VarBuilder<'static>, YoloV8Size, usize), YoloV8Error> {
        if path.extension().and_then(|ext| ext.to_str()) != Some("safetensors") {
            return Err(YoloV8Error::LoadModelError(format!(
                "unsupported weights file {}, expected a .safetensors checkpoint",
                path.display()
            )));
        }
        let (size, num_classes) = inspect_checkpoint(path)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        Ok((vb, size, num_classes))
    }

    fn load_hub(
        size: YoloV8Size,
        device: &Device,
    ) -> Result<(VarBuilder<'static>, YoloV8Size, usize), YoloV8Error> {
        // check if the model is already downloaded or download it
        let model_path = hf_hub::api::sync::Api::new()?
            .model(HUB_REPOSITORY.to_string())
            .get(&format!("yolov8{}.safetensors", size))?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], DType::F32, device)? };
        Ok((vb, size, COCO_NUM_CLASSES))
    }
}

impl Detector for YoloV8 {
    fn detect(&self, image: &Image<u8, 3>) -> Result<Vec<BoundingBox>, YoloV8Error> {
        self.inference(image)
    }
}

/// Read the network size and class count from the checkpoint tensor shapes.
fn inspect_checkpoint(path: &Path) -> Result<(YoloV8Size, usize), YoloV8Error> {
    let tensors = unsafe { MmapedSafetensors::new(path)? };
    let first_dim = |name: &str| -> Result<usize, YoloV8Error> {
        tensors.get(name)?.shape().first().copied().ok_or_else(|| {
            YoloV8Error::LoadModelError(format!("tensor {name} in {} is a scalar", path.display()))
        })
    };
    let size = YoloV8Size::from_stem_channels(first_dim("net.b1.0.conv.weight")?)?;
    let num_classes = first_dim("head.cv3.0.2.weight")?;
    Ok((size, num_classes))
}

/// Network input dimensions: the longest side becomes `image_size`, the other
/// side keeps the aspect ratio rounded down to a multiple of 32 (at least 32).
fn input_dims(width: usize, height: usize, image_size: usize) -> (usize, usize) {
    let to_stride = |x: usize| (x / 32 * 32).max(32);
    if width < height {
        (to_stride(width * image_size / height), image_size)
    } else {
        (image_size, to_stride(height * image_size / width))
    }
}
