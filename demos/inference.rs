use argh::FromArgs;
use std::path::PathBuf;

use candle_core::Device;
use kornia_io::functional as F;
use kornia_tiny_yolov2::{DetectOptions, InputSize, TinyYolov2, TinyYolov2Config};

#[derive(FromArgs)]
/// Tiny YOLOv2 inference application arguments
struct Args {
    /// path to an input image
    #[argh(option)]
    image_path: PathBuf,

    /// path to a json model configuration, the face detector one if not given
    #[argh(option)]
    config_path: Option<PathBuf>,

    /// path to a safetensors weights file
    #[argh(option)]
    weights_path: Option<PathBuf>,

    /// hugging face repository to download the weights from
    #[argh(option)]
    hub_repo: Option<String>,

    /// weights file within the hugging face repository
    #[argh(option, default = "\"tiny_yolov2.safetensors\".to_string()")]
    hub_file: String,

    /// the input size: xs, sm, md, lg or a multiple of 32
    #[argh(option, default = "\"md\".to_string()")]
    input_size: String,

    /// the score threshold for the model
    #[argh(option, default = "0.5")]
    score_threshold: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = argh::from_env();

    let rec = rerun::RecordingStreamBuilder::new("Tiny YOLOv2 Inference App").spawn()?;

    let config = match args.config_path {
        Some(path) => TinyYolov2Config::from_json(&std::fs::read_to_string(path)?)?,
        None => TinyYolov2Config::default(),
    };

    let mut model = TinyYolov2::new(config, Device::Cpu)?;
    match (args.weights_path, args.hub_repo) {
        (Some(path), _) => model.load_safetensors(path)?,
        (None, Some(repo)) => model.load_from_hub(&repo, &args.hub_file)?,
        (None, None) => return Err("either --weights-path or --hub-repo is required".into()),
    }

    // read the image as RGB8
    let image = F::read_image_any(args.image_path)?;

    let options = DetectOptions {
        input_size: InputSize::try_from(args.input_size.as_str())?,
        score_threshold: args.score_threshold,
    };

    // perform inference and get the detections
    let detections = model.detect(&image, &options)?;

    rec.log(
        "image",
        &rerun::Image::from_elements(
            image.as_slice(),
            image.size().into(),
            rerun::ColorModel::RGB,
        ),
    )?;

    let mut boxes_mins = Vec::new();
    let mut boxes_sizes = Vec::new();
    let mut labels = Vec::new();
    for detection in detections {
        boxes_mins.push((detection.bbox.x, detection.bbox.y));
        boxes_sizes.push((detection.bbox.width, detection.bbox.height));
        labels.push(format!("{} {:.2}", detection.class_name, detection.class_score));
    }

    rec.log(
        "boxes",
        &rerun::Boxes2D::from_mins_and_sizes(boxes_mins, boxes_sizes).with_labels(labels),
    )?;

    Ok(())
}
