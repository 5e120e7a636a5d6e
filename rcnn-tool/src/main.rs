use anyhow::{format_err, Context as _, Result};
use bbox::{prelude::*, XYWH};
use clap::Parser;
use label::Label;
use log::info;
use prettytable::{cell, row, Table};
use rand::{rngs::StdRng, SeedableRng};
use rcnn::{config::Config, pipeline::PipelineInit, GroundTruth};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Validate a configuration and show its anchor layout
    Info {
        /// configuration file
        config_file: PathBuf,
    },
    /// Run anchor target assignment over a label file
    Assign {
        /// configuration file
        config_file: PathBuf,
        /// JSON5 label file
        label_file: PathBuf,
        /// random seed of anchor sampling
        #[clap(long, default_value = "0")]
        seed: u64,
    },
}

/// Labels of one image, in pixels of the resized image.
#[derive(Debug, Clone, Deserialize)]
struct ImageLabels {
    name: String,
    boxes: Vec<BoxLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct BoxLabel {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
    class: String,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Opts::parse() {
        Opts::Info { config_file } => {
            info(config_file)?;
        }
        Opts::Assign {
            config_file,
            label_file,
            seed,
        } => {
            assign(config_file, label_file, seed)?;
        }
    }

    Ok(())
}

fn info(config_file: impl AsRef<Path>) -> Result<()> {
    let config = Config::open(config_file)?;
    let pipeline = PipelineInit::new(config).build()?;
    let anchors = pipeline.anchors();
    let generator = anchors.generator();

    println!(
        "image {}x{}, feature map {}x{}, downscale {}",
        pipeline.config().image.height,
        pipeline.config().image.width,
        generator.grid_h(),
        generator.grid_w(),
        generator.downscale()
    );

    // print anchor counts per (size, ratio)
    {
        let mut table = Table::new();
        table.add_row(row!["size", "ratio", "w", "h", "anchors", "valid"]);

        for size_index in 0..generator.sizes().len() {
            for ratio_index in 0..generator.ratios().len() {
                let spec = generator.spec(size_index, ratio_index);
                let (count, num_valid, wh) = anchors
                    .anchors()
                    .iter()
                    .zip(anchors.valid())
                    .filter(|(anchor, _)| {
                        anchor.size_index() == size_index && anchor.ratio_index() == ratio_index
                    })
                    .fold((0, 0, None), |(count, num_valid, wh), (anchor, &valid)| {
                        let rect = anchor.rect();
                        (
                            count + 1,
                            num_valid + valid as usize,
                            wh.or(Some((rect.w(), rect.h()))),
                        )
                    });
                let (w, h) = wh.unwrap_or((0.0, 0.0));

                table.add_row(row![
                    spec.size,
                    spec.ratio,
                    format!("{:.3}", w),
                    format!("{:.3}", h),
                    count,
                    num_valid
                ]);
            }
        }

        table.printstd();
    }

    println!(
        "{} anchors in total, {} valid",
        anchors.len(),
        anchors.num_valid()
    );

    Ok(())
}

fn assign(config_file: impl AsRef<Path>, label_file: impl AsRef<Path>, seed: u64) -> Result<()> {
    let config = Config::open(config_file)?;
    let pipeline = PipelineInit::new(config).build()?;
    let images = load_labels(label_file)?;
    let classes = &pipeline.config().classifier.classes;
    let mut rng = StdRng::seed_from_u64(seed);

    let mut table = Table::new();
    table.add_row(row!["image", "boxes", "positive", "negative", "neutral"]);

    for image in &images {
        let ground_truth: Vec<GroundTruth> = image
            .boxes
            .iter()
            .map(|label| -> Result<_> {
                let class = classes
                    .iter()
                    .position(|name| name == &label.class)
                    .ok_or_else(|| {
                        format_err!(
                            "unknown class '{}' in image '{}'",
                            label.class,
                            image.name
                        )
                    })?;
                let rect = XYWH::try_from_xywh([label.x, label.y, label.w, label.h])
                    .with_context(|| format!("invalid box in image '{}'", image.name))?;
                Ok(Label::new(rect, class))
            })
            .collect::<Result<_>>()?;

        let ground_truth = pipeline.to_feature_units(&ground_truth);
        let targets = pipeline.rpn_targets(&ground_truth, &mut rng);

        table.add_row(row![
            image.name,
            ground_truth.len(),
            targets.num_positive(),
            targets.num_negative(),
            targets.num_neutral()
        ]);
    }

    table.printstd();
    info!("assigned anchors for {} images", images.len());

    Ok(())
}

fn load_labels(label_file: impl AsRef<Path>) -> Result<Vec<ImageLabels>> {
    let label_file = label_file.as_ref();
    let text = std::fs::read_to_string(label_file)
        .with_context(|| format!("unable to read label file '{}'", label_file.display()))?;
    let images: Vec<ImageLabels> = json5::from_str(&text)
        .with_context(|| format!("unable to parse label file '{}'", label_file.display()))?;
    Ok(images)
}
