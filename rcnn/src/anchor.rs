//! Anchor box enumeration and validation.
//!
//! Anchors are laid out in a flat sequence whose index is
//!
//! ```text
//! ((row * grid_w + col) * num_sizes + size_index) * num_ratios + ratio_index
//! ```
//!
//! which is the row-major flattening of the `(grid_h, grid_w, num_sizes * num_ratios)`
//! objectness map produced by the proposal network.

use crate::common::*;

/// The (size, ratio) pair an anchor is generated from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorSpec {
    /// Anchor size in pixels.
    pub size: usize,
    /// Aspect ratio as width / height.
    pub ratio: f32,
}

/// An anchor box in feature map units tagged with its grid position.
#[derive(Debug, Clone, Copy, PartialEq, CopyGetters)]
#[get_copy = "pub"]
pub struct Anchor {
    rect: XYWH<f32>,
    row: usize,
    col: usize,
    size_index: usize,
    ratio_index: usize,
}

#[derive(Debug, Clone)]
pub struct AnchorGeneratorInit {
    pub grid_h: usize,
    pub grid_w: usize,
    pub sizes: Vec<usize>,
    pub ratios: Vec<f32>,
    pub downscale: usize,
}

impl AnchorGeneratorInit {
    pub fn build(self) -> Result<AnchorGenerator> {
        let Self {
            grid_h,
            grid_w,
            sizes,
            ratios,
            downscale,
        } = self;

        ensure!(
            grid_h > 0 && grid_w > 0,
            "feature map size must be positive, but get {}x{}",
            grid_h,
            grid_w
        );
        ensure!(!sizes.is_empty(), "anchor sizes must not be empty");
        ensure!(
            sizes.iter().all(|&size| size > 0),
            "anchor sizes must be positive"
        );
        ensure!(!ratios.is_empty(), "anchor ratios must not be empty");
        ensure!(
            ratios.iter().all(|&ratio| ratio.is_finite() && ratio > 0.0),
            "anchor ratios must be positive"
        );
        ensure!(downscale > 0, "downscale must be positive");

        Ok(AnchorGenerator {
            grid_h,
            grid_w,
            sizes,
            ratios,
            downscale,
        })
    }
}

/// Enumerates anchors over the feature map grid.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct AnchorGenerator {
    #[get_copy = "pub"]
    grid_h: usize,
    #[get_copy = "pub"]
    grid_w: usize,
    #[get = "pub"]
    sizes: Vec<usize>,
    #[get = "pub"]
    ratios: Vec<f32>,
    #[get_copy = "pub"]
    downscale: usize,
}

impl AnchorGenerator {
    pub fn anchors_per_cell(&self) -> usize {
        self.sizes.len() * self.ratios.len()
    }

    pub fn num_anchors(&self) -> usize {
        self.grid_h * self.grid_w * self.anchors_per_cell()
    }

    /// The global index of an anchor.
    pub fn index(&self, row: usize, col: usize, size_index: usize, ratio_index: usize) -> usize {
        debug_assert!(row < self.grid_h && col < self.grid_w);
        debug_assert!(size_index < self.sizes.len() && ratio_index < self.ratios.len());
        ((row * self.grid_w + col) * self.sizes.len() + size_index) * self.ratios.len()
            + ratio_index
    }

    /// Recover `(row, col, size_index, ratio_index)` from a global index.
    pub fn position(&self, index: usize) -> (usize, usize, usize, usize) {
        let num_ratios = self.ratios.len();
        let num_sizes = self.sizes.len();
        let ratio_index = index % num_ratios;
        let rest = index / num_ratios;
        let size_index = rest % num_sizes;
        let cell = rest / num_sizes;
        (cell / self.grid_w, cell % self.grid_w, size_index, ratio_index)
    }

    pub fn spec(&self, size_index: usize, ratio_index: usize) -> AnchorSpec {
        AnchorSpec {
            size: self.sizes[size_index],
            ratio: self.ratios[ratio_index],
        }
    }

    /// Generate all anchors in index order.
    pub fn generate(&self) -> Result<Vec<Anchor>> {
        let downscale = self.downscale as f32;

        // anchor extents do not depend on the position
        let extents: Vec<(f32, f32)> = self
            .sizes
            .iter()
            .flat_map(|&size| {
                self.ratios.iter().map(move |&ratio| {
                    let size = size as f32;
                    let sqrt_ratio = ratio.sqrt();
                    (size * sqrt_ratio / downscale, size / sqrt_ratio / downscale)
                })
            })
            .collect();
        let num_ratios = self.ratios.len();

        let mut anchors = Vec::with_capacity(self.num_anchors());
        for row in 0..self.grid_h {
            for col in 0..self.grid_w {
                let cx = col as f32 + 0.5;
                let cy = row as f32 + 0.5;

                for (spec_index, &(w, h)) in extents.iter().enumerate() {
                    anchors.push(Anchor {
                        rect: XYWH::try_from_cxcywh([cx, cy, w, h])?,
                        row,
                        col,
                        size_index: spec_index / num_ratios,
                        ratio_index: spec_index % num_ratios,
                    });
                }
            }
        }

        debug_assert_eq!(anchors.len(), self.num_anchors());
        Ok(anchors)
    }
}

/// Marks anchors lying entirely within the resized image.
#[derive(Debug, Clone)]
pub struct AnchorValidator {
    bounds: WH<f32>,
}

impl AnchorValidator {
    /// Create a validator for a resized image in pixels and its downscale factor.
    pub fn new(image_h: usize, image_w: usize, downscale: usize) -> Result<Self> {
        ensure!(
            image_h > 0 && image_w > 0,
            "image size must be positive, but get {}x{}",
            image_h,
            image_w
        );
        ensure!(downscale > 0, "downscale must be positive");
        let downscale = downscale as f32;
        let bounds = WH::try_from_wh([image_w as f32 / downscale, image_h as f32 / downscale])?;
        Ok(Self { bounds })
    }

    /// The image bounds in feature map units.
    pub fn bounds(&self) -> &WH<f32> {
        &self.bounds
    }

    pub fn is_valid(&self, anchor: &Anchor) -> bool {
        !anchor.rect.is_degenerate() && anchor.rect.is_inside(&self.bounds)
    }

    pub fn mask(&self, anchors: &[Anchor]) -> Vec<bool> {
        anchors.iter().map(|anchor| self.is_valid(anchor)).collect()
    }
}

/// The anchors of one input resolution together with their validity mask.
///
/// It is computed once per run and shared read-only between images.
#[derive(Debug, Clone, Getters)]
pub struct AnchorSet {
    #[get = "pub"]
    generator: AnchorGenerator,
    #[get = "pub"]
    anchors: Vec<Anchor>,
    #[get = "pub"]
    valid: Vec<bool>,
    #[get = "pub"]
    bounds: WH<f32>,
}

impl AnchorSet {
    pub fn new(generator: AnchorGenerator, validator: &AnchorValidator) -> Result<Self> {
        let anchors = generator.generate()?;
        let valid = validator.mask(&anchors);
        let num_valid = valid.iter().filter(|&&valid| valid).count();
        debug!(
            "generated {} anchors on a {}x{} grid, {} of them valid",
            anchors.len(),
            generator.grid_h(),
            generator.grid_w(),
            num_valid
        );

        Ok(Self {
            generator,
            anchors,
            valid,
            bounds: *validator.bounds(),
        })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub fn num_valid(&self) -> usize {
        self.valid.iter().filter(|&&valid| valid).count()
    }

    /// Global indexes of valid anchors in ascending order.
    pub fn valid_indices(&self) -> Vec<usize> {
        self.valid
            .iter()
            .enumerate()
            .filter_map(|(index, &valid)| valid.then(|| index))
            .collect()
    }

    pub fn rects(&self) -> Vec<XYWH<f32>> {
        self.anchors.iter().map(|anchor| anchor.rect).collect()
    }
}

/// Anchor sizes used when none are configured: the largest power of two
/// not exceeding the shorter image side and the two powers below it.
pub fn default_anchor_sizes(height: usize, width: usize) -> Vec<usize> {
    let min_dim = cmp::min(height, width).max(1);
    let index = (usize::BITS - 1 - min_dim.leading_zeros()) as usize;
    (0..3)
        .filter_map(|offset| index.checked_sub(offset))
        .map(|exp| 1usize << exp)
        .collect()
}

/// The feature map size in (height, width) of an image downscaled by `downscale`.
pub fn feature_size(height: usize, width: usize, downscale: usize) -> (usize, usize) {
    let downscale = downscale.max(1);
    (
        (height + downscale - 1) / downscale,
        (width + downscale - 1) / downscale,
    )
}

/// The downscale factor between an image and the feature map a backbone produced for it.
pub fn downscale_for(height: usize, width: usize, grid_h: usize, grid_w: usize) -> Result<usize> {
    ensure!(
        grid_h > 0 && grid_w > 0,
        "feature map size must be positive"
    );
    let scale_h = (height + grid_h - 1) / grid_h;
    let scale_w = (width + grid_w - 1) / grid_w;
    Ok(cmp::max(scale_h, scale_w))
}
