pub use anyhow::{bail, ensure, Context as _, Result};
pub use approx::abs_diff_eq;
pub use bbox::{prelude::*, Transform, WH, XYWH};
pub use getset::{CopyGetters, Getters};
pub use itertools::{izip, Itertools as _};
pub use label::Label;
pub use log::{debug, info, warn};
pub use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    cmp::{self, Ordering, Reverse},
    collections::HashSet,
    iter,
    path::Path,
    sync::Arc,
};

/// A ground-truth box in feature-map units annotated with its class index.
pub type GroundTruth = Label<XYWH<f32>, usize>;
