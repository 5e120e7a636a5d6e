pub use anyhow::{ensure, Result};
pub use num_traits::{Float, Num, One, Zero};
pub use std::ops::{Mul, Neg};
