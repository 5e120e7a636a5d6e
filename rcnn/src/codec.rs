//! Conversion between boxes and regression deltas.

use crate::common::*;

/// Relative offset from a source box to a target box.
///
/// `tx`, `ty` are center offsets normalized by the source extent and
/// `tw`, `th` are log-scale ratios of the extents.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegressionDelta {
    pub tx: f32,
    pub ty: f32,
    pub tw: f32,
    pub th: f32,
}

impl RegressionDelta {
    pub fn from_array([tx, ty, tw, th]: [f32; 4]) -> Self {
        Self { tx, ty, tw, th }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.tx, self.ty, self.tw, self.th]
    }

    /// Multiply each coordinate by its factor.
    pub fn scale(&self, factors: [f32; 4]) -> Self {
        let [sx, sy, sw, sh] = factors;
        Self {
            tx: self.tx * sx,
            ty: self.ty * sy,
            tw: self.tw * sw,
            th: self.th * sh,
        }
    }

    /// Divide each coordinate by its factor.
    pub fn unscale(&self, factors: [f32; 4]) -> Self {
        let [sx, sy, sw, sh] = factors;
        Self {
            tx: self.tx / sx,
            ty: self.ty / sy,
            tw: self.tw / sw,
            th: self.th / sh,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|value| value.is_finite())
    }
}

#[derive(Debug, Clone)]
pub struct BoxCodecInit {
    pub max_log_scale: f32,
}

impl Default for BoxCodecInit {
    fn default() -> Self {
        Self {
            max_log_scale: (1000.0f32 / 16.0).ln(),
        }
    }
}

impl BoxCodecInit {
    pub fn build(self) -> Result<BoxCodec> {
        let Self { max_log_scale } = self;
        ensure!(
            max_log_scale.is_finite() && max_log_scale > 0.0,
            "max_log_scale must be a positive finite number, but get {}",
            max_log_scale
        );
        Ok(BoxCodec { max_log_scale })
    }
}

/// Encodes boxes as deltas against a source box and decodes them back.
#[derive(Debug, Clone, Copy)]
pub struct BoxCodec {
    max_log_scale: f32,
}

impl BoxCodec {
    pub fn max_log_scale(&self) -> f32 {
        self.max_log_scale
    }

    /// Compute the delta that moves `source` onto `target`.
    ///
    /// Returns `None` if either box is degenerate.
    pub fn encode<S, T>(&self, source: &S, target: &T) -> Option<RegressionDelta>
    where
        S: Rect<Type = f32>,
        T: Rect<Type = f32>,
    {
        if source.is_degenerate() || target.is_degenerate() {
            return None;
        }

        let delta = RegressionDelta {
            tx: (target.cx() - source.cx()) / source.w(),
            ty: (target.cy() - source.cy()) / source.h(),
            tw: (target.w() / source.w()).ln(),
            th: (target.h() / source.h()).ln(),
        };
        delta.is_finite().then(|| delta)
    }

    /// Apply a delta to `source`.
    ///
    /// The log-scale terms are clamped to `max_log_scale` before exponentiation.
    /// Returns `None` if the source is degenerate or the result is not a
    /// finite non-degenerate box.
    pub fn decode<S>(&self, source: &S, delta: &RegressionDelta) -> Option<XYWH<f32>>
    where
        S: Rect<Type = f32>,
    {
        if source.is_degenerate() || !delta.is_finite() {
            return None;
        }

        let cx = delta.tx * source.w() + source.cx();
        let cy = delta.ty * source.h() + source.cy();
        let w = delta.tw.min(self.max_log_scale).exp() * source.w();
        let h = delta.th.min(self.max_log_scale).exp() * source.h();

        let rect = XYWH::try_from_cxcywh([cx, cy, w, h]).ok()?;
        (!rect.is_degenerate() && rect.x().is_finite() && rect.y().is_finite()).then(|| rect)
    }
}

impl Default for BoxCodec {
    fn default() -> Self {
        Self {
            max_log_scale: BoxCodecInit::default().max_log_scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rect(xywh: [f32; 4]) -> XYWH<f32> {
        XYWH::try_from_xywh(xywh).unwrap()
    }

    #[test]
    fn encode_then_decode_reproduces_target() {
        let codec = BoxCodec::default();
        let pairs = [
            ([0.0, 0.0, 4.0, 4.0], [1.0, 2.0, 3.0, 5.0]),
            ([10.5, 3.25, 1.5, 8.0], [9.0, 4.0, 6.0, 2.0]),
            ([2.0, 2.0, 0.5, 0.5], [0.0, 0.0, 20.0, 16.0]),
            ([5.0, 5.0, 2.0, 2.0], [5.0, 5.0, 2.0, 2.0]),
        ];

        for (source, target) in pairs {
            let source = rect(source);
            let target = rect(target);
            let delta = codec.encode(&source, &target).unwrap();
            let decoded = codec.decode(&source, &delta).unwrap();

            izip!(decoded.xywh(), target.xywh()).for_each(|(lhs, rhs)| {
                assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
            });
        }
    }

    #[test]
    fn random_encode_then_decode_round_trip() {
        let codec = BoxCodec::default();
        let mut rng = StdRng::seed_from_u64(23);
        let mut random_rect = || {
            rect([
                rng.gen_range(-20.0..50.0),
                rng.gen_range(-20.0..50.0),
                rng.gen_range(1.0..30.0),
                rng.gen_range(1.0..30.0),
            ])
        };

        for _ in 0..1000 {
            let source = random_rect();
            let target = random_rect();
            let delta = codec.encode(&source, &target).unwrap();
            assert!(delta.is_finite());
            let decoded = codec.decode(&source, &delta).unwrap();

            izip!(decoded.xywh(), target.xywh()).for_each(|(lhs, rhs)| {
                assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-4);
            });
        }
    }

    #[test]
    fn identical_boxes_encode_to_zero() {
        let codec = BoxCodec::default();
        let source = rect([3.0, 1.0, 2.0, 6.0]);
        let delta = codec.encode(&source, &source).unwrap();
        assert_eq!(delta, RegressionDelta::default());
    }

    #[test]
    fn degenerate_source_is_rejected() {
        let codec = BoxCodec::default();
        let flat = rect([0.0, 0.0, 0.0, 3.0]);
        let good = rect([0.0, 0.0, 3.0, 3.0]);
        assert!(codec.encode(&flat, &good).is_none());
        assert!(codec.encode(&good, &flat).is_none());
        assert!(codec.decode(&flat, &RegressionDelta::default()).is_none());
    }

    #[test]
    fn decode_clamps_log_scale() {
        let codec = BoxCodecInit { max_log_scale: 2.0 }.build().unwrap();
        let source = rect([0.0, 0.0, 1.0, 1.0]);
        let delta = RegressionDelta::from_array([0.0, 0.0, 100.0, 1000.0]);
        let decoded = codec.decode(&source, &delta).unwrap();
        assert_abs_diff_eq!(decoded.w(), 2f32.exp(), epsilon = 1e-4);
        assert_abs_diff_eq!(decoded.h(), 2f32.exp(), epsilon = 1e-4);
    }

    #[test]
    fn scale_and_unscale() {
        let delta = RegressionDelta::from_array([0.5, -0.25, 0.1, 0.2]);
        let factors = [8.0, 8.0, 4.0, 4.0];
        let scaled = delta.scale(factors);
        assert_eq!(scaled.to_array(), [4.0, -2.0, 0.4, 0.8]);
        let restored = scaled.unscale(factors);
        izip!(restored.to_array(), delta.to_array())
            .for_each(|(lhs, rhs)| assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-6));
    }
}
