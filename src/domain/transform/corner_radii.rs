//! Per-corner radii for rounded-corner transforms.

/// Radii of the four corners of an image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CornerRadii {
    /// Top-left radius.
    pub top_left: f32,
    /// Top-right radius.
    pub top_right: f32,
    /// Bottom-left radius.
    pub bottom_left: f32,
    /// Bottom-right radius.
    pub bottom_right: f32,
}

impl CornerRadii {
    /// Creates radii for each corner. Negative or NaN values become zero.
    #[must_use]
    pub fn new(top_left: f32, top_right: f32, bottom_left: f32, bottom_right: f32) -> Self {
        Self {
            top_left: sanitize_radius(top_left),
            top_right: sanitize_radius(top_right),
            bottom_left: sanitize_radius(bottom_left),
            bottom_right: sanitize_radius(bottom_right),
        }
    }

    /// Creates radii with the same value on every corner.
    #[must_use]
    pub fn uniform(radius: f32) -> Self {
        Self::new(radius, radius, radius, radius)
    }

    /// Returns true if all four corners share one radius.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_uniform(&self) -> bool {
        self.top_left == self.top_right
            && self.top_left == self.bottom_left
            && self.top_left == self.bottom_right
    }

    /// Returns a copy with every radius capped at `max`.
    #[must_use]
    pub fn clamped(&self, max: f32) -> Self {
        let sanitized = self.sanitized();
        Self {
            top_left: sanitized.top_left.min(max),
            top_right: sanitized.top_right.min(max),
            bottom_left: sanitized.bottom_left.min(max),
            bottom_right: sanitized.bottom_right.min(max),
        }
    }

    /// Re-applies the constructor's clean-up; fields are public and may
    /// have been set directly.
    #[must_use]
    pub fn sanitized(&self) -> Self {
        Self::new(self.top_left, self.top_right, self.bottom_left, self.bottom_right)
    }

    /// Cache-safe fragment encoding all four radii.
    pub(crate) fn name_fragment(&self) -> String {
        let radii = self.sanitized();
        if radii.is_uniform() {
            format!("corner_r{}", radii.top_left)
        } else {
            format!(
                "corners_{}_{}_{}_{}",
                radii.top_left, radii.top_right, radii.bottom_left, radii.bottom_right
            )
        }
    }
}

/// Maps negative, NaN and infinite radii to zero.
pub(crate) fn sanitize_radius(radius: f32) -> f32 {
    if radius.is_finite() { radius.max(0.0) } else { 0.0 }
}
