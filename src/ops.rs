// src/ops.rs
//
// Image transforms and load masks.
// Transforms are cheap values: the pixel work happens only in apply().

use bitflags::bitflags;
use image::DynamicImage;

bitflags! {
    /// Which parts of an image a load should make available.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataMask: u32 {
        /// Decoded pixels
        const IMAGE = 0b0001;
        /// Width and height only
        const DIMENSION = 0b0010;
        /// EXIF metadata
        const EXIF = 0b0100;
        /// XMP metadata
        const XMP = 0b1000;
        const ALL = Self::IMAGE.bits()
            | Self::DIMENSION.bits()
            | Self::EXIF.bits()
            | Self::XMP.bits();
    }
}

/// The eight axis-aligned affine maps of a raster onto itself.
///
/// Rotations are clockwise in screen coordinates (y grows downwards).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transform {
    Identity,
    Rotate90,
    Rotate180,
    Rotate270,
    FlipHorizontal,
    FlipVertical,
    /// Mirror across the top-left to bottom-right diagonal
    Transpose,
    /// Mirror across the top-right to bottom-left diagonal
    Transverse,
}

/// 2x2 integer matrix acting on centered pixel coordinates.
type Matrix = [[i8; 2]; 2];

impl Transform {
    pub const ALL: [Transform; 8] = [
        Transform::Identity,
        Transform::Rotate90,
        Transform::Rotate180,
        Transform::Rotate270,
        Transform::FlipHorizontal,
        Transform::FlipVertical,
        Transform::Transpose,
        Transform::Transverse,
    ];

    fn matrix(self) -> Matrix {
        match self {
            Transform::Identity => [[1, 0], [0, 1]],
            Transform::Rotate90 => [[0, -1], [1, 0]],
            Transform::Rotate180 => [[-1, 0], [0, -1]],
            Transform::Rotate270 => [[0, 1], [-1, 0]],
            Transform::FlipHorizontal => [[-1, 0], [0, 1]],
            Transform::FlipVertical => [[1, 0], [0, -1]],
            Transform::Transpose => [[0, 1], [1, 0]],
            Transform::Transverse => [[0, -1], [-1, 0]],
        }
    }

    fn from_matrix(m: Matrix) -> Transform {
        Transform::ALL
            .into_iter()
            .find(|t| t.matrix() == m)
            // The eight matrices are closed under multiplication and transposition.
            .unwrap_or(Transform::Identity)
    }

    /// Map an EXIF Orientation value (1-8) to the transform that displays
    /// the stored pixels upright. Out-of-range values yield `None`.
    pub fn from_exif_orientation(orientation: u16) -> Option<Transform> {
        match orientation {
            1 => Some(Transform::Identity),
            2 => Some(Transform::FlipHorizontal),
            3 => Some(Transform::Rotate180),
            4 => Some(Transform::FlipVertical),
            5 => Some(Transform::Transpose),
            6 => Some(Transform::Rotate90),
            7 => Some(Transform::Transverse),
            8 => Some(Transform::Rotate270),
            _ => None,
        }
    }

    pub fn is_identity(self) -> bool {
        self == Transform::Identity
    }

    /// True when the transform exchanges width and height.
    pub fn swaps_axes(self) -> bool {
        matches!(
            self,
            Transform::Rotate90 | Transform::Rotate270 | Transform::Transpose | Transform::Transverse
        )
    }

    pub fn transformed_size(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// The transform equivalent to applying `self` first, then `next`.
    pub fn compose(self, next: Transform) -> Transform {
        let a = self.matrix();
        let b = next.matrix();
        let mut out = [[0i8; 2]; 2];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = b[i][0] * a[0][j] + b[i][1] * a[1][j];
            }
        }
        Transform::from_matrix(out)
    }

    /// The inverse transform. All eight matrices are orthogonal, so the
    /// inverse is the transposed matrix.
    pub fn reverse(self) -> Transform {
        let m = self.matrix();
        Transform::from_matrix([[m[0][0], m[1][0]], [m[0][1], m[1][1]]])
    }

    pub fn apply(self, img: &DynamicImage) -> DynamicImage {
        match self {
            Transform::Identity => img.clone(),
            Transform::Rotate90 => img.rotate90(),
            Transform::Rotate180 => img.rotate180(),
            Transform::Rotate270 => img.rotate270(),
            Transform::FlipHorizontal => img.fliph(),
            Transform::FlipVertical => img.flipv(),
            Transform::Transpose => img.rotate90().fliph(),
            Transform::Transverse => img.rotate270().fliph(),
        }
    }
}
