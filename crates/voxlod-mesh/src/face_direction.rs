//! The six axis-aligned face directions.

/// Direction a quad faces.
///
/// The discriminant is the 3-bit face code stored in [`crate::Quad`] and read
/// by the GPU shaders, so the order is part of the data format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FaceDirection {
    /// −Y (down).
    NegY = 0,
    /// +Y (up).
    PosY = 1,
    /// −Z (north).
    NegZ = 2,
    /// +Z (south).
    PosZ = 3,
    /// −X (west).
    NegX = 4,
    /// +X (east).
    PosX = 5,
}

impl FaceDirection {
    /// All six directions in face-code order.
    pub const ALL: [FaceDirection; 6] = [
        Self::NegY,
        Self::PosY,
        Self::NegZ,
        Self::PosZ,
        Self::NegX,
        Self::PosX,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// `(normal_axis, u_axis, v_axis)` with 0=X, 1=Y, 2=Z.
    ///
    /// A quad's width runs along `u_axis` and its height along `v_axis`.
    pub fn sweep_axes(self) -> (usize, usize, usize) {
        match self {
            Self::NegY | Self::PosY => (1, 0, 2),
            Self::NegZ | Self::PosZ => (2, 0, 1),
            Self::NegX | Self::PosX => (0, 2, 1),
        }
    }

    /// True for the +X/+Y/+Z faces.
    pub fn is_positive(self) -> bool {
        matches!(self, Self::PosX | Self::PosY | Self::PosZ)
    }

    /// Step toward the neighbour this face looks at.
    pub fn step(self) -> [i32; 3] {
        match self {
            Self::NegY => [0, -1, 0],
            Self::PosY => [0, 1, 0],
            Self::NegZ => [0, 0, -1],
            Self::PosZ => [0, 0, 1],
            Self::NegX => [-1, 0, 0],
            Self::PosX => [1, 0, 0],
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::NegY => Self::PosY,
            Self::PosY => Self::NegY,
            Self::NegZ => Self::PosZ,
            Self::PosZ => Self::NegZ,
            Self::NegX => Self::PosX,
            Self::PosX => Self::NegX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for (i, face) in FaceDirection::ALL.into_iter().enumerate() {
            assert_eq!(face.code() as usize, i);
            assert_eq!(FaceDirection::from_code(face.code()), Some(face));
        }
        assert_eq!(FaceDirection::from_code(6), None);
    }

    #[test]
    fn test_opposite_negates_step() {
        for face in FaceDirection::ALL {
            let [a, b, c] = face.step();
            assert_eq!(face.opposite().step(), [-a, -b, -c]);
            assert_ne!(face.is_positive(), face.opposite().is_positive());
        }
    }

    #[test]
    fn test_sweep_axes_are_a_permutation() {
        for face in FaceDirection::ALL {
            let (n, u, v) = face.sweep_axes();
            let mut axes = [n, u, v];
            axes.sort_unstable();
            assert_eq!(axes, [0, 1, 2]);
            assert_ne!(face.step()[n], 0);
        }
    }
}
