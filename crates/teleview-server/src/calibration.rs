//! Per-camera calibration and its wire marshalling.
//!
//! Every client receives, per camera: the color and depth projection
//! matrices (row-major 4x4, `f64`) and the extrinsic camera pose packed as
//! translation, rotation quaternion, and uniform scale. The byte layout
//! here is the wire contract; [`Calibration::write_to`] is the single
//! place that defines it, and the tests pin it byte for byte.

use std::io::Write;

use serde::{Deserialize, Serialize};

/// Intrinsic projections and extrinsic pose of one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Row-major 4x4 projection for the color stream.
    pub color_projection: [f64; 16],
    /// Row-major 4x4 projection for the depth stream.
    pub depth_projection: [f64; 16],
    pub extrinsic: Extrinsic,
}

/// Rigid pose of a camera in the shared capture space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Extrinsic {
    pub translation: [f64; 3],
    /// Rotation quaternion as (x, y, z, w).
    pub rotation: [f64; 4],
    /// Uniform scale factor.
    pub scale: f64,
}

const IDENTITY: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

impl Default for Calibration {
    fn default() -> Self {
        Self {
            color_projection: IDENTITY,
            depth_projection: IDENTITY,
            extrinsic: Extrinsic::default(),
        }
    }
}

impl Default for Extrinsic {
    fn default() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: 1.0,
        }
    }
}

impl Calibration {
    /// Bytes this structure occupies on the wire.
    pub const WIRE_SIZE: usize = (16 + 16 + 3 + 4 + 1) * 8;

    /// Marshal in wire order: color projection, depth projection,
    /// translation, rotation, scale; every scalar native-order `f64`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for value in self
            .color_projection
            .iter()
            .chain(self.depth_projection.iter())
            .chain(self.extrinsic.translation.iter())
            .chain(self.extrinsic.rotation.iter())
            .chain(std::iter::once(&self.extrinsic.scale))
        {
            writer.write_all(&value.to_ne_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_matches_layout() {
        let mut bytes = Vec::new();
        Calibration::default().write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), Calibration::WIRE_SIZE);
    }

    #[test]
    fn wire_layout_is_field_order() {
        let calibration = Calibration {
            color_projection: std::array::from_fn(|i| i as f64),
            depth_projection: std::array::from_fn(|i| 100.0 + i as f64),
            extrinsic: Extrinsic {
                translation: [1.5, 2.5, 3.5],
                rotation: [0.1, 0.2, 0.3, 0.4],
                scale: 9.0,
            },
        };
        let mut bytes = Vec::new();
        calibration.write_to(&mut bytes).unwrap();

        let scalar = |index: usize| {
            f64::from_ne_bytes(bytes[index * 8..(index + 1) * 8].try_into().unwrap())
        };
        assert_eq!(scalar(0), 0.0);
        assert_eq!(scalar(15), 15.0);
        assert_eq!(scalar(16), 100.0);
        assert_eq!(scalar(32), 1.5);
        assert_eq!(scalar(35), 0.1);
        assert_eq!(scalar(39), 9.0);
    }
}
