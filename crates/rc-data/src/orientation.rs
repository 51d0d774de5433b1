//! Quaternion to Euler conversions.

/// Unit quaternion with scalar part `w` (`QUAT_C` in telemetry).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

/// Roll, pitch and yaw in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl EulerAngles {
    pub fn to_degrees(self) -> Self {
        Self {
            roll: self.roll.to_degrees(),
            pitch: self.pitch.to_degrees(),
            yaw: self.yaw.to_degrees(),
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.roll, self.pitch, self.yaw]
    }

    /// Total inclination from level, `|2 acos(cos(r/2) cos(p/2))|`.
    pub fn tilt(&self) -> f64 {
        (2.0 * ((self.roll / 2.0).cos() * (self.pitch / 2.0).cos()).clamp(-1.0, 1.0).acos()).abs()
    }
}

impl Quaternion {
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn from_options(x: Option<f64>, y: Option<f64>, z: Option<f64>, w: Option<f64>) -> Option<Self> {
        Some(Self::new(x?, y?, z?, w?))
    }

    pub fn normalized(self) -> Option<Self> {
        let norm = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return None;
        }
        Some(Self::new(self.x / norm, self.y / norm, self.z / norm, self.w / norm))
    }

    /// Rover-to-world roll/pitch/yaw as reported by the flight telemetry.
    pub fn rover_euler(&self) -> EulerAngles {
        let Self { x, y, z, w } = *self;
        EulerAngles {
            roll: (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y)),
            pitch: (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin(),
            yaw: (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z)),
        }
    }

    /// Intrinsic X-Y-Z sequence, the convention the simulator comparison uses.
    ///
    /// Returns `None` for a zero or non-finite quaternion.
    pub fn intrinsic_xyz(&self) -> Option<EulerAngles> {
        let Self { x, y, z, w } = self.normalized()?;
        let r00 = 1.0 - 2.0 * (y * y + z * z);
        let r01 = 2.0 * (x * y - z * w);
        let r02 = 2.0 * (x * z + y * w);
        let r12 = 2.0 * (y * z - x * w);
        let r22 = 1.0 - 2.0 * (x * x + y * y);
        Some(EulerAngles {
            roll: (-r12).atan2(r22),
            pitch: r02.clamp(-1.0, 1.0).asin(),
            yaw: (-r01).atan2(r00),
        })
    }
}
