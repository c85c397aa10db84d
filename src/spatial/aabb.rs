use glam::Vec3;

/// An axis-aligned query box, spanned by its low (`start`) and high (`end`)
/// corners.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct AABB {
    pub start: Vec3,
    pub end: Vec3,
}

impl AABB {
    pub fn new(start: Vec3, end: Vec3) -> Self {
        Self { start, end }
    }

    pub fn from_extents(pos: Vec3, extents: Vec3) -> Self {
        let half_extents = extents / 2.0;
        Self {
            start: pos - half_extents,
            end: pos + half_extents,
        }
    }

    /// A well-formed box never starts past its end on any axis.
    pub fn is_valid(&self) -> bool {
        self.start.cmple(self.end).all()
    }

    /// Closed-interval membership on every axis.
    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.start).all() && point.cmple(self.end).all()
    }

    /// Whether the boxes share any volume (touching faces count).
    pub fn intersects(&self, other: AABB) -> bool {
        self.start.cmple(other.end).all() && other.start.cmple(self.end).all()
    }
}

#[test]
fn containment_and_intersection() {
    use glam::vec3;

    let unit = AABB::new(Vec3::ZERO, Vec3::ONE);
    assert!(unit.is_valid());
    assert!(unit.contains(vec3(0.5, 0.5, 0.5)));
    assert!(unit.contains(Vec3::ONE));
    assert!(!unit.contains(vec3(0.5, 1.1, 0.5)));

    let offset = AABB::from_extents(vec3(1.0, 0.5, 0.5), Vec3::ONE);
    assert!(unit.intersects(offset));
    assert!(offset.intersects(unit));

    let far = AABB::new(vec3(5.0, 5.0, 5.0), vec3(6.0, 6.0, 6.0));
    assert!(!unit.intersects(far));

    let inverted = AABB::new(Vec3::ONE, Vec3::ZERO);
    assert!(!inverted.is_valid());
}
