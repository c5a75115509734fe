//! Rectangle-set regions.
//!
//! A `Region` is a list of pairwise-disjoint, non-empty rectangles. The
//! decomposition is not canonical, so equality is semantic: two regions are
//! equal when they cover exactly the same pixels.

use std::ops::{BitAnd, BitOr, Sub};

use strata_ipc::Rect;

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        if !rect.is_empty() {
            region.rects.push(rect);
        }
        region
    }

    /// Build from possibly overlapping rects
    pub fn from_rects<'a>(rects: impl IntoIterator<Item = &'a Rect>) -> Self {
        rects
            .into_iter()
            .fold(Region::new(), |acc, r| acc.union_rect(r))
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn set(&mut self, rect: Rect) {
        *self = Region::from_rect(rect);
    }

    pub fn bounds(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::EMPTY, |acc, r| acc.bounding(r))
    }

    /// Pixel count
    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.rects
            .iter()
            .any(|a| other.rects.iter().any(|b| a.intersects(b)))
    }

    pub fn union_rect(&self, rect: &Rect) -> Region {
        self.union(&Region::from_rect(*rect))
    }

    pub fn union(&self, other: &Region) -> Region {
        let mut out = self.clone();
        out.rects.extend(other.subtract(self).rects);
        out
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let mut out = Region::new();
        for a in &self.rects {
            for b in &other.rects {
                let r = a.intersect(b);
                if !r.is_empty() {
                    out.rects.push(r);
                }
            }
        }
        out
    }

    pub fn intersect_rect(&self, rect: &Rect) -> Region {
        self.intersect(&Region::from_rect(*rect))
    }

    pub fn subtract(&self, other: &Region) -> Region {
        let mut pieces = self.rects.clone();
        for hole in &other.rects {
            if pieces.is_empty() {
                break;
            }
            pieces = pieces.iter().flat_map(|p| p.subtract(hole)).collect();
        }
        Region { rects: pieces }
    }

    pub fn subtract_rect(&self, rect: &Rect) -> Region {
        self.subtract(&Region::from_rect(*rect))
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.offset_by(dx, dy)).collect(),
        }
    }

    pub fn or_self(&mut self, other: &Region) {
        *self = self.union(other);
    }

    pub fn and_self(&mut self, other: &Region) {
        *self = self.intersect(other);
    }

    pub fn subtract_self(&mut self, other: &Region) {
        *self = self.subtract(other);
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area() && self.subtract(other).is_empty()
    }
}

impl Eq for Region {}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Region::from_rect(rect)
    }
}

impl BitOr for &Region {
    type Output = Region;
    fn bitor(self, rhs: &Region) -> Region {
        self.union(rhs)
    }
}

impl BitAnd for &Region {
    type Output = Region;
    fn bitand(self, rhs: &Region) -> Region {
        self.intersect(rhs)
    }
}

impl Sub for &Region {
    type Output = Region;
    fn sub(self, rhs: &Region) -> Region {
        self.subtract(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(l: i32, t: i32, rt: i32, b: i32) -> Region {
        Region::from_rect(Rect::new(l, t, rt, b))
    }

    #[test]
    fn test_union_of_overlapping_rects_counts_pixels_once() {
        let u = &r(0, 0, 10, 10) | &r(5, 5, 15, 15);
        assert_eq!(u.area(), 100 + 100 - 25);
        assert_eq!(u.bounds(), Rect::new(0, 0, 15, 15));
        assert!(u.contains_point(14, 14));
        assert!(!u.contains_point(14, 0));
    }

    #[test]
    fn test_subtract_then_union_restores_region() {
        let full = r(0, 0, 100, 100);
        let hole = r(20, 20, 40, 40);
        let rest = &full - &hole;
        assert_eq!(rest.area(), 10_000 - 400);
        assert!(!rest.intersects(&hole));
        assert_eq!(&rest | &hole, full);
    }

    #[test]
    fn test_equality_ignores_decomposition() {
        let a = &r(0, 0, 10, 5) | &r(0, 5, 10, 10);
        let b = &r(0, 0, 5, 10) | &r(5, 0, 10, 10);
        assert_eq!(a, b);
        assert_ne!(a, r(0, 0, 10, 9));
    }

    #[test]
    fn test_intersect_disjoint_is_empty() {
        let i = &r(0, 0, 10, 10) & &r(10, 0, 20, 10);
        assert!(i.is_empty());
        assert_eq!(i.bounds(), Rect::EMPTY);
    }

    #[test]
    fn test_empty_rect_makes_empty_region() {
        assert!(Region::from_rect(Rect::INVALID).is_empty());
        assert!(Region::from_rect(Rect::new(5, 5, 5, 9)).is_empty());
    }

    #[test]
    fn test_translate() {
        let moved = r(0, 0, 4, 4).translate(10, -2);
        assert_eq!(moved.bounds(), Rect::new(10, -2, 14, 2));
    }
}
