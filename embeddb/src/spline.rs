//! Online greedy piecewise-linear index
//!
//! Maps a key to an estimated physical page plus a bounded error corridor,
//! using the GreedySplineCorridor construction from "Smooth interpolating
//! histograms with error guarantees" (Neumann & Michel, BNCOD'08).
//!
//! Points live in a ring of `size` slots. The most recent point is
//! provisional: it tracks the newest page so lookups stay accurate, and is
//! replaced on the next `add` unless the corridor broke and it was committed.
//! When the data ring reclaims old pages, `clean` drops the points that
//! reference them.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// One `(key, page)` anchor on the piecewise-linear function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SplinePoint {
    pub key: u64,
    pub page: u32,
}

/// Cross-product test: is the ray `(x1, y1)` counter-clockwise of `(x2, y2)`?
///
/// X differences are unsigned 64-bit, Y differences signed; the products are
/// taken in 128 bits so 8-byte keys cannot overflow.
fn is_left(x1: u64, y1: i64, x2: u64, y2: i64) -> bool {
    y1 as i128 * x2 as i128 > y2 as i128 * x1 as i128
}

/// Mirror of [`is_left`]: clockwise.
fn is_right(x1: u64, y1: i64, x2: u64, y2: i64) -> bool {
    (y1 as i128 * x2 as i128) < y2 as i128 * x1 as i128
}

pub(crate) struct Spline {
    points: Vec<SplinePoint>,
    size: usize,
    count: usize,
    start: usize,
    /// Points evicted per overflow.
    erase_batch: usize,
    max_error: u32,
    last_key: u64,
    last_page: u32,
    /// First point ever added, kept for wrap-around estimates after eviction.
    first_point: SplinePoint,
    lower: SplinePoint,
    upper: SplinePoint,
    temp_last_point: bool,
    add_calls: u32,
}

impl Spline {
    pub fn new(size: usize, max_error: u32) -> Self {
        let mut points = Vec::new();
        points.resize(size, SplinePoint::default());
        Self {
            points,
            size,
            count: 0,
            start: 0,
            erase_batch: 1,
            max_error,
            last_key: 0,
            last_page: 0,
            first_point: SplinePoint::default(),
            lower: SplinePoint::default(),
            upper: SplinePoint::default(),
            temp_last_point: false,
            add_calls: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn max_error(&self) -> u32 {
        self.max_error
    }

    /// The `i`-th live point, oldest first.
    pub fn point(&self, i: usize) -> SplinePoint {
        self.points[(i + self.start) % self.size]
    }

    fn set_point(&mut self, i: usize, p: SplinePoint) {
        let at = (i + self.start) % self.size;
        self.points[at] = p;
    }

    /// Record that `page` starts at `key`. Keys must be non-decreasing;
    /// duplicates of the previous key are ignored.
    pub fn add(&mut self, key: u64, page: u32) {
        self.add_calls += 1;

        if self.add_calls == 1 {
            let p = SplinePoint { key, page };
            self.set_point(0, p);
            self.first_point = p;
            self.count = 1;
            self.last_key = key;
            return;
        }

        if self.add_calls == 2 {
            self.lower = SplinePoint {
                key,
                page: page.saturating_sub(self.max_error),
            };
            self.upper = SplinePoint {
                key,
                page: page + self.max_error,
            };
            self.last_key = key;
            self.last_page = page;
        }

        if key <= self.last_key && self.add_calls != 2 {
            return;
        }

        // The provisional trailing point is superseded by this call.
        if self.temp_last_point {
            self.count -= 1;
        }

        let anchor = self.point(self.count - 1);
        let xdiff = key - anchor.key;
        let ydiff = (page - anchor.page) as i64;
        let upper_xdiff = self.upper.key - anchor.key;
        let upper_ydiff = self.upper.page as i64 - anchor.page as i64;
        let lower_xdiff = self.lower.key - anchor.key;
        let lower_ydiff = self.lower.page as i64 - anchor.page as i64;

        if self.count >= self.size {
            let _ = self.erase(self.erase_batch);
        }

        if is_left(xdiff, ydiff, upper_xdiff, upper_ydiff)
            || is_right(xdiff, ydiff, lower_xdiff, lower_ydiff)
        {
            // The ray to the new point exits the corridor: the previous
            // point becomes permanent and the corridor restarts here.
            let committed = SplinePoint {
                key: self.last_key,
                page: self.last_page,
            };
            let at = self.count;
            self.set_point(at, committed);
            self.count += 1;
            self.temp_last_point = false;

            self.lower = SplinePoint {
                key,
                page: page.saturating_sub(self.max_error),
            };
            self.upper = SplinePoint {
                key,
                page: page + self.max_error,
            };

            if self.count >= self.size {
                let _ = self.erase(self.erase_batch);
            }
        } else {
            // Still inside: tighten whichever corridor edge the new point
            // constrains.
            let new_upper_y = (page + self.max_error) as i64 - anchor.page as i64;
            if is_left(upper_xdiff, upper_ydiff, xdiff, new_upper_y) {
                self.upper = SplinePoint {
                    key,
                    page: page + self.max_error,
                };
            }

            let new_lower_y = page.saturating_sub(self.max_error) as i64 - anchor.page as i64;
            if is_right(lower_xdiff, lower_ydiff, xdiff, new_lower_y) {
                self.lower = SplinePoint {
                    key,
                    page: page.saturating_sub(self.max_error),
                };
            }
        }

        self.last_page = page;
        self.last_key = key;

        // Provisional point so lookups cover everything up to `key`.
        let at = self.count;
        self.set_point(
            at,
            SplinePoint {
                key,
                page,
            },
        );
        self.count += 1;
        self.temp_last_point = true;
    }

    /// Drop the `n` oldest points. Refuses to leave exactly one point;
    /// dropping every point resets the spline.
    pub fn erase(&mut self, n: usize) -> Result<(), ()> {
        if n > self.count || self.count - n == 1 {
            return Err(());
        }
        if n == 0 {
            return Ok(());
        }
        self.count -= n;
        self.start = (self.start + n) % self.size;
        if self.count == 0 {
            self.add_calls = 0;
            self.temp_last_point = false;
        }
        Ok(())
    }

    /// Drop points for pages below `min_page` (reclaimed by ring wrap),
    /// keeping at least two points. Returns the number of points dropped.
    pub fn clean(&mut self, min_page: u32) -> usize {
        let mut n = 0;
        while n < self.count && self.point(n).page < min_page {
            n += 1;
        }
        if self.count - n < 2 {
            n = self.count.saturating_sub(2);
        }
        if n == 0 {
            return 0;
        }
        match self.erase(n) {
            Ok(()) => n,
            Err(()) => 0,
        }
    }

    /// Bulk-build from a sorted key set, one page per key.
    #[allow(dead_code)]
    pub fn build(&mut self, keys: &[u64], max_error: u32) {
        self.max_error = max_error;
        for (page, key) in keys.iter().enumerate() {
            self.add(*key, page as u32);
        }
    }

    /// Index of the point closing the segment that brackets `key`.
    fn segment_above(&self, key: u64) -> usize {
        let mut low = 0i32;
        let mut high = self.count as i32 - 1;
        while high >= low {
            let mid = low + (high - low) / 2;
            if mid == 0 {
                // low = 0, high = 1: a single segment, return its upper end.
                return 1;
            }
            let p = self.point(mid as usize);
            let below = self.point(mid as usize - 1);
            if p.key >= key && below.key <= key {
                return mid as usize;
            }
            if p.key > key {
                high = mid - 1;
            } else {
                low = mid + 1;
            }
        }
        let mid = low + (high - low) / 2;
        if mid >= high { high.max(0) as usize } else { low.max(0) as usize }
    }

    /// Estimate the page holding `key`: `(estimate, low, high)`.
    pub fn find(&self, key: u64) -> (u32, u32, u32) {
        let smallest = self.point(0);
        let largest = self.point(self.count - 1);

        if key < smallest.key || self.count <= 1 {
            // Below everything on record: bracket between the first point
            // ever seen and the oldest point still held.
            let low = self.first_point.page;
            let high = smallest.page;
            return (low.midpoint(high), low, high);
        }
        if key > largest.key {
            return (largest.page, largest.page, largest.page);
        }

        let idx = self.segment_above(key);
        let down = self.point(idx - 1);
        let up = self.point(idx);

        // keydiff * slope + base, in integers
        let estimate = down.page
            + ((key - down.key) as u128 * (up.page - down.page) as u128
                / (up.key - down.key) as u128) as u32;

        let low = estimate.saturating_sub(self.max_error);
        let high = (estimate + self.max_error).min(largest.page);
        (estimate, low, high)
    }
}

impl core::fmt::Debug for Spline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_list();
        for i in 0..self.count {
            let p = self.point(i);
            list.entry(&(p.key, p.page));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_keys_stay_two_points() {
        let mut spl = Spline::new(16, 2);
        for page in 0..100u32 {
            spl.add(page as u64 * 10, page);
        }
        // One committed anchor plus the provisional tail.
        assert!(spl.len() <= 3);
        let (est, _, _) = spl.find(500);
        assert_eq!(est, 50);
    }

    #[test]
    fn estimates_stay_inside_error_bound() {
        let max_error = 2;
        let mut spl = Spline::new(64, max_error);
        // Piecewise slopes so the corridor breaks several times.
        let mut key = 0u64;
        let mut pages = Vec::new();
        for page in 0..200u32 {
            key += 1 + (page as u64 / 25) % 4;
            spl.add(key, page);
            pages.push((key, page));
        }
        for (key, page) in pages {
            let (est, low, high) = spl.find(key);
            let err = (est as i64 - page as i64).abs();
            assert!(err <= max_error as i64, "estimate {est} for page {page}");
            assert!(low <= page && page <= high);
        }
    }

    #[test]
    fn duplicate_keys_are_skipped() {
        let mut spl = Spline::new(8, 1);
        spl.add(10, 0);
        spl.add(20, 1);
        let len = spl.len();
        spl.add(20, 2);
        assert_eq!(spl.len(), len);
    }

    #[test]
    fn keys_outside_range_clamp() {
        let mut spl = Spline::new(8, 1);
        for page in 0..10u32 {
            spl.add(100 + page as u64 * 7, page);
        }
        let largest = spl.point(spl.len() - 1);
        let (est, low, high) = spl.find(10_000);
        assert_eq!((est, low, high), (largest.page, largest.page, largest.page));

        let (_, low, high) = spl.find(5);
        assert_eq!(low, 0);
        assert_eq!(high, spl.point(0).page);
    }

    #[test]
    fn erase_refuses_leaving_one_point() {
        let mut spl = Spline::new(8, 1);
        let mut key = 0;
        for page in 0..5u32 {
            key += 1 + page as u64 * 3;
            spl.add(key, page);
        }
        let len = spl.len();
        assert!(spl.erase(len - 1).is_err());
        assert!(spl.erase(len - 2).is_ok());
        assert_eq!(spl.len(), 2);
    }

    #[test]
    fn ring_overflow_evicts_oldest() {
        let mut spl = Spline::new(4, 0);
        // max_error 0 commits a point on nearly every slope change.
        let mut key = 0u64;
        for page in 0..50u32 {
            key += 1 + (page as u64 % 5);
            spl.add(key, page);
        }
        assert!(spl.len() <= 4);
        // Newest pages still resolvable.
        let (est, _, high) = spl.find(key);
        assert!(est <= 49 && high <= 49);
    }

    #[test]
    fn clean_drops_reclaimed_pages_keeping_two() {
        let mut spl = Spline::new(32, 0);
        let mut key = 0u64;
        for page in 0..30u32 {
            key += 1 + (page as u64 % 3);
            spl.add(key, page);
        }
        spl.clean(20);
        assert!(spl.len() >= 2);
        for i in 0..spl.len() {
            assert!(spl.point(i).page >= 20);
        }

        // Cleaning past everything keeps the two newest points.
        spl.clean(1000);
        assert_eq!(spl.len(), 2);
    }

    #[test]
    fn build_matches_incremental_adds() {
        let keys: Vec<u64> = (0..40).map(|i| i * 3 + (i % 3)).collect();
        let mut built = Spline::new(64, 1);
        built.build(&keys, 1);
        for (page, key) in keys.iter().enumerate() {
            let (est, _, _) = built.find(*key);
            assert!((est as i64 - page as i64).abs() <= 1);
        }
    }
}
