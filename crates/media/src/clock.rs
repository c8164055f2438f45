use mirror_common::Tick;

/// Number of points kept by the estimator. Must be even: the points are
/// split into two halves whose centroids define the slope.
const RANGE: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
struct Point {
    system: i64,
    stream: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PointSum {
    system: i64,
    stream: i64,
}

impl PointSum {
    fn add(&mut self, p: Point) {
        self.system += p.system;
        self.stream += p.stream;
    }

    fn sub(&mut self, p: Point) {
        self.system -= p.system;
        self.stream -= p.stream;
    }
}

/// Estimates the affine relation between the device stream clock (PTS) and
/// the local monotonic clock:
///
/// ```text
/// system = slope * stream + offset
/// ```
///
/// A full rolling linear regression would be heavier for no benefit; the
/// centroid of each half averages RANGE/2 points, which is already robust
/// to short-term jitter, and an update costs only a few integer
/// additions.
#[derive(Debug)]
pub struct Clock {
    points: [Point; RANGE],
    /// Next slot to write (the oldest point when the ring is full).
    head: usize,
    count: usize,
    /// Number of points in the older (left) half: count / 2.
    left_count: usize,
    left: PointSum,
    right: PointSum,
    slope: f64,
    offset: f64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        const { assert!(RANGE % 2 == 0) };

        Self {
            points: [Point::default(); RANGE],
            head: 0,
            count: 0,
            left_count: 0,
            left: PointSum::default(),
            right: PointSum::default(),
            slope: 0.0,
            offset: 0.0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn update(&mut self, system: Tick, stream: Tick) {
        let point = Point {
            system: system.as_micros(),
            stream: stream.as_micros(),
        };

        if self.count == RANGE {
            // The evicted point is the oldest of the left half; the oldest
            // point of the right half moves over to keep the halves
            // balanced.
            let evicted = self.points[self.head];
            self.left.sub(evicted);

            let mid = (self.head + RANGE / 2) % RANGE;
            let mid_point = self.points[mid];
            self.left.add(mid_point);
            self.right.sub(mid_point);
        } else {
            // Growth phase: the new point joins the right half; whenever
            // the count becomes even, the oldest right point is promoted so
            // that the left half always holds count / 2 points.
            self.count += 1;
            if self.count % 2 == 0 && self.count > 1 {
                let right_oldest =
                    (self.head + 2 * RANGE - (self.count - 1) + self.left_count) % RANGE;
                let p = self.points[right_oldest];
                self.left.add(p);
                self.right.sub(p);
                self.left_count += 1;
            }
        }

        self.points[self.head] = point;
        self.right.add(point);
        self.head = (self.head + 1) % RANGE;

        if self.count >= 2 {
            let left_n = self.left_count as f64;
            let right_n = (self.count - self.left_count) as f64;

            let left_avg_system = self.left.system as f64 / left_n;
            let left_avg_stream = self.left.stream as f64 / left_n;
            let right_avg_system = self.right.system as f64 / right_n;
            let right_avg_stream = self.right.stream as f64 / right_n;

            self.slope =
                (right_avg_system - left_avg_system) / (right_avg_stream - left_avg_stream);

            let total_system = (self.left.system + self.right.system) as f64;
            let total_stream = (self.left.stream + self.right.stream) as f64;
            self.offset = (total_system - self.slope * total_stream) / self.count as f64;
        }
    }

    /// Convert a stream time to an estimated system time.
    ///
    /// Must not be called before two points have been recorded.
    pub fn to_system_time(&self, stream: Tick) -> Tick {
        debug_assert!(self.count >= 2);
        Tick::from_micros((self.slope * stream.as_micros() as f64 + self.offset).round() as i64)
    }
}
