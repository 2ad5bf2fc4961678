//! Planar geometry over pixel-space polygons.
//!
//! Polygons are plain vertex lists (`[x, y]` pairs, implicitly closed). Peak
//! polygons come out of [`convex_hull`] in counter-clockwise order, but none of
//! the predicates here depend on orientation.

pub type Point = [f64; 2];
pub type Polygon = Vec<Point>;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
	X,
	Y,
}

impl Axis {
	#[must_use]
	pub const fn index(self) -> usize {
		match self {
			Self::X => 0,
			Self::Y => 1,
		}
	}
}

/// Which side of a cutoff line a clipped polygon keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
	Below,
	Above,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
	pub min_x: f64,
	pub min_y: f64,
	pub max_x: f64,
	pub max_y: f64,
}

impl Bounds {
	#[must_use]
	pub fn of(points: &[Point]) -> Option<Self> {
		let first = points.first()?;
		let mut bounds = Self { min_x: first[0], min_y: first[1], max_x: first[0], max_y: first[1] };
		for point in &points[1..] {
			bounds.min_x = bounds.min_x.min(point[0]);
			bounds.min_y = bounds.min_y.min(point[1]);
			bounds.max_x = bounds.max_x.max(point[0]);
			bounds.max_y = bounds.max_y.max(point[1]);
		}
		Some(bounds)
	}

	#[must_use]
	pub const fn range(&self, axis: Axis) -> (f64, f64) {
		match axis {
			Axis::X => (self.min_x, self.max_x),
			Axis::Y => (self.min_y, self.max_y),
		}
	}

	/// Euclidean gap between two boxes, zero when they overlap.
	#[must_use]
	pub fn gap(&self, other: &Self) -> f64 {
		let dx = (other.min_x - self.max_x).max(self.min_x - other.max_x).max(0.0);
		let dy = (other.min_y - self.max_y).max(self.min_y - other.max_y).max(0.0);
		dx.hypot(dy)
	}

	/// Lower bound on the distance from `point` to anything inside the box.
	#[must_use]
	pub fn distance_to(&self, point: Point) -> f64 {
		let dx = (self.min_x - point[0]).max(point[0] - self.max_x).max(0.0);
		let dy = (self.min_y - point[1]).max(point[1] - self.max_y).max(0.0);
		dx.hypot(dy)
	}

	#[must_use]
	pub fn contains(&self, point: Point) -> bool {
		point[0] >= self.min_x - EPSILON
			&& point[0] <= self.max_x + EPSILON
			&& point[1] >= self.min_y - EPSILON
			&& point[1] <= self.max_y + EPSILON
	}
}

fn cross(origin: Point, a: Point, b: Point) -> f64 {
	(a[0] - origin[0]).mul_add(b[1] - origin[1], -((a[1] - origin[1]) * (b[0] - origin[0])))
}

#[must_use]
pub fn distance(a: Point, b: Point) -> f64 {
	(a[0] - b[0]).hypot(a[1] - b[1])
}

/// Convex hull (Andrew's monotone chain). Duplicate and non-finite points are
/// dropped; fewer than three distinct points come back as-is.
#[must_use]
pub fn convex_hull(points: &[Point]) -> Polygon {
	let mut sorted: Vec<Point> = points.iter().copied().filter(|p| p[0].is_finite() && p[1].is_finite()).collect();
	sorted.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
	sorted.dedup();

	if sorted.len() < 3 {
		return sorted;
	}

	let mut lower: Vec<Point> = Vec::with_capacity(sorted.len());
	for &point in &sorted {
		while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], point) <= 0.0 {
			lower.pop();
		}
		lower.push(point);
	}

	let mut upper: Vec<Point> = Vec::with_capacity(sorted.len());
	for &point in sorted.iter().rev() {
		while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], point) <= 0.0 {
			upper.pop();
		}
		upper.push(point);
	}

	lower.pop();
	upper.pop();
	lower.extend(upper);
	lower
}

/// Absolute area (shoelace). Degenerate polygons have zero area.
#[must_use]
pub fn area(polygon: &[Point]) -> f64 {
	if polygon.len() < 3 {
		return 0.0;
	}

	let twice: f64 = edges(polygon).map(|(a, b)| a[0].mul_add(b[1], -(b[0] * a[1]))).sum();
	twice.abs() / 2.0
}

/// Mean of the vertices; the origin for an empty polygon.
#[must_use]
pub fn center(polygon: &[Point]) -> Point {
	if polygon.is_empty() {
		return [0.0, 0.0];
	}

	let count = polygon.len() as f64;
	let (sum_x, sum_y) = polygon.iter().fold((0.0, 0.0), |(x, y), point| (x + point[0], y + point[1]));
	[sum_x / count, sum_y / count]
}

/// Closed edges of a polygon. A single vertex yields one degenerate edge so
/// that segment predicates still see it.
pub fn edges(polygon: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
	let count = polygon.len();
	(0..count).map(move |index| (polygon[index], polygon[(index + 1) % count]))
}

#[must_use]
pub fn distance_to_segment(point: Point, a: Point, b: Point) -> f64 {
	let dx = b[0] - a[0];
	let dy = b[1] - a[1];
	let length_squared = dx.mul_add(dx, dy * dy);
	if length_squared <= EPSILON {
		return distance(point, a);
	}

	let t = ((point[0] - a[0]).mul_add(dx, (point[1] - a[1]) * dy) / length_squared).clamp(0.0, 1.0);
	distance(point, [t.mul_add(dx, a[0]), t.mul_add(dy, a[1])])
}

/// Distance from a point to the boundary of a polygon (to the vertex itself
/// for single-point polygons). Infinite for an empty polygon.
#[must_use]
pub fn distance_to_polygon(point: Point, polygon: &[Point]) -> f64 {
	edges(polygon).map(|(a, b)| distance_to_segment(point, a, b)).fold(f64::INFINITY, f64::min)
}

fn ray_cast(point: Point, polygon: &[Point]) -> bool {
	let mut inside = false;
	let mut previous = polygon.len() - 1;

	for current in 0..polygon.len() {
		let [xi, yi] = polygon[current];
		let [xj, yj] = polygon[previous];
		if (yi > point[1]) != (yj > point[1]) && point[0] < (xj - xi) * (point[1] - yi) / (yj - yi) + xi {
			inside = !inside;
		}
		previous = current;
	}

	inside
}

/// Inside-or-on-boundary test.
#[must_use]
pub fn contains(polygon: &[Point], point: Point) -> bool {
	let Some(bounds) = Bounds::of(polygon) else {
		return false;
	};
	if !bounds.contains(point) {
		return false;
	}

	if polygon.len() >= 3 && ray_cast(point, polygon) {
		return true;
	}

	distance_to_polygon(point, polygon) <= EPSILON
}

fn on_segment(a: Point, b: Point, point: Point) -> bool {
	point[0] >= a[0].min(b[0]) - EPSILON
		&& point[0] <= a[0].max(b[0]) + EPSILON
		&& point[1] >= a[1].min(b[1]) - EPSILON
		&& point[1] <= a[1].max(b[1]) + EPSILON
}

fn orientation(a: Point, b: Point, c: Point) -> i8 {
	let value = cross(a, b, c);
	if value > EPSILON {
		1
	} else if value < -EPSILON {
		-1
	} else {
		0
	}
}

/// Closed-segment intersection, including touching and collinear overlap.
#[must_use]
pub fn segments_intersect(a1: Point, a2: Point, b1: Point, b2: Point) -> bool {
	let o1 = orientation(a1, a2, b1);
	let o2 = orientation(a1, a2, b2);
	let o3 = orientation(b1, b2, a1);
	let o4 = orientation(b1, b2, a2);

	if o1 != o2 && o3 != o4 {
		return true;
	}

	(o1 == 0 && on_segment(a1, a2, b1))
		|| (o2 == 0 && on_segment(a1, a2, b2))
		|| (o3 == 0 && on_segment(b1, b2, a1))
		|| (o4 == 0 && on_segment(b1, b2, a2))
}

/// True when the polygons share any point (crossing edges or containment).
#[must_use]
pub fn polygons_intersect(a: &[Point], b: &[Point]) -> bool {
	let (Some(bounds_a), Some(bounds_b)) = (Bounds::of(a), Bounds::of(b)) else {
		return false;
	};
	if bounds_a.gap(&bounds_b) > EPSILON {
		return false;
	}

	for (a1, a2) in edges(a) {
		for (b1, b2) in edges(b) {
			if segments_intersect(a1, a2, b1, b2) {
				return true;
			}
		}
	}

	contains(b, a[0]) || contains(a, b[0])
}

#[must_use]
pub fn segment_intersects_polygon(a: Point, b: Point, polygon: &[Point]) -> bool {
	if polygon.is_empty() {
		return false;
	}

	edges(polygon).any(|(p1, p2)| segments_intersect(a, b, p1, p2)) || contains(polygon, a)
}

/// Clips a polygon to one side of an axis-aligned line (Sutherland-Hodgman
/// against a single boundary).
#[must_use]
pub fn clip_half_plane(polygon: &[Point], axis: Axis, limit: f64, keep: Side) -> Polygon {
	let index = axis.index();
	let inside = |point: Point| match keep {
		Side::Below => point[index] <= limit,
		Side::Above => point[index] >= limit,
	};
	let crossing = |a: Point, b: Point| {
		let t = (limit - a[index]) / (b[index] - a[index]);
		let mut point = [t.mul_add(b[0] - a[0], a[0]), t.mul_add(b[1] - a[1], a[1])];
		point[index] = limit;
		point
	};

	let count = polygon.len();
	let mut clipped = Vec::with_capacity(count + 2);
	for current_index in 0..count {
		let current = polygon[current_index];
		let previous = polygon[(current_index + count - 1) % count];

		match (inside(previous), inside(current)) {
			(true, true) => clipped.push(current),
			(true, false) => clipped.push(crossing(previous, current)),
			(false, true) => {
				clipped.push(crossing(previous, current));
				clipped.push(current);
			},
			(false, false) => {},
		}
	}

	clipped.dedup();
	clipped
}
