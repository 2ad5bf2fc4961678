use std::sync::Arc;

use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{GatingError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
}

impl Channel {
	#[must_use]
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into(), label: None }
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStatistics {
	pub min: f64,
	/// Smallest strictly positive value, used as the lower bound of log axes.
	pub positive_min: f64,
	pub max: f64,
}

impl ChannelStatistics {
	fn of(column: ArrayView1<'_, f64>) -> Self {
		let mut statistics = Self { min: f64::INFINITY, positive_min: f64::INFINITY, max: f64::NEG_INFINITY };
		for &value in column.iter().filter(|value| value.is_finite()) {
			statistics.min = statistics.min.min(value);
			statistics.max = statistics.max.max(value);
			if value > 0.0 {
				statistics.positive_min = statistics.positive_min.min(value);
			}
		}

		if !statistics.min.is_finite() {
			return Self { min: 0.0, positive_min: 1.0, max: 1.0 };
		}
		if !statistics.positive_min.is_finite() {
			statistics.positive_min = 1.0;
		}
		statistics
	}
}

/// Dense events x channels matrix. Immutable once built.
#[derive(Debug, Clone)]
pub struct EventMatrix {
	channels: Vec<Channel>,
	values: Array2<f64>,
	statistics: Vec<ChannelStatistics>,
}

impl EventMatrix {
	pub fn new(channels: Vec<Channel>, values: Array2<f64>) -> Result<Self> {
		if values.ncols() != channels.len() {
			return Err(GatingError::InvalidParameter(format!(
				"matrix has {} columns but {} channels were declared",
				values.ncols(),
				channels.len()
			)));
		}

		let statistics = values.axis_iter(Axis(1)).map(ChannelStatistics::of).collect();
		Ok(Self { channels, values, statistics })
	}

	pub fn from_rows(channels: Vec<Channel>, rows: Vec<Vec<f64>>) -> Result<Self> {
		let width = channels.len();
		let height = rows.len();
		let mut flat = Vec::with_capacity(width * height);
		for (index, row) in rows.into_iter().enumerate() {
			if row.len() != width {
				return Err(GatingError::InvalidParameter(format!(
					"event {index} has {} values, expected {width}",
					row.len()
				)));
			}
			flat.extend(row);
		}

		let values = Array2::from_shape_vec((height, width), flat)
			.map_err(|err| GatingError::InvalidParameter(format!("invalid matrix shape: {err}")))?;
		Self::new(channels, values)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.values.nrows()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.values.nrows() == 0
	}

	#[must_use]
	pub fn channel_count(&self) -> usize {
		self.channels.len()
	}

	#[must_use]
	pub fn channels(&self) -> &[Channel] {
		&self.channels
	}

	#[must_use]
	pub const fn values(&self) -> &Array2<f64> {
		&self.values
	}

	pub fn statistics(&self, channel: usize) -> Result<ChannelStatistics> {
		self.statistics.get(channel).copied().ok_or_else(|| {
			GatingError::InvalidParameter(format!("channel {channel} is out of range for {} channels", self.channels.len()))
		})
	}

	#[must_use]
	pub fn value(&self, event: usize, channel: usize) -> Option<f64> {
		self.values.get((event, channel)).copied()
	}
}

/// The events of one sample: a shared matrix, optionally restricted to the
/// ids persisted for a subsample.
#[derive(Debug, Clone)]
pub struct SampleEvents {
	matrix: Arc<EventMatrix>,
	included: Option<Arc<[usize]>>,
}

impl SampleEvents {
	#[must_use]
	pub const fn new(matrix: Arc<EventMatrix>) -> Self {
		Self { matrix, included: None }
	}

	/// Ids outside the matrix are dropped.
	#[must_use]
	pub fn restricted(matrix: Arc<EventMatrix>, ids: &[usize]) -> Self {
		let len = matrix.len();
		let mut included: Vec<usize> = ids.iter().copied().filter(|&id| id < len).collect();
		included.sort_unstable();
		included.dedup();
		Self { matrix, included: Some(included.into()) }
	}

	#[must_use]
	pub const fn matrix(&self) -> &Arc<EventMatrix> {
		&self.matrix
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.included.as_ref().map_or_else(|| self.matrix.len(), |ids| ids.len())
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	#[must_use]
	pub fn ids(&self) -> Vec<usize> {
		self.included.as_ref().map_or_else(|| (0..self.matrix.len()).collect(), |ids| ids.to_vec())
	}

	/// `(event id, [x, y])` raw value pairs for the selected channels.
	pub fn project(&self, parameters: [usize; 2]) -> Result<Vec<(usize, [f64; 2])>> {
		let [x, y] = parameters;
		self.matrix.statistics(x)?;
		self.matrix.statistics(y)?;

		let values = self.matrix.values();
		let point = |id: usize| (id, [values[(id, x)], values[(id, y)]]);
		Ok(match &self.included {
			Some(ids) => ids.iter().map(|&id| point(id)).collect(),
			None => (0..self.matrix.len()).map(point).collect(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn matrix() -> EventMatrix {
		EventMatrix::from_rows(
			vec![Channel::new("FSC-A"), Channel::new("CD4")],
			vec![vec![1.0, 0.0], vec![5.0, 2.5], vec![-3.0, 10.0]],
		)
		.unwrap()
	}

	#[test]
	fn statistics_track_positive_minimum() {
		let matrix = matrix();
		let fsc = matrix.statistics(0).unwrap();
		assert!((fsc.min - -3.0).abs() < f64::EPSILON);
		assert!((fsc.positive_min - 1.0).abs() < f64::EPSILON);
		assert!((fsc.max - 5.0).abs() < f64::EPSILON);

		let cd4 = matrix.statistics(1).unwrap();
		assert!((cd4.positive_min - 2.5).abs() < f64::EPSILON);
		assert!(matrix.statistics(2).is_err());
	}

	#[test]
	fn ragged_rows_are_rejected() {
		let result = EventMatrix::from_rows(vec![Channel::new("a"), Channel::new("b")], vec![vec![1.0]]);
		assert!(matches!(result, Err(GatingError::InvalidParameter(_))));
	}

	#[test]
	fn restriction_filters_projection() {
		let events = SampleEvents::restricted(Arc::new(matrix()), &[2, 0, 2, 9]);
		assert_eq!(events.len(), 2);
		let points = events.project([1, 0]).unwrap();
		assert_eq!(points, vec![(0, [0.0, 1.0]), (2, [10.0, -3.0])]);
	}
}
