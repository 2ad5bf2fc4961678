use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GatingError, Result};
use crate::events::{Channel, EventMatrix, SampleEvents};

pub const MATRIX_CACHE_CAPACITY: usize = 10;
pub const INCLUDED_EVENTS_FILE: &str = "include-event-ids.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRef {
	pub workspace_id: String,
	pub file_id: String,
	pub sample_id: String,
}

impl SampleRef {
	#[must_use]
	pub fn new(workspace_id: impl Into<String>, file_id: impl Into<String>, sample_id: impl Into<String>) -> Self {
		Self { workspace_id: workspace_id.into(), file_id: file_id.into(), sample_id: sample_id.into() }
	}

	/// Same file, different sample.
	#[must_use]
	pub fn child(&self, sample_id: impl Into<String>) -> Self {
		Self { sample_id: sample_id.into(), ..self.clone() }
	}
}

/// Source of event matrices and of the included-event lists of subsamples.
pub trait MatrixProvider: Send + Sync {
	fn load(&self, workspace_id: &str, file_id: &str) -> Result<Arc<EventMatrix>>;

	/// `None` when the sample covers the whole file.
	fn included_events(&self, sample: &SampleRef) -> Result<Option<Vec<usize>>>;

	fn save_included_events(&self, sample: &SampleRef, ids: &[usize]) -> Result<()>;

	fn sample_events(&self, sample: &SampleRef) -> Result<SampleEvents> {
		let matrix = self.load(&sample.workspace_id, &sample.file_id)?;
		Ok(match self.included_events(sample)? {
			Some(ids) => SampleEvents::restricted(matrix, &ids),
			None => SampleEvents::new(matrix),
		})
	}
}

#[derive(Deserialize)]
struct MatrixFile {
	channels: Vec<Channel>,
	events: Vec<Vec<f64>>,
}

/// Reads matrices from `<assets>/workspaces/<workspace>/<file>/<file>.json`
/// and keeps the most recently used ones in memory.
pub struct FileMatrixProvider {
	assets: PathBuf,
	cache: Mutex<LruCache<(String, String), Arc<EventMatrix>>>,
}

impl FileMatrixProvider {
	#[must_use]
	pub fn new(assets: impl Into<PathBuf>) -> Self {
		Self::with_capacity(assets, MATRIX_CACHE_CAPACITY)
	}

	#[must_use]
	pub fn with_capacity(assets: impl Into<PathBuf>, capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
		Self { assets: assets.into(), cache: Mutex::new(LruCache::new(capacity)) }
	}

	#[must_use]
	pub fn assets(&self) -> &Path {
		&self.assets
	}

	fn file_dir(&self, workspace_id: &str, file_id: &str) -> Result<PathBuf> {
		Ok(self.assets.join("workspaces").join(path_segment("workspace", workspace_id)?).join(path_segment("file", file_id)?))
	}

	fn included_path(&self, sample: &SampleRef) -> Result<PathBuf> {
		let sample_dir = path_segment("sample", &sample.sample_id)?;
		Ok(self.file_dir(&sample.workspace_id, &sample.file_id)?.join(sample_dir).join(INCLUDED_EVENTS_FILE))
	}

	#[must_use]
	pub fn cached(&self) -> usize {
		self.cache.lock().len()
	}
}

/// Ids name directories under the assets root and must stay a single plain
/// path component.
fn path_segment<'a>(kind: &str, id: &'a str) -> Result<&'a str> {
	if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
		return Err(GatingError::InvalidParameter(format!("{kind} id {id:?} is not a plain name")));
	}
	Ok(id)
}

fn read(path: &Path) -> Result<String> {
	fs::read_to_string(path).map_err(|source| GatingError::Io { path: path.display().to_string(), source })
}

impl MatrixProvider for FileMatrixProvider {
	fn load(&self, workspace_id: &str, file_id: &str) -> Result<Arc<EventMatrix>> {
		let key = (workspace_id.to_string(), file_id.to_string());
		if let Some(matrix) = self.cache.lock().get(&key) {
			return Ok(Arc::clone(matrix));
		}

		let path = self.file_dir(workspace_id, file_id)?.join(format!("{file_id}.json"));
		let contents = read(&path)?;
		let file: MatrixFile = serde_json::from_str(&contents)
			.map_err(|source| GatingError::Parse { path: path.display().to_string(), source })?;
		let matrix = Arc::new(EventMatrix::from_rows(file.channels, file.events)?);
		info!(path = %path.display(), events = matrix.len(), channels = matrix.channel_count(), "Loaded event matrix");

		self.cache.lock().put(key, Arc::clone(&matrix));
		Ok(matrix)
	}

	fn included_events(&self, sample: &SampleRef) -> Result<Option<Vec<usize>>> {
		let path = self.included_path(sample)?;
		if !path.exists() {
			return Ok(None);
		}

		let contents = read(&path)?;
		serde_json::from_str(&contents)
			.map(Some)
			.map_err(|source| GatingError::Parse { path: path.display().to_string(), source })
	}

	fn save_included_events(&self, sample: &SampleRef, ids: &[usize]) -> Result<()> {
		let path = self.included_path(sample)?;
		let io_error = |source| GatingError::Io { path: path.display().to_string(), source };

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(io_error)?;
		}
		let contents = serde_json::to_string(ids)
			.map_err(|source| GatingError::Parse { path: path.display().to_string(), source })?;
		fs::write(&path, contents).map_err(io_error)?;

		debug!(path = %path.display(), events = ids.len(), "Saved included events");
		Ok(())
	}
}

/// Keeps everything in memory. Used by tests and by callers that already hold
/// their matrices.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
	matrices: RwLock<HashMap<(String, String), Arc<EventMatrix>>>,
	included: RwLock<HashMap<SampleRef, Vec<usize>>>,
}

impl InMemoryProvider {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, workspace_id: &str, file_id: &str, matrix: EventMatrix) {
		self.matrices.write().insert((workspace_id.to_string(), file_id.to_string()), Arc::new(matrix));
	}
}

impl MatrixProvider for InMemoryProvider {
	fn load(&self, workspace_id: &str, file_id: &str) -> Result<Arc<EventMatrix>> {
		self.matrices
			.read()
			.get(&(workspace_id.to_string(), file_id.to_string()))
			.cloned()
			.ok_or_else(|| GatingError::InvalidParameter(format!("unknown file {workspace_id}/{file_id}")))
	}

	fn included_events(&self, sample: &SampleRef) -> Result<Option<Vec<usize>>> {
		Ok(self.included.read().get(sample).cloned())
	}

	fn save_included_events(&self, sample: &SampleRef, ids: &[usize]) -> Result<()> {
		self.included.write().insert(sample.clone(), ids.to_vec());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scratch(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("gating-provider-{name}-{}", std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		dir
	}

	fn write_matrix(assets: &Path, workspace_id: &str, file_id: &str) {
		let dir = assets.join("workspaces").join(workspace_id).join(file_id);
		fs::create_dir_all(&dir).unwrap();
		let contents = r#"{"channels":[{"name":"CD4"},{"name":"CD8","label":"CD8 APC"}],"events":[[1,2],[3,4],[0,5]]}"#;
		fs::write(dir.join(format!("{file_id}.json")), contents).unwrap();
	}

	#[test]
	fn loads_and_caches_matrices() {
		let assets = scratch("load");
		write_matrix(&assets, "ws", "f1");
		let provider = FileMatrixProvider::new(&assets);

		let first = provider.load("ws", "f1").unwrap();
		let second = provider.load("ws", "f1").unwrap();
		assert!(Arc::ptr_eq(&first, &second));
		assert_eq!(first.len(), 3);
		assert_eq!(first.channels()[1].label.as_deref(), Some("CD8 APC"));
		assert_eq!(provider.cached(), 1);

		fs::remove_dir_all(&assets).unwrap();
	}

	#[test]
	fn cache_is_bounded() {
		let assets = scratch("bounded");
		for file in ["a", "b", "c"] {
			write_matrix(&assets, "ws", file);
		}
		let provider = FileMatrixProvider::with_capacity(&assets, 2);
		for file in ["a", "b", "c"] {
			provider.load("ws", file).unwrap();
		}
		assert_eq!(provider.cached(), 2);

		fs::remove_dir_all(&assets).unwrap();
	}

	#[test]
	fn missing_file_is_an_io_error() {
		let provider = FileMatrixProvider::new(scratch("missing"));
		let err = provider.load("ws", "nope").unwrap_err();
		assert_eq!(err.kind(), "io");
	}

	#[test]
	fn subsample_round_trips_through_disk() {
		let assets = scratch("subsample");
		write_matrix(&assets, "ws", "f1");
		let provider = FileMatrixProvider::new(&assets);
		let root = SampleRef::new("ws", "f1", "f1");
		let child = root.child("s2");

		assert_eq!(provider.included_events(&child).unwrap(), None);
		provider.save_included_events(&child, &[2, 0]).unwrap();
		assert!(assets.join("workspaces/ws/f1/s2").join(INCLUDED_EVENTS_FILE).exists());

		let events = provider.sample_events(&child).unwrap();
		assert_eq!(events.ids(), vec![0, 2]);
		assert_eq!(provider.sample_events(&root).unwrap().len(), 3);

		fs::remove_dir_all(&assets).unwrap();
	}

	#[test]
	fn ids_cannot_leave_the_assets_directory() {
		let assets = scratch("escape");
		write_matrix(&assets, "ws", "f1");
		let provider = FileMatrixProvider::new(assets.join("inner"));
		let child = SampleRef::new("ws", "f1", "../../../../escaped");

		let err = provider.save_included_events(&child, &[0]).unwrap_err();
		assert_eq!(err.kind(), "invalid-parameter");
		assert!(!assets.join("escaped").exists());

		for id in ["", ".", "..", "a/b", "a\\b"] {
			assert!(matches!(provider.load(id, "f1"), Err(GatingError::InvalidParameter(_))), "accepted {id:?}");
			assert!(provider.included_events(&SampleRef::new("ws", "f1", id)).is_err(), "accepted {id:?}");
		}
		assert_eq!(provider.cached(), 0);

		let _ = fs::remove_dir_all(&assets);
	}

	#[test]
	fn in_memory_provider_serves_inserted_matrices() {
		let provider = InMemoryProvider::new();
		let matrix = EventMatrix::from_rows(vec![Channel::new("a")], vec![vec![1.0], vec![2.0]]).unwrap();
		provider.insert("ws", "f", matrix);

		let sample = SampleRef::new("ws", "f", "f");
		assert_eq!(provider.sample_events(&sample).unwrap().len(), 2);
		assert!(provider.load("ws", "other").is_err());
	}
}
