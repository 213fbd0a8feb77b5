//! The registry of everything a pipeline run knows: datasets, calibration, imaging work and
//! image products.
//!
//! There is one [`Context`] per run. Tasks only read it; changes arrive through
//! [`crate::Results::merge_with_context`], one stage at a time.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use glob::glob;
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod callibrary;
mod error;

pub use callibrary::{CalApplication, CalLibrary};
pub use error::ContextError;

/// The directory inside a sharded dataset holding its sub-datasets.
pub const SUBDATASET_DIR: &str = "SUBMSS";

/// A field (pointing) within a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Observing intents, e.g. `TARGET` or `PHASE`.
    #[serde(default)]
    pub intents: Vec<String>,
}

impl Field {
    /// A field called `name` observed with `intents`.
    pub fn new(name: &str, intents: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            intents: intents.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether the field was observed with `intent`.
    pub fn has_intent(&self, intent: &str) -> bool {
        self.intents.iter().any(|i| i.eq_ignore_ascii_case(intent))
    }
}

/// A spectral window within a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spw {
    /// Spectral window id.
    pub id: usize,
    /// Intents the window was used for. Empty means every intent.
    #[serde(default)]
    pub intents: Vec<String>,
}

impl Spw {
    /// Spectral window `id` used for `intents`.
    pub fn new(id: usize, intents: &[&str]) -> Self {
        Self {
            id,
            intents: intents.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether the window carries data for `intent`.
    pub fn has_intent(&self, intent: &str) -> bool {
        self.intents.is_empty() || self.intents.iter().any(|i| i.eq_ignore_ascii_case(intent))
    }
}

/// A registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Name the dataset is registered under.
    pub name: String,
    /// Where it lives on disk.
    pub path: PathBuf,
    /// Fields it contains.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Spectral windows it contains.
    #[serde(default)]
    pub spws: Vec<Spw>,
    /// Paths of its sub-datasets, if it is sharded.
    #[serde(default)]
    pub shards: Vec<String>,
    /// The latest flagging summary, if one has been taken.
    #[serde(default)]
    pub flag_summary: Option<Map<String, Value>>,
}

impl Dataset {
    /// An unsharded dataset with no fields or spectral windows.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            fields: vec![],
            spws: vec![],
            shards: vec![],
            flag_summary: None,
        }
    }

    /// Replace the fields.
    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// Replace the spectral windows.
    pub fn with_spws(mut self, spws: Vec<Spw>) -> Self {
        self.spws = spws;
        self
    }

    /// Replace the sub-dataset paths.
    pub fn with_shards(mut self, shards: Vec<String>) -> Self {
        self.shards = shards;
        self
    }

    /// Open `path` as dataset `name`, listing sub-datasets under its `SUBMSS` directory.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Discovery`] if the sub-dataset directory can't be globbed.
    pub fn discover(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ContextError> {
        let mut dataset = Self::new(name, path);
        let subdir = dataset.path.join(SUBDATASET_DIR);
        if !subdir.is_dir() {
            return Ok(dataset);
        }
        let pattern = subdir.join("*");
        let discovery_error = |message: String| ContextError::Discovery {
            path: dataset.path.display().to_string(),
            message,
        };
        let entries = glob(&pattern.to_string_lossy()).map_err(|e| discovery_error(e.to_string()))?;
        let mut shards = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| discovery_error(e.to_string()))?;
            if entry.is_dir() {
                shards.push(entry.display().to_string());
            }
        }
        shards.sort();
        debug!("{} has {} sub-datasets", dataset.name, shards.len());
        dataset.shards = shards;
        Ok(dataset)
    }

    /// Whether the dataset is split into sub-datasets.
    pub fn is_sharded(&self) -> bool {
        !self.shards.is_empty()
    }

    /// Fields observed with `intent`.
    pub fn fields_with_intent(&self, intent: &str) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.has_intent(intent)).collect()
    }

    /// Spectral windows carrying `intent`.
    pub fn spws_with_intent(&self, intent: &str) -> Vec<&Spw> {
        self.spws.iter().filter(|s| s.has_intent(intent)).collect()
    }

    /// Field selection for `intent`, e.g. `"3C286,J1331+3030"`.
    pub fn field_selection(&self, intent: &str) -> String {
        self.fields_with_intent(intent).iter().map(|f| &f.name).join(",")
    }

    /// Spectral window selection for `intent`, e.g. `"0,1"`.
    pub fn spw_selection(&self, intent: &str) -> String {
        self.spws_with_intent(intent).iter().map(|s| s.id).join(",")
    }
}

/// Imaging work queued for a later clean stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagingTarget {
    /// Base name of the image products.
    pub imagename: String,
    /// Field selection.
    pub field: String,
    /// Spectral window selection.
    #[serde(default)]
    pub spw: String,
    /// Intent of the data to image.
    #[serde(default = "default_imaging_intent")]
    pub intent: String,
    /// Image size in pixels, `[width, height]`.
    pub imsize: [usize; 2],
    /// Pixel size, e.g. `"0.5arcsec"`.
    pub cell: String,
    /// Spectral mode.
    #[serde(default = "default_specmode")]
    pub specmode: String,
}

fn default_imaging_intent() -> String {
    "TARGET".into()
}

fn default_specmode() -> String {
    "mfs".into()
}

/// A finished set of image products.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Base name the products were made under.
    pub imagename: String,
    /// The dataset that was imaged.
    pub vis: String,
    /// Restored image.
    pub image: String,
    /// Final residual.
    pub residual: String,
    /// Final model.
    pub model: String,
    /// Point spread function.
    pub psf: String,
    /// Primary beam, if one was made.
    pub pb: Option<String>,
    /// Threshold of the last clean pass.
    pub threshold: f64,
    /// Number of clean passes after the dirty image.
    pub iterations: usize,
    /// Robust rms of the final residual.
    pub residual_rms: f64,
    /// Stage that made the products.
    pub stage: usize,
}

/// State shared by every stage of a pipeline run.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Context {
    output_dir: PathBuf,
    datasets: IndexMap<String, Dataset>,
    callibrary: CalLibrary,
    pending_targets: Vec<ImagingTarget>,
    images: IndexMap<String, ImageRecord>,
    stage_number: usize,
}

impl Context {
    /// An empty context writing products into `output_dir`.
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Where products are written.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Number of the stage currently running, zero before the first.
    pub fn stage_number(&self) -> usize {
        self.stage_number
    }

    /// Move on to the next stage, returning its number.
    pub fn next_stage(&mut self) -> usize {
        self.stage_number += 1;
        self.stage_number
    }

    /// Add a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DuplicateRegistration`] if the name is taken.
    pub fn register(&mut self, dataset: Dataset) -> Result<(), ContextError> {
        if self.datasets.contains_key(&dataset.name) {
            return Err(ContextError::DuplicateRegistration {
                kind: "dataset",
                name: dataset.name,
            });
        }
        info!("registering dataset {} ({})", dataset.name, dataset.path.display());
        self.datasets.insert(dataset.name.clone(), dataset);
        Ok(())
    }

    /// Swap the dataset registered as `old` for `new`, in the same position. Either both happen
    /// or neither does. Calibration registered against `old` is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if `old` is not registered, or
    /// [`ContextError::DuplicateRegistration`] if `new` would clash with another dataset.
    pub fn replace(&mut self, old: &str, new: Dataset) -> Result<Dataset, ContextError> {
        if !self.datasets.contains_key(old) {
            return Err(ContextError::NotFound {
                kind: "dataset",
                name: old.to_string(),
            });
        }
        if new.name != old && self.datasets.contains_key(&new.name) {
            return Err(ContextError::DuplicateRegistration {
                kind: "dataset",
                name: new.name,
            });
        }
        info!("replacing dataset {} with {}", old, new.name);
        let mut new = Some(new);
        let mut replaced = None;
        self.datasets = std::mem::take(&mut self.datasets)
            .into_iter()
            .map(|(name, dataset)| match (name == old, new.take()) {
                (true, Some(incoming)) => {
                    replaced = Some(dataset);
                    (incoming.name.clone(), incoming)
                }
                (_, pending) => {
                    new = pending;
                    (name, dataset)
                }
            })
            .collect();
        self.drop_calibration(old);
        replaced.ok_or_else(|| ContextError::NotFound {
            kind: "dataset",
            name: old.to_string(),
        })
    }

    /// Remove a dataset and any calibration registered against it.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if nothing is registered as `name`.
    pub fn deregister(&mut self, name: &str) -> Result<Dataset, ContextError> {
        let dataset = self
            .datasets
            .shift_remove(name)
            .ok_or_else(|| ContextError::NotFound {
                kind: "dataset",
                name: name.to_string(),
            })?;
        self.drop_calibration(name);
        Ok(dataset)
    }

    fn drop_calibration(&mut self, name: &str) {
        let dropped = self.callibrary.remove_for(name);
        if !dropped.is_empty() {
            warn!(
                "dropping {} calibration tables registered for {}",
                dropped.len(),
                name
            );
        }
    }

    /// Look up a dataset by name.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if nothing is registered as `name`.
    pub fn get_dataset(&self, name: &str) -> Result<&Dataset, ContextError> {
        self.datasets.get(name).ok_or_else(|| ContextError::NotFound {
            kind: "dataset",
            name: name.to_string(),
        })
    }

    /// Look up a dataset by name for a merge to update.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if nothing is registered as `name`.
    pub fn dataset_mut(&mut self, name: &str) -> Result<&mut Dataset, ContextError> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| ContextError::NotFound {
                kind: "dataset",
                name: name.to_string(),
            })
    }

    /// Registered datasets, in registration order.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    /// Names of the registered datasets, in registration order.
    pub fn dataset_names(&self) -> Vec<&str> {
        self.datasets.keys().map(String::as_str).collect()
    }

    /// Registered calibration.
    pub fn callibrary(&self) -> &CalLibrary {
        &self.callibrary
    }

    /// Register calibration for a dataset.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if the dataset isn't registered, or
    /// [`ContextError::DuplicateRegistration`] if the table is already registered for it.
    pub fn add_calibration(&mut self, application: CalApplication) -> Result<(), ContextError> {
        self.get_dataset(&application.vis)?;
        self.callibrary.add(application)
    }

    /// Queue imaging work.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DuplicateRegistration`] if a target with the same image name is
    /// already queued.
    pub fn add_target(&mut self, target: ImagingTarget) -> Result<(), ContextError> {
        if self
            .pending_targets
            .iter()
            .any(|t| t.imagename == target.imagename)
        {
            return Err(ContextError::DuplicateRegistration {
                kind: "imaging target",
                name: target.imagename,
            });
        }
        self.pending_targets.push(target);
        Ok(())
    }

    /// Imaging work still to do, in the order it was queued.
    pub fn pending_work_list(&self) -> &[ImagingTarget] {
        &self.pending_targets
    }

    /// Remove a target from the work list once it has been imaged.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::NotFound`] if no target with that image name is queued.
    pub fn complete_target(&mut self, imagename: &str) -> Result<ImagingTarget, ContextError> {
        let idx = self
            .pending_targets
            .iter()
            .position(|t| t.imagename == imagename)
            .ok_or_else(|| ContextError::NotFound {
                kind: "imaging target",
                name: imagename.to_string(),
            })?;
        Ok(self.pending_targets.remove(idx))
    }

    /// Record finished image products.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::DuplicateRegistration`] if products with the same image name
    /// are already recorded.
    pub fn register_image(&mut self, record: ImageRecord) -> Result<(), ContextError> {
        if self.images.contains_key(&record.imagename) {
            return Err(ContextError::DuplicateRegistration {
                kind: "image",
                name: record.imagename,
            });
        }
        self.images.insert(record.imagename.clone(), record);
        Ok(())
    }

    /// Recorded image products, in the order they were made.
    pub fn images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.images.values()
    }

    /// Write the whole context as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Snapshot`] if the file can't be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ContextError> {
        let path = path.as_ref();
        let snapshot_error = |message: String| ContextError::Snapshot {
            path: path.display().to_string(),
            message,
        };
        let file = File::create(path).map_err(|e| snapshot_error(e.to_string()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| snapshot_error(e.to_string()))
    }

    /// Read a context written by [`Context::save`].
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Snapshot`] if the file can't be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let snapshot_error = |message: String| ContextError::Snapshot {
            path: path.display().to_string(),
            message,
        };
        let file = File::open(path).map_err(|e| snapshot_error(e.to_string()))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| snapshot_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::create_dir_all;
    use tempfile::tempdir;

    fn dataset(name: &str) -> Dataset {
        Dataset::new(name, format!("/data/{name}.ms"))
            .with_fields(vec![
                Field::new("J1331+3030", &["AMPLITUDE", "BANDPASS"]),
                Field::new("J1256-0547", &["PHASE"]),
                Field::new("NGC253", &["TARGET"]),
            ])
            .with_spws(vec![Spw::new(0, &[]), Spw::new(1, &["TARGET"])])
    }

    #[test]
    fn test_register_and_lookup() {
        let mut ctx = Context::new("/tmp");
        ctx.register(dataset("ds1")).unwrap();
        assert_eq!(ctx.get_dataset("ds1").unwrap().path, PathBuf::from("/data/ds1.ms"));
        assert!(matches!(
            ctx.get_dataset("ds2"),
            Err(ContextError::NotFound { kind: "dataset", .. })
        ));
        assert!(matches!(
            ctx.register(dataset("ds1")),
            Err(ContextError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut ctx = Context::new("/tmp");
        for name in ["a", "b", "c"] {
            ctx.register(dataset(name)).unwrap();
        }
        let old = ctx.replace("b", dataset("b_split")).unwrap();
        assert_eq!(old.name, "b");
        assert_eq!(ctx.dataset_names(), vec!["a", "b_split", "c"]);
        assert!(ctx.get_dataset("b").is_err());
    }

    #[test]
    fn test_replace_is_atomic() {
        let mut ctx = Context::new("/tmp");
        ctx.register(dataset("a")).unwrap();
        ctx.register(dataset("b")).unwrap();

        // the new name clashes with another registration, nothing changes
        assert!(matches!(
            ctx.replace("a", dataset("b")),
            Err(ContextError::DuplicateRegistration { .. })
        ));
        assert_eq!(ctx.dataset_names(), vec!["a", "b"]);

        assert!(matches!(
            ctx.replace("zzz", dataset("c")),
            Err(ContextError::NotFound { .. })
        ));
        assert_eq!(ctx.dataset_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_replace_with_same_name() {
        let mut ctx = Context::new("/tmp");
        ctx.register(dataset("a")).unwrap();
        let updated = Dataset::new("a", "/data/a_v2.ms");
        ctx.replace("a", updated).unwrap();
        assert_eq!(ctx.get_dataset("a").unwrap().path, PathBuf::from("/data/a_v2.ms"));
    }

    #[test]
    fn test_deregister_drops_calibration() {
        let mut ctx = Context::new("/tmp");
        ctx.register(dataset("ds1")).unwrap();
        ctx.add_calibration(CalApplication {
            vis: "ds1".into(),
            gaintable: "ds1.s2.gcal".into(),
            field: String::new(),
            spw: String::new(),
            interp: "linear".into(),
            calwt: false,
            stage: 2,
        })
        .unwrap();
        ctx.deregister("ds1").unwrap();
        assert!(ctx.callibrary().applications().is_empty());
        assert!(matches!(
            ctx.deregister("ds1"),
            Err(ContextError::NotFound { .. })
        ));
    }

    #[test]
    fn test_calibration_needs_dataset() {
        let mut ctx = Context::new("/tmp");
        let result = ctx.add_calibration(CalApplication {
            vis: "ghost".into(),
            gaintable: "ghost.gcal".into(),
            field: String::new(),
            spw: String::new(),
            interp: "linear".into(),
            calwt: false,
            stage: 1,
        });
        assert!(matches!(result, Err(ContextError::NotFound { .. })));
    }

    #[test]
    fn test_intent_selection() {
        let ds = dataset("ds1");
        assert_eq!(ds.field_selection("target"), "NGC253");
        assert_eq!(ds.field_selection("BANDPASS"), "J1331+3030");
        // spw 0 has no intents so it carries everything
        assert_eq!(ds.spw_selection("TARGET"), "0,1");
        assert_eq!(ds.spw_selection("PHASE"), "0");
    }

    #[test]
    fn test_work_list() {
        let mut ctx = Context::new("/tmp");
        let target = ImagingTarget {
            imagename: "NGC253.spw0".into(),
            field: "NGC253".into(),
            spw: "0".into(),
            intent: "TARGET".into(),
            imsize: [64, 64],
            cell: "0.5arcsec".into(),
            specmode: "mfs".into(),
        };
        ctx.add_target(target.clone()).unwrap();
        assert!(ctx.add_target(target.clone()).is_err());
        assert_eq!(ctx.pending_work_list().len(), 1);
        assert_eq!(ctx.complete_target("NGC253.spw0").unwrap(), target);
        assert!(ctx.pending_work_list().is_empty());
        assert!(ctx.complete_target("NGC253.spw0").is_err());
    }

    #[test]
    fn test_stage_numbers() {
        let mut ctx = Context::new("/tmp");
        assert_eq!(ctx.stage_number(), 0);
        assert_eq!(ctx.next_stage(), 1);
        assert_eq!(ctx.next_stage(), 2);
        assert_eq!(ctx.stage_number(), 2);
    }

    #[test]
    fn test_discover_shards() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("ds1.mms");
        for shard in ["ds1.mms.0002", "ds1.mms.0000", "ds1.mms.0001"] {
            create_dir_all(path.join(SUBDATASET_DIR).join(shard)).unwrap();
        }
        let ds = Dataset::discover("ds1", &path).unwrap();
        assert!(ds.is_sharded());
        let names: Vec<_> = ds
            .shards
            .iter()
            .map(|s| Path::new(s).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ds1.mms.0000", "ds1.mms.0001", "ds1.mms.0002"]);

        let plain = Dataset::discover("ds2", tmp_dir.path().join("ds2.ms")).unwrap();
        assert!(!plain.is_sharded());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let tmp_dir = tempdir().unwrap();
        let mut ctx = Context::new(tmp_dir.path());
        ctx.register(dataset("ds1")).unwrap();
        ctx.next_stage();
        let path = tmp_dir.path().join("context.json");
        ctx.save(&path).unwrap();

        let loaded = Context::load(&path).unwrap();
        assert_eq!(loaded.dataset_names(), vec!["ds1"]);
        assert_eq!(loaded.stage_number(), 1);
        assert_eq!(loaded.get_dataset("ds1").unwrap(), ctx.get_dataset("ds1").unwrap());
    }
}
