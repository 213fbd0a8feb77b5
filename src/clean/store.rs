//! Access to image pixels for the clean heuristics.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, PoisonError},
};

use ndarray::{Array2, ArrayView2};
use serde_json::{json, Number, Value};

use super::CleanError;
use crate::{
    inputs::engine_args,
    job::{Executor, Job},
};

/// Somewhere image products can be read from and written to. Stores that need the engine make
/// their calls through `executor`, so they are accounted for like any other call.
pub trait ImageStore: Send + Sync {
    /// The pixels of image `name`, indexed `[y, x]`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanError::Image`] if the image can't be read.
    fn read_image(&self, name: &str, executor: &mut Executor) -> Result<Array2<f32>, CleanError>;

    /// Write `pixels` as image `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanError::Image`] if the image can't be written.
    fn write_image(
        &self,
        name: &str,
        pixels: ArrayView2<f32>,
        executor: &mut Executor,
    ) -> Result<(), CleanError>;

    /// Whether image `name` exists.
    fn exists(&self, name: &str) -> bool;
}

/// Images held in memory.
#[derive(Debug, Default)]
pub struct MemoryImageStore {
    images: Mutex<HashMap<String, Array2<f32>>>,
}

impl MemoryImageStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every stored image, sorted.
    pub fn names(&self) -> Vec<String> {
        let images = self.images.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = images.keys().cloned().collect();
        names.sort();
        names
    }

    /// The pixels of image `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanError::Image`] if there is no such image.
    pub fn get(&self, name: &str) -> Result<Array2<f32>, CleanError> {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| CleanError::Image {
                name: name.to_string(),
                reason: "no such image".into(),
            })
    }

    /// Store `pixels` as image `name`, replacing any image of that name.
    pub fn insert(&self, name: &str, pixels: ArrayView2<f32>) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), pixels.to_owned());
    }
}

impl ImageStore for MemoryImageStore {
    fn read_image(&self, name: &str, _executor: &mut Executor) -> Result<Array2<f32>, CleanError> {
        self.get(name)
    }

    fn write_image(
        &self,
        name: &str,
        pixels: ArrayView2<f32>,
        _executor: &mut Executor,
    ) -> Result<(), CleanError> {
        self.insert(name, pixels);
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

/// Images on disk, read and written through the engine's `getchunk` and `putchunk` commands.
/// Pixel data travels as nested JSON arrays, rows first.
#[derive(Debug, Clone, Default)]
pub struct EngineImageStore;

impl EngineImageStore {
    /// A store calling the executor's engine.
    pub fn new() -> Self {
        Self
    }
}

/// Pixels from nested JSON arrays, rows first. `null` is a blanked pixel.
///
/// # Errors
///
/// Returns [`CleanError::Image`] naming `name` if `value` is not a rectangle of numbers.
pub fn decode_pixels(name: &str, value: &Value) -> Result<Array2<f32>, CleanError> {
    let bad = |reason: String| CleanError::Image {
        name: name.to_string(),
        reason,
    };
    let rows = value
        .as_array()
        .ok_or_else(|| bad(format!("expected rows of pixels, got {value}")))?;
    let height = rows.len();
    let width = rows.first().and_then(Value::as_array).map_or(0, Vec::len);
    let mut pixels = Vec::with_capacity(height * width);
    for (y, row) in rows.iter().enumerate() {
        let row = row
            .as_array()
            .filter(|row| row.len() == width)
            .ok_or_else(|| bad(format!("row {y} is not {width} pixels")))?;
        for v in row {
            // blanked pixels come back as null
            pixels.push(v.as_f64().map_or(f32::NAN, |v| v as f32));
        }
    }
    Array2::from_shape_vec((height, width), pixels).map_err(|e| bad(e.to_string()))
}

/// Pixels as nested JSON arrays, rows first, with non-finite pixels as `null`.
pub fn encode_pixels(pixels: ArrayView2<f32>) -> Value {
    Value::Array(
        pixels
            .rows()
            .into_iter()
            .map(|row| {
                Value::Array(
                    row.iter()
                        .map(|&v| Number::from_f64(v as f64).map_or(Value::Null, Value::Number))
                        .collect(),
                )
            })
            .collect(),
    )
}

impl ImageStore for EngineImageStore {
    fn read_image(&self, name: &str, executor: &mut Executor) -> Result<Array2<f32>, CleanError> {
        let job = Job::new("getchunk", engine_args([("imagename", json!(name))]));
        let value = executor.call(&job).map_err(|source| CleanError::Engine {
            job: job.to_string(),
            source,
        })?;
        decode_pixels(name, &value)
    }

    fn write_image(
        &self,
        name: &str,
        pixels: ArrayView2<f32>,
        executor: &mut Executor,
    ) -> Result<(), CleanError> {
        let job = Job::new(
            "putchunk",
            engine_args([("imagename", json!(name)), ("pixels", encode_pixels(pixels))]),
        );
        executor.call(&job).map_err(|source| CleanError::Engine {
            job: format!("putchunk(imagename='{name}')"),
            source,
        })?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        Path::new(name).exists()
    }
}
