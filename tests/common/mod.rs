#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::{create_dir_all, write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use casapipe::{
    clean::{decode_pixels, encode_pixels, MemoryImageStore},
    context::SUBDATASET_DIR,
    job::EngineError,
    Engine, Job, Value,
};
use ndarray::Array2;

type Handler = Box<dyn Fn(&Job) -> Result<Value, EngineError> + Send + Sync>;

/// An engine answering each command with a closure, and `null` for anything else.
#[derive(Default)]
pub struct ScriptedEngine {
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<Job>>,
}

impl ScriptedEngine {
    pub fn on<F>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(&Job) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.handlers.insert(command.to_string(), Box::new(handler));
        self
    }

    /// Make the directory named by argument `key`, as the engine would write a dataset or table.
    pub fn creating(self, command: &str, key: &'static str) -> Self {
        self.on(command, move |job| {
            if let Some(Value::String(path)) = job.args.get(key) {
                create_dir_all(path).unwrap();
            }
            Ok(Value::Null)
        })
    }

    /// Answer `getchunk` and `putchunk` from `store`.
    pub fn serving_images(self, store: Arc<MemoryImageStore>) -> Self {
        let reader = Arc::clone(&store);
        self.on("getchunk", move |job| {
            let name = job.args["imagename"].as_str().unwrap();
            reader
                .get(name)
                .map(|pixels| encode_pixels(pixels.view()))
                .map_err(|e| EngineError::Failed {
                    command: job.command.clone(),
                    message: e.to_string(),
                })
        })
        .on("putchunk", move |job| {
            let name = job.args["imagename"].as_str().unwrap();
            let pixels = decode_pixels(name, &job.args["pixels"]).unwrap();
            store.insert(name, pixels.view());
            Ok(Value::Null)
        })
    }

    pub fn calls(&self) -> Vec<Job> {
        self.calls.lock().unwrap().clone()
    }
}

impl Engine for ScriptedEngine {
    fn call(&self, job: &Job) -> Result<Value, EngineError> {
        self.calls.lock().unwrap().push(job.clone());
        match self.handlers.get(&job.command) {
            Some(handler) => handler(job),
            None => Ok(Value::Null),
        }
    }
}

/// Answers `tclean` by writing a point source into `store` whose residual peak halves with
/// every pass, and restores by copying the model into the image, which also lands on disk.
pub fn point_source_imager(
    store: Arc<MemoryImageStore>,
    shape: (usize, usize),
) -> impl Fn(&Job) -> Result<Value, EngineError> + Send + Sync + 'static {
    move |job| {
        let imagename = job.args["imagename"].as_str().unwrap().to_string();
        if job.args["restoration"] == Value::Bool(true) {
            let model = store.get(&format!("{imagename}.model")).unwrap();
            store.insert(&format!("{imagename}.image"), model.view());
            create_dir_all(format!("{imagename}.image")).unwrap();
            return Ok(Value::Null);
        }
        let iteration: i32 = imagename.rsplit(".iter").next().unwrap().parse().unwrap();
        let (cy, cx) = (shape.0 / 2, shape.1 / 2);
        let peak = 64.0 * 0.5_f32.powi(iteration);
        let mut residual =
            Array2::from_shape_fn(shape, |(y, x)| if (x + y) % 2 == 0 { 0.5 } else { -0.5 });
        residual[[cy, cx]] = peak;
        let mut model = Array2::<f32>::zeros(shape);
        model[[cy, cx]] = 64.0 - peak;
        let mut psf = Array2::<f32>::zeros(shape);
        psf[[cy, cx]] = 1.0;
        for (suffix, pixels) in [("residual", residual), ("model", model), ("psf", psf)] {
            store.insert(&format!("{imagename}.{suffix}"), pixels.view());
        }
        Ok(Value::Null)
    }
}

/// Make `num_shards` sub-dataset directories inside `path`, returning the dataset path.
pub fn make_sharded_dataset(path: &Path, num_shards: usize) -> PathBuf {
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    for i in 0..num_shards {
        create_dir_all(path.join(SUBDATASET_DIR).join(format!("{name}.{i:04}"))).unwrap();
    }
    path.to_path_buf()
}

/// The index of the sub-dataset a job was sent to.
pub fn shard_index(job: &Job) -> usize {
    let vis = job.args["vis"].as_str().unwrap();
    vis.rsplit('.').next().unwrap().parse().unwrap()
}

/// Write a recipe into `dir` with one dataset of NGC253 observations and return its path.
pub fn write_recipe(dir: &Path, stages: &str) -> PathBuf {
    let recipe_path = dir.join("recipe.toml");
    write(
        &recipe_path,
        format!(
            r#"
output_dir = "{out}"

[[dataset]]
name = "ngc253"
path = "{out}/ngc253.ms"
fields = [
    {{ name = "J0132-1654", intents = ["PHASE"] }},
    {{ name = "NGC253", intents = ["TARGET"] }},
]
spws = [{{ id = 0 }}, {{ id = 1, intents = ["TARGET"] }}]

[[target]]
imagename = "NGC253"
field = "NGC253"
imsize = [32, 32]
cell = "0.5arcsec"

{stages}
"#,
            out = dir.display(),
        ),
    )
    .unwrap();
    recipe_path
}
