use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ndarray::Array2;
use serde_json::Value;

use crate::{
    clean::MemoryImageStore,
    context::{Context, Dataset, Field, Spw, SUBDATASET_DIR},
    job::{Engine, EngineError, Job},
};

type Handler = Box<dyn Fn(&Job) -> Result<Value, EngineError> + Send + Sync>;

/// An engine answering each command with a closure, and `null` for anything else.
#[derive(Default)]
pub(crate) struct FakeEngine {
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<Job>>,
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on<F>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(&Job) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.handlers.insert(command.to_string(), Box::new(handler));
        self
    }

    /// Answer `tclean` with `imager`.
    pub(crate) fn imaging(self, imager: FakeImager) -> Self {
        self.on("tclean", move |job| imager.image(job))
    }

    pub(crate) fn calls(&self) -> Vec<Job> {
        self.calls.lock().unwrap().clone()
    }
}

impl Engine for FakeEngine {
    fn call(&self, job: &Job) -> Result<Value, EngineError> {
        self.calls.lock().unwrap().push(job.clone());
        match self.handlers.get(&job.command) {
            Some(handler) => handler(job),
            None => Ok(Value::Null),
        }
    }
}

/// Pretends to image a point source of 100 Jy at the centre of the field on top of ±1 noise.
/// Each clean pass halves the residual peak.
pub(crate) struct FakeImager {
    shape: (usize, usize),
    store: Arc<MemoryImageStore>,
    fail_at: Option<usize>,
    beam: bool,
}

impl FakeImager {
    pub(crate) fn new(shape: (usize, usize)) -> Self {
        Self {
            shape,
            store: Arc::new(MemoryImageStore::new()),
            fail_at: None,
            beam: false,
        }
    }

    pub(crate) fn failing_at(mut self, iteration: usize) -> Self {
        self.fail_at = Some(iteration);
        self
    }

    pub(crate) fn with_beam(mut self) -> Self {
        self.beam = true;
        self
    }

    pub(crate) fn store(&self) -> Arc<MemoryImageStore> {
        Arc::clone(&self.store)
    }

    fn image(&self, job: &Job) -> Result<Value, EngineError> {
        let imagename = job.args["imagename"].as_str().unwrap().to_string();
        if job.args.get("restoration") == Some(&Value::Bool(true))
            && job.args.get("calcres") == Some(&Value::Bool(false))
        {
            let model = self.store.get(&format!("{imagename}.model")).unwrap();
            self.store.insert(&format!("{imagename}.image"), model.view());
            return Ok(Value::Null);
        }
        let iteration: usize = imagename
            .rsplit(".iter")
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if self.fail_at == Some(iteration) {
            return Err(EngineError::Failed {
                command: job.command.clone(),
                message: format!("major cycle {iteration} diverged"),
            });
        }

        let (height, width) = self.shape;
        let (cy, cx) = (height / 2, width / 2);
        let peak = 100.0 * 0.5_f32.powi(iteration as i32);
        let mut residual = Array2::from_shape_fn(self.shape, |(y, x)| {
            if (x + y) % 2 == 0 {
                1.0
            } else {
                -1.0
            }
        });
        residual[[cy, cx]] = peak;
        let mut model = Array2::<f32>::zeros(self.shape);
        model[[cy, cx]] = 100.0 - peak;
        let mut psf = Array2::<f32>::zeros(self.shape);
        psf[[cy, cx]] = 1.0;

        for (suffix, pixels) in [("residual", residual), ("model", model), ("psf", psf)] {
            self.store.insert(&format!("{imagename}.{suffix}"), pixels.view());
        }
        if self.beam {
            let radius = (height.min(width) / 2) as f32;
            let pb = Array2::from_shape_fn(self.shape, |(y, x)| {
                let r = ((y as f32 - cy as f32).powi(2) + (x as f32 - cx as f32).powi(2)).sqrt();
                (1.0 - r / radius).max(0.0)
            });
            self.store.insert(&format!("{imagename}.pb"), pb.view());
        }
        Ok(Value::Null)
    }
}

/// A dataset with calibrator and target fields over two spectral windows.
pub(crate) fn ngc253(name: &str, path: impl Into<std::path::PathBuf>) -> Dataset {
    Dataset::new(name, path)
        .with_fields(vec![
            Field::new("J0132-1654", &["PHASE"]),
            Field::new("J2253+1608", &["BANDPASS", "AMPLITUDE"]),
            Field::new("NGC253", &["TARGET"]),
        ])
        .with_spws(vec![Spw::new(0, &[]), Spw::new(1, &["TARGET"])])
}

/// A context holding dataset `name` split into `num_shards` sub-datasets.
pub(crate) fn sharded_context(name: &str, num_shards: usize) -> Context {
    let path = format!("/data/{name}.mms");
    let shards = (0..num_shards)
        .map(|i| format!("{path}/{SUBDATASET_DIR}/{name}.mms.{i:04}"))
        .collect();
    let mut ctx = Context::new("/tmp");
    ctx.register(ngc253(name, &path).with_shards(shards))
        .unwrap();
    ctx
}
