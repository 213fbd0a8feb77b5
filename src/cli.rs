//! Command Line Interface helpers for casapipe

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt::{Debug, Display},
    fs::{create_dir_all, write},
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    thread::available_parallelism,
    time::Duration,
};

use clap::{
    arg, command,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
    ValueHint::{DirPath, FilePath},
};
use itertools::Itertools;
use log::{debug, info, trace};
use prettytable::{cell, format as prettyformat, row, table, Table};

use crate::{
    clean::EngineImageStore,
    config::{Recipe, StageServices},
    context::Context,
    dispatch::{ClusterDispatcher, DispatchConfig, LocalWorkerPool},
    engine::CommandEngine,
    error::{
        CLIError::InvalidCommandLineArgument,
        PipelineError::{self, ClapError, DryRun},
    },
    job::{Engine, Executor, ExecutorConfig},
    pipeline::PipelineReport,
};

/// Engine wrapper run when neither the command line nor the recipe names one.
pub const DEFAULT_ENGINE: &str = "casa-engine";

/// Every engine call of a run, one per line, written to the output directory.
pub const COMMANDS_LOG: &str = "casa_commands.log";

/// The context as it was when the run ended, written to the output directory.
pub const CONTEXT_SNAPSHOT: &str = "context.json";

/// A recipe and everything the command line said about how to run it.
pub struct CasapipeContext {
    /// Where the recipe was read from.
    pub recipe_path: PathBuf,
    /// The recipe.
    pub recipe: Recipe,
    /// The context seeded from the recipe.
    pub context: Context,
    /// Engine wrapper executable.
    pub engine: PathBuf,
    /// Arguments given to the engine before each command.
    pub engine_args: Vec<String>,
    /// Number of engine workers for sharded stages.
    pub num_workers: usize,
    /// Where products, the command log and the context snapshot go.
    pub output_dir: PathBuf,
    /// Options for driver-side engine calls.
    pub exec_config: ExecutorConfig,
    /// Options for sharded stages.
    pub dispatch_config: DispatchConfig,
}

// Add build-time information from the "built" crate.
include!(concat!(env!("OUT_DIR"), "/built.rs"));

/// Write many info-level log lines of how this executable was compiled.
///
/// # Errors
///
/// propagates writeln! fails
pub fn fmt_build_info(f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match GIT_HEAD_REF {
        Some(hr) => {
            let dirty = GIT_DIRTY.unwrap_or(false);
            writeln!(
                f,
                "Compiled on git commit hash: {}{}",
                GIT_COMMIT_HASH.unwrap_or("<unknown>"),
                if dirty { " (dirty)" } else { "" }
            )?;
            writeln!(f, "            git head ref: {}", hr)?;
        }
        None => writeln!(f, "Compiled on git commit hash: <no git info>")?,
    }
    writeln!(f, "            {}", BUILT_TIME_UTC)?;
    writeln!(f, "         with compiler {}", RUSTC_VERSION)?;
    writeln!(f)?;
    Ok(())
}

/// A table of how each stage of a run went.
pub fn summary_table(report: &PipelineReport) -> Table {
    let mut stage_table = table!(["stage", "task", "duration", "outcome"]);
    stage_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    for summary in &report.stages {
        stage_table.add_row(row![r =>
            summary.stage,
            summary.task,
            format!("{:.3?}", summary.duration),
            summary.outcome
        ]);
    }
    stage_table
}

impl Display for CasapipeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} version {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        )?;

        fmt_build_info(f)?;

        writeln!(f, "recipe:               {}", self.recipe_path.display())?;
        writeln!(f, "output directory:     {}", self.output_dir.display())?;
        writeln!(
            f,
            "engine:               {} {}",
            self.engine.display(),
            self.engine_args.join(" ")
        )?;
        writeln!(f, "engine workers:       {}", self.num_workers)?;
        write!(f, "{}", self.exec_config)?;
        write!(f, "{}", self.dispatch_config)?;

        let mut dataset_table = table!(["", "name", "path", "shards", "fields", "spws"]);
        dataset_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        for (idx, dataset) in self.context.datasets().enumerate() {
            dataset_table.add_row(row![r =>
                format!("ds{}:", idx),
                dataset.name,
                dataset.path.display(),
                dataset.shards.len(),
                dataset
                    .fields
                    .iter()
                    .map(|field| format!("{}[{}]", field.name, field.intents.join("|")))
                    .join(","),
                dataset.spws.iter().map(|spw| spw.id).join(",")
            ]);
        }
        writeln!(
            f,
            "Dataset details (count={}):\n{}",
            self.context.dataset_names().len(),
            dataset_table
        )?;

        let mut target_table = table!(["", "imagename", "field", "spw", "imsize", "cell"]);
        target_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        for (idx, target) in self.context.pending_work_list().iter().enumerate() {
            target_table.add_row(row![r =>
                format!("t{}:", idx),
                target.imagename,
                target.field,
                target.spw,
                format!("{}x{}", target.imsize[0], target.imsize[1]),
                target.cell
            ]);
        }
        writeln!(
            f,
            "Imaging targets (count={}):\n{}",
            self.context.pending_work_list().len(),
            target_table
        )?;

        let mut stage_table = table!(["", "task"]);
        stage_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
        for (idx, entry) in self.recipe.stages.iter().enumerate() {
            stage_table.add_row(row![r => format!("s{}:", idx + 1), entry.task_name()]);
        }
        writeln!(
            f,
            "Stages (count={}):\n{}",
            self.recipe.stages.len(),
            stage_table
        )?;
        Ok(())
    }
}

impl CasapipeContext {
    fn get_matches<I, T>(args: I) -> Result<clap::ArgMatches, PipelineError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let app = command!()
            .subcommand_precedence_over_arg(true)
            .arg_required_else_help(true)
            .next_line_help(false)
            .about("Run a recipe of radio interferometry reduction stages against an external \
                    data processing engine.")
            .args(&[
                // input options
                arg!(recipe: <RECIPE> "Recipe file listing datasets, imaging targets and stages")
                    .value_hint(FilePath)
                    .help_heading("INPUT"),

                // engine options
                arg!(--engine <PATH> "Engine wrapper executable [default: from recipe, or casa-engine]")
                    .value_hint(FilePath)
                    .help_heading("ENGINE")
                    .required(false),
                arg!(--workers <N> "Number of engine workers for sharded stages [default: from recipe, or one per cpu]")
                    .help_heading("ENGINE")
                    .required(false),
                arg!(--timeout <SECONDS> "Give up on sub-datasets which take longer than this")
                    .help_heading("ENGINE")
                    .required(false),
                arg!(--simulate "Log engine calls without running them")
                    .help_heading("ENGINE"),

                // output options
                arg!(-o --"output-dir" <DIR> "Where products are written [default: from recipe, or .]")
                    .value_hint(DirPath)
                    .help_heading("OUTPUT")
                    .required(false),

                arg!(--"dry-run" "Just print the summary and exit"),
                arg!(--"no-draw-progress" "do not show progress bars"),
            ]);

        app.try_get_matches_from(args).map_err(PipelineError::from)
    }

    fn parse_num_workers(
        matches: &clap::ArgMatches,
        recipe: &Recipe,
    ) -> Result<usize, PipelineError> {
        let num_workers = match matches.value_of_t::<usize>("workers") {
            Ok(num_workers) => num_workers,
            // filter any errors other than ArgumentNotFound
            Err(err) if err.kind() != ArgumentNotFound => return Err(err.into()),
            Err(_) => match recipe.workers {
                Some(num_workers) => num_workers,
                None => available_parallelism().map_or(1, NonZeroUsize::get),
            },
        };
        if num_workers == 0 {
            return Err(InvalidCommandLineArgument {
                option: "--workers".into(),
                expected: "a positive number of workers".into(),
                received: num_workers.to_string(),
            }
            .into());
        }
        Ok(num_workers)
    }

    fn parse_dispatch_matches(matches: &clap::ArgMatches) -> Result<DispatchConfig, PipelineError> {
        let timeout = match matches.value_of_t::<f64>("timeout") {
            Ok(seconds) if seconds.is_finite() && seconds > 0.0 => {
                Some(Duration::from_secs_f64(seconds))
            }
            Ok(seconds) => {
                return Err(InvalidCommandLineArgument {
                    option: "--timeout".into(),
                    expected: "a positive number of seconds".into(),
                    received: seconds.to_string(),
                }
                .into())
            }
            Err(err) if err.kind() != ArgumentNotFound => return Err(err.into()),
            Err(_) => None,
        };
        Ok(DispatchConfig {
            timeout,
            draw_progress: !matches.is_present("no-draw-progress"),
            ..Default::default()
        })
    }

    /// Parse an iterator of arguments, `args` into a `CasapipeContext`.
    ///
    /// # Errors
    ///
    /// Can raise:
    /// - `clap::Error` if clap cannot parse `args`
    /// - `PipelineError::Config` if the recipe can't be read.
    /// - `PipelineError::Context` if the recipe's datasets can't be registered.
    /// - `PipelineError::CLIError` if the arguments are invalid.
    /// - `PipelineError::DryRun` if only the summary was asked for.
    pub fn from_args<I, T>(args: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let recipe_path: PathBuf = matches.value_of_t("recipe")?;
        let recipe = Recipe::from_file(&recipe_path)?;

        let engine = match matches.value_of_t::<PathBuf>("engine") {
            Ok(engine) => engine,
            Err(err) if err.kind() != ArgumentNotFound => return Err(err.into()),
            Err(_) => recipe
                .engine
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE)),
        };
        let output_dir = match matches.value_of_t::<PathBuf>("output-dir") {
            Ok(output_dir) => output_dir,
            Err(err) if err.kind() != ArgumentNotFound => return Err(err.into()),
            Err(_) => recipe
                .output_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let num_workers = Self::parse_num_workers(&matches, &recipe)?;
        let dispatch_config = Self::parse_dispatch_matches(&matches)?;
        let exec_config = ExecutorConfig {
            dry_run: matches.is_present("simulate"),
            ..Default::default()
        };
        let context = recipe.context(&output_dir)?;

        let result = Self {
            recipe_path,
            engine_args: recipe.engine_args.clone(),
            recipe,
            context,
            engine,
            num_workers,
            output_dir,
            exec_config,
            dispatch_config,
        };

        info!("{}", &result);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// Run every stage of the recipe, then write the command log and the context snapshot to
    /// the output directory.
    ///
    /// # Errors
    ///
    /// can raise:
    /// - `PipelineError::Io` if the output directory or command log can't be written
    /// - `PipelineError::Dispatch` if the engine workers can't be started
    /// - `PipelineError::Context` if the context snapshot can't be written
    ///
    /// Stage failures are not errors here; they are in the report.
    pub fn run(self) -> Result<(PipelineReport, HashMap<String, Duration>), PipelineError> {
        let CasapipeContext {
            recipe,
            mut context,
            engine,
            engine_args,
            num_workers,
            output_dir,
            exec_config,
            dispatch_config,
            ..
        } = self;

        create_dir_all(&output_dir)?;

        let engine: Arc<dyn Engine> = Arc::new(CommandEngine::new(engine).with_args(engine_args));
        let pool = LocalWorkerPool::new(Arc::clone(&engine), num_workers, exec_config.dry_run)?;
        let services = StageServices {
            dispatcher: Some(ClusterDispatcher::new(Arc::new(pool), dispatch_config)),
            image_store: Arc::new(EngineImageStore::new()),
        };
        let mut executor = Executor::new(engine, exec_config);

        let report = recipe.pipeline(&services).run(&mut context, &mut executor);

        let commands_path = output_dir.join(COMMANDS_LOG);
        let mut commands = executor.history().join("\n");
        commands.push('\n');
        write(&commands_path, commands)?;
        debug!("wrote {}", commands_path.display());

        let snapshot_path = output_dir.join(CONTEXT_SNAPSHOT);
        context.save(&snapshot_path)?;
        debug!("wrote {}", snapshot_path.display());

        Ok((report, executor.durations().clone()))
    }
}

/// Parse `args`, run the recipe, and log how it went.
///
/// Returns the process exit code: `0` if every stage ran without failing (or only help, the
/// version or the summary was asked for), `1` if arguments were bad or a stage failed, and `2` if
/// the run was aborted.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if let Ok(invocation) = shlex::try_join(args.iter().filter_map(|arg| arg.to_str())) {
        debug!("invoked as: {}", invocation);
    }

    let casapipe_ctx = match CasapipeContext::from_args(args) {
        Ok(casapipe_ctx) => casapipe_ctx,
        Err(DryRun {}) => {
            info!("Dry run. No engine calls will be made.");
            return 0;
        }
        Err(ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match casapipe_ctx.run() {
        Ok((report, durations)) => {
            info!("stage summary:\n{}", summary_table(&report));
            info!(
                "total duration: {:?}",
                durations
                    .into_iter()
                    .sorted_by(|a, b| a.0.cmp(&b.0))
                    .fold(Duration::ZERO, |duration_sum, (name, duration)| {
                        info!("{} duration: {:?}", name, duration);
                        duration_sum + duration
                    })
            );
            if let Some(aborted) = &report.aborted {
                eprintln!("pipeline aborted: {aborted}");
                2
            } else if report.failed().next().is_some() {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("pipeline error: {e}");
            1
        }
    }
}


#[cfg(test)]
mod argparse_tests {
    use crate::{cli::CasapipeContext, error::PipelineError};

    #[test]
    fn test_parse_invalid_workers() {
        let args = vec!["casapipe", "--workers", "0", "recipe.toml"];
        // the recipe is read first
        assert!(matches!(
            CasapipeContext::from_args(&args),
            Err(PipelineError::Config { .. })
        ));

        let tmp_dir = tempfile::tempdir().unwrap();
        let recipe_path = tmp_dir.path().join("recipe.toml");
        std::fs::write(&recipe_path, "").unwrap();
        let recipe_path = recipe_path.display().to_string();

        let args = vec!["casapipe", "--workers", "0", &recipe_path];
        assert!(matches!(
            CasapipeContext::from_args(&args),
            Err(PipelineError::CLIError(_))
        ));

        let args = vec!["casapipe", "--workers", "many", &recipe_path];
        assert!(matches!(
            CasapipeContext::from_args(&args),
            Err(PipelineError::ClapError(_))
        ));
    }

    #[test]
    fn test_parse_invalid_timeout() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let recipe_path = tmp_dir.path().join("recipe.toml");
        std::fs::write(&recipe_path, "").unwrap();
        let recipe_path = recipe_path.display().to_string();

        let args = vec!["casapipe", "--timeout", "0", &recipe_path];
        assert!(matches!(
            CasapipeContext::from_args(&args),
            Err(PipelineError::CLIError(_))
        ));
    }
}
