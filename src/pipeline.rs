//! A three stage external tool pipeline built on top of the task model.
//!
//! ```text
//! Pipeline ── prepare ──> WriteArtifactTask   (input artifact in scratch)
//!          <─ finished ── spawn ProcessTask    (the tool itself)
//!          <─ finished ── nothing more
//!          ── cleanup ──> scratch directory removed
//! ```
//!
//! What the tool is and how its arguments look is decided by a
//! [`PipelineSettings`] implementation; the pipeline only sequences the
//! stages and owns the directories.
use std::fs;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::engine::{ChildReport, Children, TaskContext, TypedTask, boxed};
use crate::error::{TaskError, TaskResult};
use crate::process::{Invocation, ProcessOutput, ProcessRunner, ProcessTask, ToolCommand, resolve};
use crate::scratch::create_output_dir;

/// Serializes the input records of a pipeline into a file.
pub trait ArtifactWriter: Send + 'static {
    /// File extension of the artifact, without the dot.
    fn extension(&self) -> &str;

    fn write(&mut self, path: &Utf8Path) -> anyhow::Result<()>;
}

/// Records written one per line, e.g. BED intervals already rendered to text.
#[derive(Debug, Clone)]
pub struct TextRecords {
    records: Vec<String>,
    extension: String,
}

impl TextRecords {
    pub fn new(records: Vec<String>, extension: impl Into<String>) -> Self {
        Self {
            records,
            extension: extension.into(),
        }
    }
}

impl ArtifactWriter for TextRecords {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn write(&mut self, path: &Utf8Path) -> anyhow::Result<()> {
        let mut data = self.records.join("\n");
        if !data.is_empty() {
            data.push('\n');
        }

        fs::write(path, data).with_context(|| format!("Couldn't write {path}"))
    }
}

/// Materializes an input artifact at a fixed path.
pub struct WriteArtifactTask {
    name: String,
    writer: Box<dyn ArtifactWriter>,
    path: Utf8PathBuf,
    done: bool,
}

impl WriteArtifactTask {
    pub fn new(
        name: impl Into<String>,
        writer: Box<dyn ArtifactWriter>,
        path: Utf8PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            writer,
            path,
            done: false,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl TypedTask for WriteArtifactTask {
    type Output = Utf8PathBuf;

    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn run(&mut self, context: &TaskContext) -> TaskResult<Children> {
        context.check_canceled()?;
        self.writer.write(&self.path)?;
        self.done = true;
        Ok(Vec::new())
    }

    fn output(&mut self) -> Option<Self::Output> {
        self.done.then(|| self.path.clone())
    }
}

/// A file the tool is expected to produce, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    File(Utf8PathBuf),
    /// A glob pattern, e.g. `*.png`.
    Glob(String),
}

/// Everything a concrete tool contributes to a [`Pipeline`].
pub trait PipelineSettings: Send + 'static {
    fn tool(&self) -> ToolCommand;

    /// Command line for a run reading `input` and writing into `output_dir`.
    fn arguments(&self, input: &Utf8Path, output_dir: &Utf8Path) -> Vec<String>;

    /// Directories the tool needs on its search path.
    fn auxiliary_dirs(&self) -> Vec<Utf8PathBuf> {
        Vec::new()
    }

    fn expected_outputs(&self) -> Vec<Expected> {
        Vec::new()
    }
}

/// Outputs of a finished pipeline.
///
/// Nothing is cached: [`existing`](Self::existing) looks at the disk every
/// time it is called, so files removed or produced later are reflected.
#[derive(Debug, Clone)]
pub struct Artifacts {
    dir: Utf8PathBuf,
    expected: Vec<Expected>,
    log: String,
}

impl Artifacts {
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Captured output of the tool.
    pub fn log(&self) -> &str {
        &self.log
    }

    pub fn existing(&self) -> Vec<Utf8PathBuf> {
        let mut found = Vec::new();

        for expected in &self.expected {
            match expected {
                Expected::File(path) => {
                    let path = resolve(&self.dir, path);
                    if path.exists() {
                        found.push(path);
                    }
                }
                Expected::Glob(pattern) => {
                    let dir = glob::Pattern::escape(self.dir.as_str());
                    let pattern = format!("{dir}/{pattern}");
                    let Ok(paths) = glob::glob(&pattern) else {
                        tracing::warn!("invalid output pattern '{pattern}'");
                        continue;
                    };

                    found.extend(
                        paths
                            .filter_map(Result::ok)
                            .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok()),
                    );
                }
            }
        }

        found
    }
}

/// Runs one external tool over an input artifact.
pub struct Pipeline<S> {
    name: String,
    settings: S,
    runner: Arc<dyn ProcessRunner>,
    writer: Option<Box<dyn ArtifactWriter>>,
    input_name: String,
    scratch_hint: String,
    output_root: Utf8PathBuf,
    output_subdir: String,
    output_dir: Option<Utf8PathBuf>,
    log: String,
}

impl<S> Pipeline<S>
where
    S: PipelineSettings,
{
    pub fn new(
        name: impl Into<String>,
        settings: S,
        writer: impl ArtifactWriter,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let name = name.into();

        Self {
            scratch_hint: format!("{name}_tmp"),
            output_subdir: name.clone(),
            name,
            settings,
            runner,
            writer: Some(Box::new(writer)),
            input_name: String::from("input"),
            output_root: Utf8PathBuf::from("."),
            output_dir: None,
            log: String::new(),
        }
    }

    /// Base name of the input artifact, e.g. `treatment`.
    pub fn input_name(mut self, name: impl Into<String>) -> Self {
        self.input_name = name.into();
        self
    }

    pub fn scratch_hint(mut self, hint: impl Into<String>) -> Self {
        self.scratch_hint = hint.into();
        self
    }

    /// Results are written into `<root>/<subdir>`, disambiguated with a
    /// numeric suffix if that directory already exists.
    pub fn output_to(mut self, root: impl Into<Utf8PathBuf>, subdir: impl Into<String>) -> Self {
        self.output_root = root.into();
        self.output_subdir = subdir.into();
        self
    }
}

impl<S> TypedTask for Pipeline<S>
where
    S: PipelineSettings,
{
    type Output = Artifacts;

    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn prepare(&mut self, context: &TaskContext) -> TaskResult<Children> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| {
                TaskError::preparation(context.name(), "pipeline was already prepared")
            })?;

        let scratch = context.scratch_dir(&self.scratch_hint).map_err(|e| {
            TaskError::preparation(context.name(), "couldn't create scratch directory")
                .with_source(e)
        })?;

        let output_dir =
            create_output_dir(&self.output_root, &self.output_subdir).map_err(|e| {
                TaskError::preparation(context.name(), "couldn't create output directory")
                    .with_source(e)
            })?;
        self.output_dir = Some(output_dir);

        let input = scratch.join(format!("{}.{}", self.input_name, writer.extension()));
        let name = format!("{}: {}", self.name, self.input_name);
        let write = WriteArtifactTask::new(name, writer, input);

        Ok(vec![boxed(write)])
    }

    fn on_child_finished(
        &mut self,
        context: &TaskContext,
        child: &ChildReport,
    ) -> TaskResult<Children> {
        if context.is_canceled() || !child.is_finished() {
            return Ok(Vec::new());
        }

        if child.is::<WriteArtifactTask>() {
            let (Some(input), Some(output_dir)) = (child.output::<Utf8PathBuf>(), &self.output_dir)
            else {
                let err = TaskError::execution(context.name(), "input artifact is missing");
                return Err(err.into());
            };

            let invocation = Invocation::new(self.settings.tool())
                .args(self.settings.arguments(input, output_dir))
                .working_dir(output_dir.clone())
                .extra_dirs(self.settings.auxiliary_dirs());

            let name = format!("{}: {}", self.name, invocation.tool.display_name());
            let process = ProcessTask::new(name, invocation, self.runner.clone());
            return Ok(vec![boxed(process)]);
        }

        if let Some(output) = child.output::<ProcessOutput>() {
            self.log = output.log.clone();
        }

        Ok(Vec::new())
    }

    fn cleanup(&mut self, context: &TaskContext) -> TaskResult<()> {
        for failure in context.scratch().release(context.id()) {
            context.warn(failure);
        }
        Ok(())
    }

    fn output(&mut self) -> Option<Self::Output> {
        Some(Artifacts {
            dir: self.output_dir.clone()?,
            expected: self.settings.expected_outputs(),
            log: std::mem::take(&mut self.log),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;

    use super::*;
    use crate::core::{CancelToken, TaskState};
    use crate::error::{ErrorKind, ProcessError};
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::scratch::ScratchSpace;

    struct SeqPos;

    impl PipelineSettings for SeqPos {
        fn tool(&self) -> ToolCommand {
            ToolCommand::new("MDSeqPos.py").with_runner("python")
        }

        fn arguments(&self, input: &Utf8Path, output_dir: &Utf8Path) -> Vec<String> {
            vec![
                input.to_string(),
                String::from("hg19"),
                format!("--output={output_dir}"),
            ]
        }

        fn auxiliary_dirs(&self) -> Vec<Utf8PathBuf> {
            vec![Utf8PathBuf::from("/opt/cistrome/lib")]
        }

        fn expected_outputs(&self) -> Vec<Expected> {
            vec![
                Expected::File(Utf8PathBuf::from("results.html")),
                Expected::Glob(String::from("*.png")),
            ]
        }
    }

    /// Records what it saw and pretends to be the tool.
    struct Scripted {
        code: i32,
        outputs: Vec<&'static str>,
        seen: Mutex<Vec<(Invocation, bool)>>,
    }

    impl Scripted {
        fn new(code: i32, outputs: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                code,
                outputs,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessRunner for Scripted {
        fn run(
            &self,
            invocation: &Invocation,
            _: &CancelToken,
        ) -> Result<ProcessOutput, ProcessError> {
            let input = Utf8PathBuf::from(&invocation.args[0]);
            self.seen
                .lock()
                .unwrap()
                .push((invocation.clone(), input.exists()));

            if let Some(dir) = &invocation.working_dir {
                for name in &self.outputs {
                    fs::write(dir.join(name), "").unwrap();
                }
            }

            Ok(ProcessOutput {
                code: Some(self.code),
                success: self.code == 0,
                log: format!("exit {}", self.code),
            })
        }
    }

    struct Setup {
        dir: TempDir,
        scheduler: Scheduler,
    }

    impl Setup {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap().join("scratch");
            let scheduler = Scheduler::new(SchedulerConfig::default().workers(2))
                .unwrap()
                .with_scratch(Arc::new(ScratchSpace::new(root)));

            Self { dir, scheduler }
        }

        fn out(&self) -> Utf8PathBuf {
            Utf8Path::from_path(self.dir.path()).unwrap().join("out")
        }

        fn pipeline(&self, runner: Arc<Scripted>) -> Pipeline<SeqPos> {
            let records = TextRecords::new(vec!["chr1\t100\t200".into()], "bed");

            Pipeline::new("SeqPos", SeqPos, records, runner)
                .input_name("treatment")
                .scratch_hint("SeqPos_tmp")
                .output_to(self.out(), "SeqPos")
        }

        fn scratch_is_empty(&self) -> bool {
            let root = self.scheduler.scratch().root();
            !root.exists() || fs::read_dir(root).unwrap().next().is_none()
        }
    }

    #[test]
    fn test_tool_failure() {
        let setup = Setup::new();
        let runner = Scripted::new(1, Vec::new());

        let handle = setup.scheduler.submit(setup.pipeline(runner.clone())).unwrap();
        assert_eq!(handle.wait(), TaskState::Failed);

        let err = handle.result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert!(err.is_child_failure());
        assert_eq!(err.trail(), ["SeqPos"]);

        // The artifact was in place while the tool ran, and is gone now.
        let seen = runner.seen.lock().unwrap();
        let (invocation, existed) = &seen[0];
        assert!(*existed);
        assert_eq!(invocation.args[0].rsplit('/').next(), Some("treatment.bed"));
        assert!(invocation.args[0].contains("SeqPos_tmp_"));
        assert!(!Utf8Path::new(&invocation.args[0]).exists());
        assert!(setup.scratch_is_empty());
    }

    #[test]
    fn test_outputs_are_checked_lazily() {
        let setup = Setup::new();
        let runner = Scripted::new(0, vec!["results.html", "logo1.png", "logo2.png"]);

        let handle = setup.scheduler.submit(setup.pipeline(runner.clone())).unwrap();
        let artifacts = handle.output::<Artifacts>().unwrap().unwrap();

        assert_eq!(artifacts.dir(), setup.out().join("SeqPos").as_path());
        assert_eq!(artifacts.log(), "exit 0");
        assert_eq!(artifacts.existing().len(), 3);

        fs::remove_file(artifacts.dir().join("logo1.png")).unwrap();
        assert_eq!(artifacts.existing().len(), 2);

        // The output directory survives cleanup, scratch does not.
        assert!(artifacts.dir().is_dir());
        assert!(setup.scratch_is_empty());

        let seen = runner.seen.lock().unwrap();
        let (invocation, _) = &seen[0];
        assert_eq!(invocation.tool.runner.as_deref(), Some(Utf8Path::new("python")));
        assert_eq!(invocation.extra_dirs, [Utf8PathBuf::from("/opt/cistrome/lib")]);
        assert_eq!(invocation.working_dir.as_deref(), Some(artifacts.dir()));
    }

    #[test]
    fn test_output_dir_is_disambiguated() {
        let setup = Setup::new();

        let first = setup
            .scheduler
            .submit(setup.pipeline(Scripted::new(0, Vec::new())))
            .unwrap();
        let first = first.output::<Artifacts>().unwrap().unwrap();

        let second = setup
            .scheduler
            .submit(setup.pipeline(Scripted::new(0, Vec::new())))
            .unwrap();
        let second = second.output::<Artifacts>().unwrap().unwrap();

        assert_eq!(first.dir().file_name(), Some("SeqPos"));
        assert_eq!(second.dir().file_name(), Some("SeqPos_1"));
    }

    #[test]
    fn test_preparation_failure_spawns_nothing() {
        let setup = Setup::new();
        let runner = Scripted::new(0, Vec::new());

        // A file where the output root should be.
        let blocked = setup.out();
        fs::write(&blocked, "").unwrap();

        let handle = setup.scheduler.submit(setup.pipeline(runner.clone())).unwrap();
        assert_eq!(handle.wait(), TaskState::Failed);

        let err = handle.result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Preparation);
        assert!(runner.seen.lock().unwrap().is_empty());
        assert!(setup.scratch_is_empty());

        let diagnostics = handle.diagnostics().unwrap();
        assert_eq!(diagnostics.records.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_with_system_shell() {
        struct Shell;

        impl PipelineSettings for Shell {
            fn tool(&self) -> ToolCommand {
                ToolCommand::new("/bin/sh")
            }

            fn arguments(&self, input: &Utf8Path, _: &Utf8Path) -> Vec<String> {
                vec![
                    String::from("-c"),
                    format!("wc -l < '{input}' > count.txt"),
                ]
            }

            fn expected_outputs(&self) -> Vec<Expected> {
                vec![Expected::File(Utf8PathBuf::from("count.txt"))]
            }
        }

        let setup = Setup::new();
        let records = TextRecords::new(vec!["a".into(), "b".into(), "c".into()], "txt");
        let runner = Arc::new(crate::process::SystemProcessRunner::default());
        let pipeline =
            Pipeline::new("count", Shell, records, runner).output_to(setup.out(), "count");

        let handle = setup.scheduler.submit(pipeline).unwrap();
        let artifacts = handle.output::<Artifacts>().unwrap().unwrap();

        let existing = artifacts.existing();
        assert_eq!(existing.len(), 1);
        assert_eq!(fs::read_to_string(&existing[0]).unwrap().trim(), "3");
    }
}
