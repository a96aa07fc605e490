//! Test support utilities shared across unit and integration tests.
//!
//! Every double here records what it was asked to do behind a
//! `parking_lot` mutex so clones handed to the code under test share their
//! journal with the copy the test keeps for assertions.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::config::{BuildSettings, Communicator, Timeouts};
use crate::driver::{
    Driver, DriverError, DriverFuture, ImageHandle, ImageMetadata, ImageRequest, ImageState,
    MachineHandle, MachineNetworking, MachineRequest, MachineState, SourceImageQuery,
};
use crate::hook::{Hook, HookError, HookFuture};
use crate::remote::{CommandError, CommandOutput, CommandRunner};
use crate::state::{StateBag, keys};
use crate::step::{Step, StepAction, StepError, StepFuture, halt_with};
use crate::ui::{ReadCloser, Ui, UiError};

/// In-memory writer whose clones share one buffer.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, decoded lossily.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct StreamState {
    cursor: Cursor<Vec<u8>>,
    closes: usize,
}

/// Readable stream that counts how often it was closed.
#[derive(Clone, Debug)]
pub struct RecordingStream {
    inner: Arc<Mutex<StreamState>>,
}

impl RecordingStream {
    /// Creates a stream yielding `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StreamState {
                cursor: Cursor::new(bytes),
                closes: 0,
            })),
        }
    }

    /// Number of `close` calls observed.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.inner.lock().closes
    }
}

impl Read for RecordingStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().cursor.read(buf)
    }
}

impl ReadCloser for RecordingStream {
    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().closes += 1;
        Ok(())
    }
}

/// A single call observed by [`RecordingUi`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UiCall {
    /// `say`.
    Say(String),
    /// `message`.
    Message(String),
    /// `error`.
    Error(String),
    /// `machine`.
    Machine {
        /// Event type.
        event_type: String,
        /// Event arguments.
        args: Vec<String>,
    },
    /// `ask`.
    Ask(String),
    /// `track_progress`.
    TrackProgress {
        /// Progress label.
        label: String,
        /// Bytes already transferred.
        current: u64,
        /// Expected total.
        total: u64,
    },
}

/// UI that records every call and writes nothing.
#[derive(Debug, Default)]
pub struct RecordingUi {
    calls: Mutex<Vec<UiCall>>,
    answer: Option<String>,
}

impl RecordingUi {
    /// Creates a recorder whose `ask` is unsupported.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every `ask` with `answer`.
    #[must_use]
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = Some(answer.into());
        self
    }

    /// Snapshot of all calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<UiCall> {
        self.calls.lock().clone()
    }

    /// Messages passed to `say`.
    #[must_use]
    pub fn says(&self) -> Vec<String> {
        self.filter(|call| match call {
            UiCall::Say(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Messages passed to `message`.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.filter(|call| match call {
            UiCall::Message(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Messages passed to `error`.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.filter(|call| match call {
            UiCall::Error(text) => Some(text.clone()),
            _ => None,
        })
    }

    /// Queries passed to `ask`.
    #[must_use]
    pub fn questions(&self) -> Vec<String> {
        self.filter(|call| match call {
            UiCall::Ask(text) => Some(text.clone()),
            _ => None,
        })
    }

    fn filter(&self, select: impl Fn(&UiCall) -> Option<String>) -> Vec<String> {
        self.calls.lock().iter().filter_map(select).collect()
    }

    fn record(&self, call: UiCall) {
        self.calls.lock().push(call);
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.record(UiCall::Say(message.to_owned()));
    }

    fn message(&self, message: &str) {
        self.record(UiCall::Message(message.to_owned()));
    }

    fn error(&self, message: &str) {
        self.record(UiCall::Error(message.to_owned()));
    }

    fn machine(&self, event_type: &str, args: &[&str]) {
        self.record(UiCall::Machine {
            event_type: event_type.to_owned(),
            args: args.iter().map(|arg| (*arg).to_owned()).collect(),
        });
    }

    fn ask(&self, query: &str) -> Result<String, UiError> {
        self.record(UiCall::Ask(query.to_owned()));
        self.answer.clone().ok_or(UiError::Unsupported)
    }

    fn track_progress(
        &self,
        label: &str,
        current: u64,
        total: u64,
        stream: Box<dyn ReadCloser>,
    ) -> Box<dyn ReadCloser> {
        self.record(UiCall::TrackProgress {
            label: label.to_owned(),
            current,
            total,
        });
        stream
    }
}

/// Ordered, shareable list of events written by scripted doubles.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of the entries in order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// Hook that journals `label:name` for every invocation.
#[derive(Clone, Debug)]
pub struct RecordingHook {
    label: String,
    journal: Journal,
    failure: Option<String>,
}

impl RecordingHook {
    /// Creates a succeeding hook with its own journal.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            journal: Journal::new(),
            failure: None,
        }
    }

    /// Writes to `journal` instead of a private one.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Makes every invocation fail with `message`.
    #[must_use]
    pub fn fail_with(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Journal the hook writes to.
    #[must_use]
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

impl Hook for RecordingHook {
    fn run<'a>(
        &'a self,
        name: &'a str,
        _state: &'a StateBag,
        cancel: &'a CancellationToken,
    ) -> HookFuture<'a> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(HookError::Cancelled {
                    hook: name.to_owned(),
                });
            }
            self.journal.push(format!("{}:{name}", self.label));
            self.failure.as_ref().map_or(Ok(()), |message| {
                Err(HookError::Failed {
                    hook: name.to_owned(),
                    message: message.clone(),
                })
            })
        })
    }
}

/// Step whose behaviour is scripted by the test.
///
/// Journals `run:NAME` and `cleanup:NAME`.
#[derive(Clone, Debug)]
pub struct ScriptedStep {
    name: String,
    journal: Journal,
    action: StepAction,
    error: Option<String>,
    cleanup_error: Option<String>,
    cancel_during_run: Option<CancellationToken>,
    overwrite_error_in_cleanup: bool,
}

impl ScriptedStep {
    /// Creates a step that continues and cleans up successfully.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: Journal) -> Self {
        Self {
            name: name.into(),
            journal,
            action: StepAction::Continue,
            error: None,
            cleanup_error: None,
            cancel_during_run: None,
            overwrite_error_in_cleanup: false,
        }
    }

    /// Returns [`StepAction::Halt`] without recording an error.
    #[must_use]
    pub const fn halting(mut self) -> Self {
        self.action = StepAction::Halt;
        self
    }

    /// Records `message` as the run error and halts.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// Fails cleanup with `message`.
    #[must_use]
    pub fn failing_cleanup(mut self, message: impl Into<String>) -> Self {
        self.cleanup_error = Some(message.into());
        self
    }

    /// Cancels `token` while running, then continues.
    #[must_use]
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_during_run = Some(token);
        self
    }

    /// Writes a different error to the bag during cleanup.
    #[must_use]
    pub const fn overwriting_error_in_cleanup(mut self) -> Self {
        self.overwrite_error_in_cleanup = true;
        self
    }

    /// Boxes the step for a runner.
    #[must_use]
    pub fn boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }
}

impl Step for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(
        &'a self,
        state: &'a StateBag,
        _cancel: &'a CancellationToken,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            self.journal.push(format!("run:{}", self.name));
            if let Some(token) = &self.cancel_during_run {
                token.cancel();
            }
            match &self.error {
                Some(message) => halt_with(state, StepError::failed(&self.name, message.clone())),
                None => self.action,
            }
        })
    }

    fn cleanup<'a>(&'a self, state: &'a StateBag) -> StepFuture<'a, Result<(), StepError>> {
        Box::pin(async move {
            self.journal.push(format!("cleanup:{}", self.name));
            if self.overwrite_error_in_cleanup {
                state.put(
                    keys::ERROR,
                    StepError::failed(&self.name, "written during cleanup"),
                );
            }
            self.cleanup_error
                .as_ref()
                .map_or(Ok(()), |message| Err(StepError::failed(&self.name, message.clone())))
        })
    }
}

/// Driver operations that [`FakeDriver`] can be scripted to fail.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DriverOperation {
    /// `source_image`.
    SourceImage,
    /// `create_machine`.
    CreateMachine,
    /// `machine_state`.
    MachineState,
    /// `machine_networking`.
    MachineNetworking,
    /// `stop_machine`.
    StopMachine,
    /// `delete_machine`.
    DeleteMachine,
    /// `create_image_from_machine`.
    CreateImage,
    /// `image_state`.
    ImageState,
    /// `tag_image`.
    TagImage,
    /// `delete_image`.
    DeleteImage,
}

impl DriverOperation {
    /// Reports whether the operation only reads provider state.
    #[must_use]
    pub const fn is_describe(self) -> bool {
        matches!(
            self,
            Self::SourceImage | Self::MachineState | Self::MachineNetworking | Self::ImageState
        )
    }
}

/// A single invocation recorded by [`FakeDriver`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriverCall {
    /// Operation invoked.
    pub operation: DriverOperation,
    /// Identifier or name the operation targeted.
    pub target: String,
}

#[derive(Debug)]
struct FakeState {
    calls: Vec<DriverCall>,
    failures: HashSet<DriverOperation>,
    cancel_on: HashMap<DriverOperation, CancellationToken>,
    machines: HashMap<String, MachineState>,
    images: HashMap<String, ImageState>,
    tags: HashMap<String, Vec<String>>,
    image_outcome: ImageState,
    networking: MachineNetworking,
    next_id: u32,
}

/// Deterministic in-memory driver.
///
/// Machines start `Running`, stop immediately, and vanish on delete. New
/// images report the configured outcome, `Available` by default.
#[derive(Clone, Debug)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
    poll_interval: Duration,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    /// Creates a driver with no machines or images.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                calls: Vec::new(),
                failures: HashSet::new(),
                cancel_on: HashMap::new(),
                machines: HashMap::new(),
                images: HashMap::new(),
                tags: HashMap::new(),
                image_outcome: ImageState::Available,
                networking: MachineNetworking {
                    public_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    ssh_port: 22,
                },
                next_id: 0,
            })),
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Makes `operation` fail with a provider error.
    #[must_use]
    pub fn fail_on(self, operation: DriverOperation) -> Self {
        self.state.lock().failures.insert(operation);
        self
    }

    /// Cancels `token` when `operation` is invoked.
    #[must_use]
    pub fn cancel_on(self, operation: DriverOperation, token: CancellationToken) -> Self {
        self.state.lock().cancel_on.insert(operation, token);
        self
    }

    /// State reported for every image created from now on.
    #[must_use]
    pub fn with_image_outcome(self, outcome: ImageState) -> Self {
        self.state.lock().image_outcome = outcome;
        self
    }

    /// Networking reported for every machine.
    #[must_use]
    pub fn with_networking(self, networking: MachineNetworking) -> Self {
        self.state.lock().networking = networking;
        self
    }

    /// All recorded calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    /// Recorded calls that changed provider state, in order.
    #[must_use]
    pub fn mutations(&self) -> Vec<DriverOperation> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|call| call.operation)
            .filter(|operation| !operation.is_describe())
            .collect()
    }

    /// Identifiers of machines that still exist, sorted.
    #[must_use]
    pub fn machines(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().machines.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Identifiers of images that still exist, sorted.
    #[must_use]
    pub fn images(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.state.lock().images.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tags applied to `image_id`.
    #[must_use]
    pub fn image_tags(&self, image_id: &str) -> Vec<String> {
        self.state
            .lock()
            .tags
            .get(image_id)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self, operation: DriverOperation, target: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall {
            operation,
            target: target.to_owned(),
        });
        if let Some(token) = state.cancel_on.get(&operation) {
            token.cancel();
        }
        if state.failures.contains(&operation) {
            return Err(DriverError::Provider {
                message: format!("scripted failure for {operation:?}"),
            });
        }
        Ok(())
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

impl Driver for FakeDriver {
    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn source_image<'a>(&'a self, query: &'a SourceImageQuery) -> DriverFuture<'a, ImageMetadata> {
        Box::pin(async move {
            self.enter(DriverOperation::SourceImage, &query.label)?;
            Ok(ImageMetadata {
                id: String::from("src-image"),
                name: query.label.clone(),
                architecture: query.architecture.clone(),
                creation_date: String::from("2024-04-25T00:00:00Z"),
            })
        })
    }

    fn create_machine<'a>(
        &'a self,
        request: &'a MachineRequest,
    ) -> DriverFuture<'a, MachineHandle> {
        Box::pin(async move {
            request.validate()?;
            self.enter(DriverOperation::CreateMachine, &request.name)?;
            let id = self.next_id("srv");
            self.state
                .lock()
                .machines
                .insert(id.clone(), MachineState::Running);
            Ok(MachineHandle {
                id,
                zone: request.zone.clone(),
            })
        })
    }

    fn machine_state<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, Option<MachineState>> {
        Box::pin(async move {
            self.enter(DriverOperation::MachineState, &handle.id)?;
            Ok(self.state.lock().machines.get(&handle.id).cloned())
        })
    }

    fn machine_networking<'a>(
        &'a self,
        handle: &'a MachineHandle,
    ) -> DriverFuture<'a, MachineNetworking> {
        Box::pin(async move {
            self.enter(DriverOperation::MachineNetworking, &handle.id)?;
            Ok(self.state.lock().networking)
        })
    }

    fn stop_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.enter(DriverOperation::StopMachine, &handle.id)?;
            let mut state = self.state.lock();
            let machine = state
                .machines
                .get_mut(&handle.id)
                .ok_or_else(|| DriverError::NotFound {
                    resource: format!("machine {}", handle.id),
                })?;
            *machine = MachineState::Stopped;
            Ok(())
        })
    }

    fn delete_machine<'a>(&'a self, handle: &'a MachineHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.enter(DriverOperation::DeleteMachine, &handle.id)?;
            self.state.lock().machines.remove(&handle.id);
            Ok(())
        })
    }

    fn create_image_from_machine<'a>(
        &'a self,
        handle: &'a MachineHandle,
        request: &'a ImageRequest,
    ) -> DriverFuture<'a, ImageHandle> {
        Box::pin(async move {
            self.enter(DriverOperation::CreateImage, &request.name)?;
            if !self.state.lock().machines.contains_key(&handle.id) {
                return Err(DriverError::NotFound {
                    resource: format!("machine {}", handle.id),
                });
            }
            let id = self.next_id("img");
            let mut state = self.state.lock();
            let outcome = state.image_outcome.clone();
            state.images.insert(id.clone(), outcome);
            Ok(ImageHandle {
                id,
                zone: handle.zone.clone(),
            })
        })
    }

    fn image_state<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, Option<ImageState>> {
        Box::pin(async move {
            self.enter(DriverOperation::ImageState, &image.id)?;
            Ok(self.state.lock().images.get(&image.id).cloned())
        })
    }

    fn tag_image<'a>(&'a self, image: &'a ImageHandle, tags: &'a [String]) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.enter(DriverOperation::TagImage, &image.id)?;
            self.state
                .lock()
                .tags
                .insert(image.id.clone(), tags.to_vec());
            Ok(())
        })
    }

    fn delete_image<'a>(&'a self, image: &'a ImageHandle) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.enter(DriverOperation::DeleteImage, &image.id)?;
            self.state
                .lock()
                .images
                .remove(&image.id)
                .map(|_| ())
                .ok_or_else(|| DriverError::NotFound {
                    resource: format!("image {}", image.id),
                })
        })
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.lock().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.lock().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Build settings with short timeouts and no communicator.
#[must_use]
pub fn sample_settings() -> BuildSettings {
    BuildSettings {
        source: SourceImageQuery {
            label: String::from("Ubuntu 24.04 Noble Numbat"),
            architecture: String::from("x86_64"),
            zone: String::from("fr-par-1"),
            project_id: String::from("project"),
            organisation_id: None,
        },
        machine_name: String::from("kiln-test"),
        instance_type: String::from("DEV1-S"),
        image: ImageRequest {
            name: String::from("web-base"),
            tags: vec![String::from("web")],
        },
        communicator: Communicator::None,
        ssh_user: String::from("root"),
        ssh_port: 22,
        ssh_identity_file: None,
        timeouts: Timeouts {
            ssh: Duration::from_millis(50),
            machine_state: Duration::from_secs(1),
            image: Duration::from_secs(1),
        },
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding a global mutex.
    ///
    /// `None` values remove the variable for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
