//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use docflow::config::{LaneConfig, ResourceLimits};
use docflow::executor::{WorkerPool, WorkerPoolConfig};
use docflow::processor::{
    shared, ContextView, ProcessFuture, Processor, ProcessorError, ProcessorMetadata,
    ProcessorRegistry, ResourceProfile, StageOutput,
};

/// What a [`TestProcessor`] does when called.
#[derive(Clone, Debug)]
pub enum Behaviour {
    /// Returns the sorted names of its inputs, joined by commas.
    EchoInputs,
    /// Returns the document's source.
    EchoSource,
    /// Fails with a recoverable error every time.
    FailRecoverable,
    /// Fails with an unrecoverable error every time.
    FailUnrecoverable,
    /// Fails recoverably for the first `n` calls, then echoes inputs.
    FlakyFor(usize),
    /// Sleeps, then echoes inputs.
    Sleep(Duration),
    /// Waits for cancellation on the first call; later calls echo inputs.
    BlockFirstCall,
    /// Waits for cancellation on every call.
    WaitForCancel,
    /// Returns a byte payload of the given size.
    Payload(usize),
    /// Reports 25/50/75% progress before finishing.
    ReportProgress,
    /// Panics.
    Panic,
}

/// Configurable processor that counts calls and peak concurrency.
pub struct TestProcessor {
    name: String,
    profile: ResourceProfile,
    behaviour: Behaviour,
    calls: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TestProcessor {
    pub fn new(name: &str, behaviour: Behaviour) -> Self {
        Self {
            name: name.to_string(),
            profile: ResourceProfile::Io,
            behaviour,
            calls: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_profile(mut self, profile: ResourceProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Shares running/peak counters with other processors.
    pub fn with_counters(mut self, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        self.running = running;
        self.peak = peak;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn run(&self, view: &ContextView, call: usize) -> Result<StageOutput, ProcessorError> {
        match &self.behaviour {
            Behaviour::EchoInputs => Ok(echo(view)),
            Behaviour::EchoSource => Ok(StageOutput::text(view.document().source.clone())),
            Behaviour::FailRecoverable => Err(ProcessorError::recoverable("temporary failure")),
            Behaviour::FailUnrecoverable => Err(ProcessorError::unrecoverable("bad document")),
            Behaviour::FlakyFor(n) => {
                if call <= *n {
                    Err(ProcessorError::recoverable(format!("flake {}", call)))
                } else {
                    Ok(echo(view))
                }
            }
            Behaviour::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(echo(view))
            }
            Behaviour::BlockFirstCall if call == 1 => {
                view.cancelled().await;
                Err(ProcessorError::Cancelled)
            }
            Behaviour::BlockFirstCall => Ok(echo(view)),
            Behaviour::WaitForCancel => {
                view.cancelled().await;
                Err(ProcessorError::Cancelled)
            }
            Behaviour::Payload(size) => Ok(StageOutput::Bytes(Bytes::from(vec![7u8; *size]))),
            Behaviour::ReportProgress => {
                for percent in [25.0, 50.0, 75.0] {
                    view.report_progress(percent);
                    tokio::task::yield_now().await;
                }
                Ok(echo(view))
            }
            Behaviour::Panic => panic!("processor exploded"),
        }
    }
}

impl Processor for TestProcessor {
    fn capabilities(&self) -> ProcessorMetadata {
        ProcessorMetadata::new(self.name.clone()).with_profile(self.profile)
    }

    fn process<'a>(&'a self, view: &'a ContextView) -> ProcessFuture<'a> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = self.run(view, call).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }
}

fn echo(view: &ContextView) -> StageOutput {
    let mut names: Vec<&str> = view.inputs().keys().map(String::as_str).collect();
    names.sort_unstable();
    StageOutput::text(names.join(","))
}

/// Registers each processor under its own name.
pub fn registry(processors: &[Arc<TestProcessor>]) -> Arc<ProcessorRegistry> {
    let registry = Arc::new(ProcessorRegistry::new());
    for processor in processors {
        registry
            .register(processor.name.clone(), shared(Arc::clone(processor)))
            .unwrap();
    }
    registry
}

pub fn processor(name: &str, behaviour: Behaviour) -> Arc<TestProcessor> {
    Arc::new(TestProcessor::new(name, behaviour))
}

/// Default limits with short shutdown grace periods.
pub fn pool(limits: ResourceLimits) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(
        WorkerPoolConfig::new(limits)
            .with_shutdown_grace(Duration::from_millis(200))
            .with_cancel_grace(Duration::from_millis(50)),
    ))
}

pub fn io_limits(io: LaneConfig) -> ResourceLimits {
    ResourceLimits {
        io,
        ..ResourceLimits::default()
    }
}

/// Polls `condition` every few milliseconds for up to two seconds.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
