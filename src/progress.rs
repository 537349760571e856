//! Structured progress events for external observers.
//!
//! The pipeline is the producer; whoever owns the receiving end (the CLI, a
//! dashboard, a test) is the consumer.  Events flow over a lock-free
//! channel and a detached sink drops them for free, so stages emit
//! unconditionally.  No process-wide singletons: the sink handle is passed
//! by reference into every stage.

use std::path::PathBuf;

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Pipeline stages as observers see them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    PartialHash,
    FullHash,
    Probe,
    Fingerprint,
    OverlapSearch,
    Group,
    Report,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Discover      => "discover",
            Stage::PartialHash   => "partial-hash",
            Stage::FullHash      => "full-hash",
            Stage::Probe         => "probe",
            Stage::Fingerprint   => "fingerprint",
            Stage::OverlapSearch => "overlap-search",
            Stage::Group         => "group",
            Stage::Report        => "report",
        }
    }
}

/// Per-file outcome within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Succeeded,
    /// Not attempted: cancelled, excluded, or already terminal.
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageStarted {
        stage: Stage,
        total: usize,
    },
    FileFinished {
        stage:   Stage,
        path:    PathBuf,
        outcome: FileOutcome,
    },
    StageFinished {
        stage:     Stage,
        succeeded: usize,
        skipped:   usize,
        failed:    usize,
    },
    Interrupted,
}

/// Cloneable sending half.  Detached sinks are free to emit into.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<Sender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink with a live consumer.
    pub fn attached() -> (Self, Receiver<ProgressEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Emit one event.  A gone consumer is indistinguishable from a
    /// detached sink — emission never fails or blocks.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_sink_delivers_in_order() {
        let (sink, rx) = ProgressSink::attached();
        sink.emit(ProgressEvent::StageStarted { stage: Stage::PartialHash, total: 2 });
        sink.emit(ProgressEvent::StageFinished {
            stage:     Stage::PartialHash,
            succeeded: 2,
            skipped:   0,
            failed:    0,
        });
        drop(sink);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::StageStarted { total: 2, .. }));
        assert!(matches!(events[1], ProgressEvent::StageFinished { succeeded: 2, .. }));
    }

    #[test]
    fn detached_sink_swallows_events() {
        let sink = ProgressSink::detached();
        sink.emit(ProgressEvent::Interrupted); // must not panic or block
    }

    #[test]
    fn dropped_receiver_is_harmless() {
        let (sink, rx) = ProgressSink::attached();
        drop(rx);
        sink.emit(ProgressEvent::Interrupted);
    }
}
