//! Translator detection search
//!
//! A pure state machine: the orchestrator asks for the next step, runs the
//! named translator's detection routine (possibly asynchronously) and records
//! the outcome before asking again. Only one candidate is ever in flight.

use super::types::{Detection, FoundTranslator, Mode, TranslatorDescriptor};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What the driver should do next
#[derive(Debug)]
pub enum SearchStep {
    /// Run this translator's detection routine, then call `record`
    Detect(Arc<TranslatorDescriptor>),
    /// Search finished; the found set in candidate order (possibly empty)
    Finished(Vec<FoundTranslator>),
    /// The running flag was cleared; deliver nothing
    Cancelled,
}

/// What detection runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget {
    /// Metadata-only query: every candidate is accepted without detection
    Unbound,
    /// Bound to input with no path or URL (e.g. an in-memory string), so
    /// the pattern pre-filter cannot apply
    Anonymous,
    /// Path or URL the pattern pre-filter runs against
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    First,
    /// Import only: candidates whose extension did not match, retried once
    Fallback,
}

pub struct TranslatorSearch {
    mode: Mode,
    target: SearchTarget,
    queue: VecDeque<Arc<TranslatorDescriptor>>,
    deferred: Vec<Arc<TranslatorDescriptor>>,
    found: Vec<FoundTranslator>,
    in_flight: Option<Arc<TranslatorDescriptor>>,
    pass: Pass,
    running: Arc<AtomicBool>,
    finished: bool,
}

impl TranslatorSearch {
    pub fn new(mode: Mode, target: SearchTarget, candidates: Vec<Arc<TranslatorDescriptor>>) -> Self {
        Self {
            mode,
            target,
            queue: candidates.into(),
            deferred: Vec::new(),
            found: Vec::new(),
            in_flight: None,
            pass: Pass::First,
            running: Arc::new(AtomicBool::new(true)),
            finished: false,
        }
    }

    /// Flag that aborts the search when cleared
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fallback_pass(&self) -> bool {
        self.pass == Pass::Fallback
    }

    /// Advance to the next step.
    ///
    /// Calling this while a candidate is in flight is a driver bug; it yields
    /// the same candidate again rather than starting a second one.
    pub fn next(&mut self) -> SearchStep {
        if !self.running.load(Ordering::SeqCst) {
            return SearchStep::Cancelled;
        }
        if let Some(current) = &self.in_flight {
            return SearchStep::Detect(current.clone());
        }
        if self.finished {
            return SearchStep::Finished(self.found.clone());
        }

        loop {
            while let Some(candidate) = self.queue.pop_front() {
                if self.should_detect(&candidate) {
                    self.in_flight = Some(candidate.clone());
                    return SearchStep::Detect(candidate);
                }
            }

            if self.found.is_empty() && self.pass == Pass::First && !self.deferred.is_empty() {
                debug!(count = self.deferred.len(), "No translator matched; retrying ignoring file extensions");
                self.pass = Pass::Fallback;
                self.queue = std::mem::take(&mut self.deferred).into();
                continue;
            }

            self.finished = true;
            return SearchStep::Finished(self.found.clone());
        }
    }

    fn should_detect(&mut self, candidate: &Arc<TranslatorDescriptor>) -> bool {
        let target = match &self.target {
            SearchTarget::Unbound => {
                self.found.push(FoundTranslator {
                    descriptor: candidate.clone(),
                    item_type: None,
                });
                return false;
            }
            SearchTarget::Anonymous => return true,
            SearchTarget::Named(target) => target.as_str(),
        };

        match self.mode {
            Mode::Import if self.pass == Pass::First => {
                if candidate.matches_target(Mode::Import, target) {
                    true
                } else {
                    self.deferred.push(candidate.clone());
                    false
                }
            }
            Mode::Web => candidate.matches_target(Mode::Web, target),
            _ => true,
        }
    }

    /// Record the outcome for the in-flight candidate
    pub fn record(&mut self, descriptor: &TranslatorDescriptor, detection: Detection) {
        match self.in_flight.take() {
            Some(current) if current.id == descriptor.id => {
                if detection.is_found() {
                    self.found.push(FoundTranslator {
                        descriptor: current,
                        item_type: detection.item_type().map(str::to_string),
                    });
                }
            }
            other => {
                debug!(translator = %descriptor.label, "Ignoring detection result for a translator not in flight");
                self.in_flight = other;
            }
        }
    }
}
