//! Run state machine: `Idle → Collecting → Assigning → Applying → Done`, with
//! `Interrupted` when the cancel token fires.
//!
//! Each command maps to a fixed list of phases. A phase either advances to the
//! next one, halts with units left pending (the state stays on that phase), or
//! is interrupted. Every exit out of Collecting saves a checkpoint first.

use crate::applier::{ApplyOutcome, PoolApplier};
use crate::block::{BlockId, BlockLayout, BlockPair};
use crate::checkpoint::{CheckpointPhase, CheckpointRecord, PairProgress};
use crate::checkpoint_manager::CheckpointManager;
use crate::collector::{OverlapCollector, SelectionPolicy};
use crate::error::MergeError;
use crate::executor::{CancelToken, Executor};
use crate::registry::{LabelMap, Registry};
use crate::store::{BlockOutput, BlockStore};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Collecting,
    Assigning,
    Applying,
    Done,
    Interrupted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Collecting => "collecting",
            RunState::Assigning => "assigning",
            RunState::Applying => "applying",
            RunState::Done => "done",
            RunState::Interrupted => "interrupted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Collect,
    Assign,
    Apply,
}

impl Phase {
    pub fn state(self) -> RunState {
        match self {
            Phase::Collect => RunState::Collecting,
            Phase::Assign => RunState::Assigning,
            Phase::Apply => RunState::Applying,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Command {
    /// Build the registry from every pair and assign global labels.
    Pools,
    /// Write relabeled blocks from an assigned registry.
    Apply,
    /// Pools then apply.
    Run,
}

const POOLS: &[Phase] = &[Phase::Collect, Phase::Assign];
const APPLY: &[Phase] = &[Phase::Apply];
const RUN: &[Phase] = &[Phase::Collect, Phase::Assign, Phase::Apply];

impl Command {
    pub fn phases(self) -> &'static [Phase] {
        match self {
            Command::Pools => POOLS,
            Command::Apply => APPLY,
            Command::Run => RUN,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    pub selection: SelectionPolicy,
    pub force_overlap: bool,
    /// Completed pairs between checkpoint saves.
    pub checkpoint_every: usize,
    /// Discard the checkpoint and all outputs before running.
    pub restart: bool,
    /// Rewrite blocks whose output already exists.
    pub reapply: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::default(),
            force_overlap: false,
            checkpoint_every: 1,
            restart: false,
            reapply: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub completed: usize,
    pub skipped: usize,
    pub failed: Vec<UnitFailure>,
    /// Units a re-run will retry.
    pub pending: Vec<String>,
}

impl PhaseReport {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            completed: 0,
            skipped: 0,
            failed: Vec::new(),
            pending: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub command: Command,
    pub state: RunState,
    pub phases: Vec<PhaseReport>,
    /// Global classes, once labels are assigned.
    pub classes: Option<u32>,
}

impl RunReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:?} finished in state {}", self.command, self.state)?;
        if let Some(classes) = self.classes {
            writeln!(f, "  global labels: {}", classes)?;
        }
        for p in &self.phases {
            writeln!(
                f,
                "  {:?}: {} completed, {} skipped, {} failed, {} pending",
                p.phase,
                p.completed,
                p.skipped,
                p.failed.len(),
                p.pending.len()
            )?;
            for failure in &p.failed {
                writeln!(f, "    failed {}: {}", failure.unit, failure.reason)?;
            }
            if !p.pending.is_empty() {
                writeln!(f, "    pending: {}", p.pending.join(", "))?;
            }
        }
        Ok(())
    }
}

enum PhaseOutcome {
    Advance,
    /// Units failed; the run stops on this phase.
    Halt,
    Interrupted,
}

/// Working state of one run, restored from the checkpoint when there is one.
struct Session {
    phase: CheckpointPhase,
    progress: PairProgress,
    registry: Mutex<Registry>,
    labels: Option<LabelMap>,
}

fn poisoned() -> MergeError {
    MergeError::Other("registry lock poisoned".to_string())
}

pub struct RunController<'a, S, O, E>
where
    S: BlockStore,
    O: BlockOutput,
    E: Executor,
{
    store: &'a S,
    output: &'a O,
    executor: &'a E,
    checkpoints: &'a CheckpointManager,
    options: RunOptions,
    cancel: CancelToken,
    state: RunState,
}

impl<'a, S, O, E> RunController<'a, S, O, E>
where
    S: BlockStore,
    O: BlockOutput,
    E: Executor,
{
    pub fn new(
        store: &'a S,
        output: &'a O,
        executor: &'a E,
        checkpoints: &'a CheckpointManager,
        options: RunOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            store,
            output,
            executor,
            checkpoints,
            options,
            cancel,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn run(&mut self, command: Command) -> Result<RunReport, MergeError> {
        self.state = RunState::Idle;
        let store = self.store;
        let layout = store.layout();
        let pairs = layout.pairs();
        info!(
            ?command,
            blocks = layout.len(),
            pairs = pairs.len(),
            keys = layout.total_labels(),
            workers = self.executor.workers(),
            "starting merge"
        );

        if self.options.restart {
            info!("restart requested, discarding checkpoint and outputs");
            self.checkpoints.clear()?;
            self.output.clear()?;
        }

        let mut session = self.resume(layout, &pairs)?;
        let mut report = RunReport {
            command,
            state: RunState::Idle,
            phases: Vec::new(),
            classes: session.labels.as_ref().map(|m| m.class_count()),
        };

        let mut finished = true;
        for &phase in command.phases() {
            if self.cancel.is_cancelled() {
                self.save(layout, &session)?;
                self.state = RunState::Interrupted;
                finished = false;
                break;
            }
            self.state = phase.state();
            let mut phase_report = PhaseReport::new(phase);
            let outcome = match phase {
                Phase::Collect => self.collect(layout, &pairs, &mut session, &mut phase_report)?,
                Phase::Assign => self.assign(layout, &mut session, &mut phase_report)?,
                Phase::Apply => self.apply(layout, &mut session, &mut phase_report)?,
            };
            report.phases.push(phase_report);
            match outcome {
                PhaseOutcome::Advance => {}
                PhaseOutcome::Halt => {
                    finished = false;
                    break;
                }
                PhaseOutcome::Interrupted => {
                    self.state = RunState::Interrupted;
                    finished = false;
                    break;
                }
            }
        }
        if finished {
            self.state = RunState::Done;
        }

        report.state = self.state;
        report.classes = session.labels.as_ref().map(|m| m.class_count());
        info!(state = %self.state, "merge stopped");
        Ok(report)
    }

    fn resume(&self, layout: &BlockLayout, pairs: &[BlockPair]) -> Result<Session, MergeError> {
        let Some(record) = self.checkpoints.load()? else {
            return Ok(Session {
                phase: CheckpointPhase::Collecting,
                progress: PairProgress::new(pairs),
                registry: Mutex::new(Registry::new(layout)?),
                labels: None,
            });
        };
        record.verify_layout(layout, pairs)?;
        let registry = record.restore_registry(layout)?;
        let labels = record.label_map()?;
        if record.phase != CheckpointPhase::Collecting && labels.is_none() {
            return Err(MergeError::CorruptCheckpoint(format!(
                "phase {} without a label table",
                record.phase
            )));
        }
        info!(
            phase = %record.phase,
            done = record.progress.done_count(),
            pending = record.progress.pending_count(),
            "resuming from checkpoint"
        );
        Ok(Session {
            phase: record.phase,
            progress: record.progress,
            registry: Mutex::new(registry),
            labels,
        })
    }

    fn save(&self, layout: &BlockLayout, session: &Session) -> Result<(), MergeError> {
        let registry = session.registry.lock().map_err(|_| poisoned())?;
        let record = CheckpointRecord::new(
            session.phase,
            layout,
            &session.progress,
            &registry,
            session.labels.as_ref(),
        );
        drop(registry);
        self.checkpoints.save(&record)
    }

    fn collect(
        &self,
        layout: &BlockLayout,
        pairs: &[BlockPair],
        session: &mut Session,
        report: &mut PhaseReport,
    ) -> Result<PhaseOutcome, MergeError> {
        if session.phase != CheckpointPhase::Collecting {
            report.completed = session.progress.done_count();
            info!("pairs already collected");
            return Ok(PhaseOutcome::Advance);
        }

        session.progress.clear_failures();
        let units: Vec<(usize, BlockPair)> = session.progress.pending().into_iter().map(|i| (i, pairs[i])).collect();
        info!(pending = units.len(), total = pairs.len(), "collecting overlap evidence");

        let collector = OverlapCollector::new(self.options.selection.clone(), self.options.force_overlap);
        let store = self.store;
        let checkpoint_every = self.options.checkpoint_every.max(1);
        let mut since_save = 0;

        let summary = {
            let registry = &session.registry;
            let progress = &mut session.progress;
            let phase = session.phase;

            // One pair's evidence is merged under the lock as a single unit.
            let work = |(_, pair): &(usize, BlockPair)| -> Result<usize, MergeError> {
                let evidence = collector.collect_pair(store, pair)?;
                let mut registry = registry.lock().map_err(|_| poisoned())?;
                registry.union_all(&evidence)
            };

            let sink = |pos: usize, result: Result<usize, MergeError>| -> Result<(), MergeError> {
                let (i, pair) = units[pos];
                match result {
                    Ok(merged) => {
                        progress.mark_done(i);
                        report.completed += 1;
                        debug!(pair = %pair, merged, "pair merged");
                        since_save += 1;
                        if since_save >= checkpoint_every {
                            since_save = 0;
                            let guard = registry.lock().map_err(|_| poisoned())?;
                            let record = CheckpointRecord::new(phase, layout, progress, &guard, None);
                            drop(guard);
                            self.checkpoints.save(&record)?;
                        }
                    }
                    Err(e) if e.is_contract_violation() => {
                        error!(pair = %pair, error = %e, "aborting run");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(pair = %pair, error = %e, "pair collection failed, left pending");
                        progress.mark_failed(i);
                        report.failed.push(UnitFailure { unit: pair.to_string(), reason: e.to_string() });
                    }
                }
                Ok(())
            };

            self.executor.execute(&units, &self.cancel, work, sink)?
        };

        self.save(layout, session)?;
        report.pending = session
            .progress
            .pending()
            .into_iter()
            .map(|i| {
                let (a, b) = session.progress.pair(i);
                format!("{}-{}", a, b)
            })
            .collect();

        if session.progress.all_done() {
            info!(pairs = pairs.len(), "all pairs collected");
            return Ok(PhaseOutcome::Advance);
        }
        if summary.cancelled {
            info!(pending = report.pending.len(), "collection interrupted");
            return Ok(PhaseOutcome::Interrupted);
        }
        warn!(
            failed = report.failed.len(),
            pending = report.pending.len(),
            "collection incomplete, rerun to retry pending pairs"
        );
        Ok(PhaseOutcome::Halt)
    }

    fn assign(
        &self,
        layout: &BlockLayout,
        session: &mut Session,
        report: &mut PhaseReport,
    ) -> Result<PhaseOutcome, MergeError> {
        if let Some(labels) = &session.labels {
            info!(classes = labels.class_count(), "labels already assigned");
            return Ok(PhaseOutcome::Advance);
        }
        if !session.progress.all_done() {
            return Ok(PhaseOutcome::Halt);
        }

        let map = session.registry.lock().map_err(|_| poisoned())?.assign_labels();
        info!(keys = map.len(), classes = map.class_count(), "assigned global labels");
        report.completed = 1;

        // Outputs of an earlier assignment no longer match.
        self.output.clear()?;
        session.labels = Some(map);
        session.phase = CheckpointPhase::Assigned;
        self.save(layout, session)?;
        Ok(PhaseOutcome::Advance)
    }

    fn apply(
        &self,
        layout: &BlockLayout,
        session: &mut Session,
        report: &mut PhaseReport,
    ) -> Result<PhaseOutcome, MergeError> {
        let map = session.labels.as_ref().ok_or(MergeError::NotAssigned)?;
        let blocks: Vec<BlockId> = layout.block_ids().collect();
        info!(blocks = blocks.len(), reapply = self.options.reapply, "applying global labels");

        let applier = PoolApplier::new(map);
        let (store, output, reapply) = (self.store, self.output, self.options.reapply);
        let summary = self.executor.execute(
            &blocks,
            &self.cancel,
            |&block| applier.apply_block(store, output, block, reapply),
            |pos, result| {
                let block = blocks[pos];
                match result {
                    Ok(ApplyOutcome::Written) => report.completed += 1,
                    Ok(ApplyOutcome::Skipped) => report.skipped += 1,
                    Err(e) => {
                        warn!(block, error = %e, "block apply failed");
                        report.failed.push(UnitFailure { unit: format!("block {}", block), reason: e.to_string() });
                    }
                }
                Ok(())
            },
        )?;

        report.pending = blocks
            .iter()
            .filter(|&&b| !self.output.has_output(b))
            .map(|b| format!("block {}", b))
            .collect();

        if report.pending.is_empty() {
            session.phase = CheckpointPhase::Applied;
            self.save(layout, session)?;
            return Ok(PhaseOutcome::Advance);
        }
        self.save(layout, session)?;
        if summary.cancelled {
            info!(pending = report.pending.len(), "apply interrupted");
            return Ok(PhaseOutcome::Interrupted);
        }
        warn!(failed = report.failed.len(), "apply incomplete, rerun to retry failed blocks");
        Ok(PhaseOutcome::Halt)
    }
}
