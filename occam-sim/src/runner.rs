//! The event loop: pop, dispatch, account, repeat; then the result writers.

use std::{fs, path::PathBuf, time::Instant};

use tracing::info;

use crate::{
    config::SimConfig,
    error::{Result, SimError},
    events::EventKind,
    resolver::Resolver,
    sched::{Engine, SchedulerKind, SimCore, TaskMeta},
    workflow::{WfId, Workflow},
    workload,
};

#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    pub arrivals: u64,
    pub completions: u64,
    pub deadlocks: u64,
    pub end_time: f64,
}

pub struct Runner {
    pub core: SimCore,
    pub engine: Engine,
    pub resolver: Resolver,
    pub kind: SchedulerKind,
    output: Option<PathBuf>,
}

impl Runner {
    /// A runner over an explicit resolver with an empty event queue; seed it
    /// with [`Runner::add_workflow`]. Used directly by the tests.
    pub fn new(resolver: Resolver, kind: SchedulerKind, output: Option<PathBuf>) -> Result<Self> {
        let engine = Engine::for_kind(kind, &resolver)?;
        Ok(Runner {
            core: SimCore::new(),
            engine,
            resolver,
            kind,
            output,
        })
    }

    /// Load the run folder's caches and workload per the configuration.
    pub fn from_config(cfg: &SimConfig) -> Result<Self> {
        let mut resolver = Resolver::from_run_folder(&cfg.regex_folder(), cfg.cache_hit_rate)?;
        resolver.use_dev_opt = cfg.use_dev_opt;
        resolver.dev_opt_threshold = cfg.dev_opt_threshold;
        let mut runner = Runner::new(resolver, cfg.scheduler, Some(cfg.output.clone()))?;
        runner.core.sanity_check = cfg.sanity_check;
        let rows = workload::load(
            &cfg.workload_path(),
            cfg.trace_access,
            cfg.access_profile,
            &runner.resolver,
        )?;
        for row in rows {
            runner.add_workflow(row.workflow, row.start_time, row.exec_time, row.regex);
            if cfg.num_wf > 0 && runner.core.queue.len() >= cfg.num_wf as usize {
                break;
            }
        }
        Ok(runner)
    }

    /// Register a workflow and enqueue its arrival.
    pub fn add_workflow(
        &mut self,
        workflow: Workflow,
        start_time: f64,
        exec_time: f64,
        regex: String,
    ) -> WfId {
        let name = workflow.name.clone();
        let id = self
            .core
            .add_workflow(workflow, TaskMeta::new(start_time, name, exec_time, regex));
        self.core.queue.push(start_time, EventKind::WfArrival, id);
        id
    }

    /// Drain the event queue. Returns the run accounting; the per-workflow
    /// results stay in `core.meta` until [`Runner::write_outputs`].
    pub fn run(&mut self) -> Result<RunSummary> {
        let total_arrivals = self.core.queue.len() as u64;
        let mut arrivals = 0u64;
        let mut completions = 0u64;
        let mut last_logged = 0u64;
        let mut after_all_arrived = 0u64;
        let mut now = 0.0f64;
        let wall = Instant::now();
        info!(scheduler = %self.kind, total = total_arrivals, "start simulation");

        while let Some(ev) = self.core.queue.pop() {
            now = ev.time;
            match ev.kind {
                EventKind::WfArrival => {
                    self.engine
                        .handle_arrival(&mut self.core, &self.resolver, ev.wf, ev.time)?;
                    arrivals += 1;
                }
                EventKind::ObjStart => self.core.handle_obj_start(ev.wf, ev.time),
                EventKind::ObjEnd => self.core.handle_obj_end(ev.wf, ev.time),
                EventKind::WfCompletion => {
                    self.engine
                        .handle_completion(&mut self.core, &self.resolver, ev.wf, ev.time)?;
                    completions += 1;
                }
            }
            if arrivals == total_arrivals {
                after_all_arrived += 1;
            }
            let milestone = arrivals > 0 && arrivals % 10 == 0 && arrivals != last_logged;
            let tail = arrivals == total_arrivals && after_all_arrived % 20 == 0;
            if milestone || tail {
                info!(
                    sim_t = now,
                    exec_s = wall.elapsed().as_secs_f64(),
                    arrivals,
                    arrived_pct = arrivals as f64 / total_arrivals.max(1) as f64 * 100.0,
                    completions,
                    running = self.core.running.len(),
                    pending = self.core.pending.len(),
                    "progress"
                );
                last_logged = arrivals;
            }
        }

        let deadlocks = self.core.deadlocks;
        info!(
            sim_t = now,
            exec_s = wall.elapsed().as_secs_f64(),
            arrivals,
            completions,
            deadlocks,
            "simulation drained"
        );
        if arrivals != completions + deadlocks {
            return Err(SimError::Invariant(format!(
                "{arrivals} arrivals vs {completions} completions and {deadlocks} rollbacks"
            )));
        }
        if self.engine.active_objects() != 0 {
            return Err(SimError::Invariant(
                "lock objects survived the end of the run".to_owned(),
            ));
        }
        Ok(RunSummary {
            arrivals,
            completions,
            deadlocks,
            end_time: now,
        })
    }

    /// Write the result files next to the configured output prefix: the
    /// event log, the per-workflow tables and the two time series.
    pub fn write_outputs(&self) -> Result<()> {
        let Some(base) = &self.output else {
            return Ok(());
        };
        let path_for = |suffix: &str| PathBuf::from(format!("{}{suffix}", base.display()));
        let write = |suffix: &str, contents: String| -> Result<()> {
            let path = path_for(suffix);
            fs::write(&path, contents).map_err(|e| SimError::io(path, e))
        };

        write(".log", self.core.records.concat())?;

        let mut ordered: Vec<&TaskMeta> = self.core.meta.iter().collect();
        ordered.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));

        let mut result = String::new();
        let mut sched = String::new();
        for m in &ordered {
            result.push_str(&format!(
                "{:>12}\t{:>12}\t{:>12}\t{:<50}\t{:>12}\t{:>10}\t{}\n",
                fmt_time(m.start_time),
                fmt_opt(m.actual_start),
                fmt_opt(m.finish),
                m.wf_name,
                fmt_time(m.exec_time),
                m.schedule_time_us,
                m.regex
            ));
            sched.push_str(&format!(
                "{:<50}\t{:>10}\t{:>10}\t{:>10}\t{}\n",
                m.wf_name, m.schedule_time_us, m.insert_time_us, m.delete_time_us, m.regex
            ));
        }
        write(".txt", result)?;
        write("_sch.txt", sched)?;

        let series = |points: &[(f64, usize)]| {
            points
                .iter()
                .map(|(t, n)| format!("({}, {n})\n", fmt_time(*t)))
                .collect::<String>()
        };
        write("_q_len.txt", series(&self.core.pending_q_len))?;
        write("_active_netobj.txt", series(&self.core.active_objs))?;
        Ok(())
    }
}

fn fmt_time(v: f64) -> String {
    format!("{v}")
}

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) => fmt_time(v),
        None => "None".to_owned(),
    }
}
